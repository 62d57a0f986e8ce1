//! Kernel registry: init-once loading and guarded invocation.
//!
//! Each kernel kind is loaded from the device at most once per registry and
//! cached for reuse. Every invocation validates buffer lengths, syncs inputs
//! to the device, executes, and syncs the output back.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use vela_core::Result;

use crate::device::{NpuDevice, NpuKernel};
use crate::emulated::EmulatedNpu;
use crate::error::KernelError;
use crate::inventory::KernelInventory;
use crate::kernel::{KernelArgs, KernelKind, KernelShape};

/// How kernel failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Failures abort the call.
    #[default]
    Normal,
    /// Every invocation is recorded in the inventory; failures are logged and
    /// swallowed.
    DryRun,
}

pub struct KernelRegistry {
    device: Arc<dyn NpuDevice>,
    mode: ExecutionMode,
    kernels: Mutex<HashMap<KernelKind, Arc<dyn NpuKernel>>>,
    inits: AtomicUsize,
    inventory: Arc<KernelInventory>,
}

impl KernelRegistry {
    pub fn new(device: Arc<dyn NpuDevice>, mode: ExecutionMode) -> Self {
        Self {
            device,
            mode,
            kernels: Mutex::new(HashMap::new()),
            inits: AtomicUsize::new(0),
            inventory: Arc::new(KernelInventory::new()),
        }
    }

    /// Registry backed by the host emulation of the kernel library.
    pub fn emulated(mode: ExecutionMode) -> Self {
        Self::new(Arc::new(EmulatedNpu::new()), mode)
    }

    pub fn device(&self) -> &Arc<dyn NpuDevice> {
        &self.device
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn inventory(&self) -> &Arc<KernelInventory> {
        &self.inventory
    }

    /// Number of kernels loaded so far.
    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::Relaxed)
    }

    /// Get the kernel for `kind`, loading it on first use.
    pub fn kernel(&self, kind: KernelKind) -> std::result::Result<Arc<dyn NpuKernel>, KernelError> {
        let mut map = self.kernels.lock();
        if let Some(k) = map.get(&kind) {
            return Ok(Arc::clone(k));
        }
        let kernel = self.device.load_kernel(kind)?;
        self.inits.fetch_add(1, Ordering::Relaxed);
        tracing::info!("loaded kernel {} on {}", kind, self.device.name());
        map.insert(kind, Arc::clone(&kernel));
        Ok(kernel)
    }

    /// Run `kind` on `args`.
    ///
    /// In [`ExecutionMode::DryRun`] the outcome is recorded and a failure
    /// leaves the output buffer with unspecified contents instead of
    /// returning an error.
    pub fn invoke(&self, kind: KernelKind, shape: &KernelShape, mut args: KernelArgs<'_>) -> Result<()> {
        let outcome = self.run(kind, shape, &mut args);
        match self.mode {
            ExecutionMode::Normal => outcome.map_err(|e| e.into_vela(kind, shape)),
            ExecutionMode::DryRun => {
                match outcome {
                    Ok(()) => self.inventory.record_ok(kind, *shape),
                    Err(e) => {
                        tracing::warn!("dry-run: kernel {} {} failed: {}", kind, shape, e);
                        self.inventory.record_failure(kind, *shape, e.to_string());
                    }
                }
                Ok(())
            }
        }
    }

    fn run(
        &self,
        kind: KernelKind,
        shape: &KernelShape,
        args: &mut KernelArgs<'_>,
    ) -> std::result::Result<(), KernelError> {
        shape.validate(kind, args)?;
        let kernel = self.kernel(kind)?;

        for input in &args.inputs {
            self.device.sync_to_device(bytemuck::cast_slice(*input))?;
        }
        if kind.is_in_place() {
            self.device.sync_to_device(bytemuck::cast_slice(&*args.output))?;
        }
        kernel.execute(shape, args)?;
        self.device
            .sync_from_device(bytemuck::cast_slice_mut(&mut *args.output))?;
        Ok(())
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("device", &self.device.name())
            .field("mode", &self.mode)
            .field("loaded", &self.kernels.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;
    use vela_core::VelaError;

    fn softmax_args<'a>(x: &'a [bf16], m: &'a [bf16], out: &'a mut [bf16]) -> KernelArgs<'a> {
        KernelArgs::new(&[x, m], out)
    }

    #[test]
    fn test_kernel_loaded_once() {
        let npu = Arc::new(EmulatedNpu::new());
        let reg = KernelRegistry::new(npu.clone(), ExecutionMode::Normal);
        let shape = KernelShape::attention(1, 1, 1, 2, 1);
        let x = vec![bf16::ONE; 2];
        let m = vec![bf16::ZERO; 2];
        for _ in 0..5 {
            let mut out = vec![bf16::ZERO; 2];
            reg.invoke(KernelKind::Softmax, &shape, softmax_args(&x, &m, &mut out))
                .unwrap();
            assert_eq!(out[0].to_f32(), 0.5);
        }
        assert_eq!(reg.init_count(), 1);
        assert_eq!(npu.kernel_loads(), 1);
        // two inputs in, one output back, per call
        assert_eq!(npu.bytes_to_device(), 5 * 8);
        assert_eq!(npu.bytes_from_device(), 5 * 4);
    }

    #[test]
    fn test_normal_mode_propagates() {
        let reg = KernelRegistry::new(
            Arc::new(EmulatedNpu::failing(KernelKind::Softmax)),
            ExecutionMode::Normal,
        );
        let shape = KernelShape::attention(1, 1, 1, 1, 1);
        let x = [bf16::ZERO];
        let mut out = [bf16::ZERO];
        let err = reg
            .invoke(KernelKind::Softmax, &shape, softmax_args(&x, &x, &mut out))
            .unwrap_err();
        assert!(err.is_kernel());
        match err {
            VelaError::Kernel { kernel, shape, .. } => {
                assert_eq!(kernel, "softmax");
                assert!(shape.contains("rows=1"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(reg.inventory().is_empty());
    }

    #[test]
    fn test_dry_run_swallows_and_records() {
        let reg = KernelRegistry::new(
            Arc::new(EmulatedNpu::failing(KernelKind::Softmax)),
            ExecutionMode::DryRun,
        );
        let shape = KernelShape::attention(1, 1, 1, 1, 1);
        let x = [bf16::ZERO];
        let mut out = [bf16::ZERO];
        reg.invoke(KernelKind::Softmax, &shape, softmax_args(&x, &x, &mut out))
            .unwrap();
        let entries = reg.inventory().entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].ok);
        assert!(entries[0].message.as_deref().unwrap_or("").contains("injected"));
    }

    #[test]
    fn test_bad_lengths_are_kernel_errors() {
        let reg = KernelRegistry::emulated(ExecutionMode::Normal);
        let shape = KernelShape::attention(1, 1, 2, 2, 1);
        let x = [bf16::ZERO; 3];
        let mut out = [bf16::ZERO; 4];
        let err = reg
            .invoke(KernelKind::Softmax, &shape, softmax_args(&x, &x, &mut out))
            .unwrap_err();
        assert!(err.is_kernel());
        // Validation happens before loading.
        assert_eq!(reg.init_count(), 0);
    }
}
