//! Device and kernel traits.
//!
//! A device hands out compiled kernels and moves host-writable buffers across
//! the host/device boundary. Serialising access to the device is the
//! implementation's job; callers only guarantee that every buffer a kernel
//! reads is fully written and synced before the kernel runs.

use std::sync::Arc;

use crate::error::KernelError;
use crate::kernel::{KernelArgs, KernelKind, KernelShape};

pub trait NpuDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Compile or load the kernel for `kind`. Called at most once per kind by
    /// [`KernelRegistry`](crate::registry::KernelRegistry).
    fn load_kernel(&self, kind: KernelKind) -> Result<Arc<dyn NpuKernel>, KernelError>;

    /// Flush host writes to `bytes` so the device observes them.
    fn sync_to_device(&self, bytes: &[u8]) -> Result<(), KernelError>;

    /// Make device writes to `bytes` visible on the host.
    fn sync_from_device(&self, bytes: &mut [u8]) -> Result<(), KernelError>;
}

pub trait NpuKernel: Send + Sync {
    fn kind(&self) -> KernelKind;

    /// Run on buffers already validated against `shape`.
    fn execute(&self, shape: &KernelShape, args: &mut KernelArgs<'_>) -> Result<(), KernelError>;
}
