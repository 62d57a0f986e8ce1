//! State shared by every attention operator of one engine.

use std::sync::Arc;

use vela_core::Result;
use vela_kernels::{EmulatedNpu, KernelInventory, KernelRegistry, NpuDevice};

use crate::config::EngineConfig;
use crate::dispatch::DispatchPolicy;
use crate::mask::AttentionMaskCache;
use crate::rotary::RotaryStore;

/// Configuration plus the caches that are expensive to build and safe to
/// share: the causal mask tables, lazily built rotary tables and the kernel
/// registry.
///
/// Everything in here is read-only after construction or internally locked,
/// so one `Arc<AttentionContext>` can back many operator instances.
#[derive(Debug)]
pub struct AttentionContext {
    config: EngineConfig,
    policy: DispatchPolicy,
    masks: Arc<AttentionMaskCache>,
    rotary: RotaryStore,
    registry: KernelRegistry,
}

impl AttentionContext {
    /// Context backed by the emulated NPU.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        Self::with_device(config, Arc::new(EmulatedNpu::new()))
    }

    pub fn with_device(config: EngineConfig, device: Arc<dyn NpuDevice>) -> Result<Arc<Self>> {
        config.validate()?;
        let policy = config.dispatch_policy()?;
        let masks = Arc::new(AttentionMaskCache::build(&config.mask_lut_sizes));
        let registry = KernelRegistry::new(device, config.execution_mode);
        tracing::info!(
            "attention context: device={} accelerator={} token_path={} buckets={:?} mode={:?}",
            registry.device().name(),
            config.enable_accelerator,
            config.enable_token_path,
            config.bucket_sizes,
            config.execution_mode
        );
        Ok(Arc::new(Self {
            config,
            policy,
            masks,
            rotary: RotaryStore::new(),
            registry,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn masks(&self) -> &Arc<AttentionMaskCache> {
        &self.masks
    }

    pub fn rotary(&self) -> &RotaryStore {
        &self.rotary
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    /// Dry-run records of every kernel invocation.
    pub fn inventory(&self) -> &Arc<KernelInventory> {
        self.registry.inventory()
    }
}
