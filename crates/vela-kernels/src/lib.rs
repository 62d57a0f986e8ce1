//! # vela-kernels
//!
//! NPU kernel contract and its implementations for Vela.
//!
//! Provides:
//! - The kernel calling contract (`KernelKind`, `KernelShape`, `KernelArgs`)
//! - `NpuDevice` / `NpuKernel` traits at the device boundary
//! - `KernelRegistry`, loading each kernel once and guarding every invocation
//! - `EmulatedNpu`, a host emulation of the bf16 kernel library
//! - `KernelInventory` for dry-run coverage reports
//! - f32 CPU kernels for the fallback datapath

pub mod device;
pub mod emulated;
pub mod error;
pub mod fallback;
pub mod inventory;
pub mod kernel;
pub mod registry;

pub use device::{NpuDevice, NpuKernel};
pub use emulated::EmulatedNpu;
pub use error::KernelError;
pub use inventory::{CoverageReport, InventoryEntry, KernelInventory};
pub use kernel::{KernelArgs, KernelKind, KernelShape};
pub use registry::{ExecutionMode, KernelRegistry};
