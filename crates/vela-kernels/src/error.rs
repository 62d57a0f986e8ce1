//! Kernel-library errors.

use vela_core::VelaError;

use crate::kernel::{KernelKind, KernelShape};

/// Errors raised by an NPU device or one of its kernels.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("kernel '{kernel}' failed to initialise: {msg}")]
    Init { kernel: &'static str, msg: String },

    #[error("kernel '{kernel}' rejected its arguments: {msg}")]
    BadArguments { kernel: &'static str, msg: String },

    #[error("kernel '{kernel}' execution failed: {msg}")]
    Execution { kernel: &'static str, msg: String },

    #[error("device sync failed: {0}")]
    Sync(String),
}

impl KernelError {
    pub fn execution(kind: KernelKind, msg: impl Into<String>) -> Self {
        KernelError::Execution {
            kernel: kind.name(),
            msg: msg.into(),
        }
    }

    pub fn bad_arguments(kind: KernelKind, msg: impl Into<String>) -> Self {
        KernelError::BadArguments {
            kernel: kind.name(),
            msg: msg.into(),
        }
    }

    /// Attach the invocation shape and lift into the workspace error type.
    pub fn into_vela(self, kind: KernelKind, shape: &KernelShape) -> VelaError {
        VelaError::Kernel {
            kernel: kind.name().to_string(),
            shape: shape.to_string(),
            message: self.to_string(),
        }
    }
}

impl From<KernelError> for VelaError {
    fn from(e: KernelError) -> Self {
        let kernel = match &e {
            KernelError::Init { kernel, .. }
            | KernelError::BadArguments { kernel, .. }
            | KernelError::Execution { kernel, .. } => kernel.to_string(),
            KernelError::Sync(_) => "device".to_string(),
        };
        VelaError::Kernel {
            kernel,
            shape: "?".to_string(),
            message: e.to_string(),
        }
    }
}
