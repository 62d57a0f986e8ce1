//! Error type shared by every Vela crate.

use crate::dtype::DType;

/// Errors raised while configuring or running attention operators.
///
/// None of these are retried: configuration and type errors are fatal for the
/// operator, resource and kernel errors are fatal for the invocation.
#[derive(Debug, thiserror::Error)]
pub enum VelaError {
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(DType),

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("missing required attribute '{0}'")]
    MissingAttribute(&'static str),

    #[error("invalid attribute '{name}': {reason}")]
    InvalidAttribute { name: &'static str, reason: String },

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("buffer '{tag}' was acquired untyped and cannot be viewed as {requested}")]
    UntypedLease { tag: &'static str, requested: DType },

    #[error("out of memory: could not allocate {bytes} bytes for {what}")]
    OutOfMemory { what: String, bytes: usize },

    #[error("kernel '{kernel}' failed for shape {shape}: {message}")]
    Kernel {
        kernel: String,
        shape: String,
        message: String,
    },

    #[error("kv-cache layout cannot switch from {from} to {to} mid-request")]
    KvModeSwitch {
        from: &'static str,
        to: &'static str,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl VelaError {
    /// Whether this error originates from the accelerator kernel library.
    pub fn is_kernel(&self) -> bool {
        matches!(self, VelaError::Kernel { .. })
    }
}
