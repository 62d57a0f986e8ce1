use std::fmt;

use serde::{Deserialize, Serialize};

/// Element types a Vela tensor can carry.
///
/// Only [`DType::BF16`] and [`DType::F32`] are accepted by the attention
/// operators; the integer types exist for position metadata (sequence lengths,
/// position ids) and `F16` exists so that host inputs in that format can be
/// named and rejected rather than silently reinterpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 16-bit Brain Float (same exponent range as F32, reduced mantissa)
    BF16,
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::BF16 | DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::I64 => 8,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype, or `None`
    /// if that overflows `usize`.
    pub fn storage_bytes(&self, n: usize) -> Option<usize> {
        self.element_size().checked_mul(n)
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::BF16 | DType::F16 | DType::F32)
    }

    /// Whether the attention datapaths accept this dtype for activations.
    pub fn is_attention_supported(&self) -> bool {
        matches!(self, DType::BF16 | DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::BF16 => write!(f, "bf16"),
            DType::F16 => write!(f, "f16"),
            DType::F32 => write!(f, "f32"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::BF16.element_size(), 2);
        assert_eq!(DType::F32.element_size(), 4);
        assert_eq!(DType::I64.element_size(), 8);
        assert_eq!(DType::BF16.storage_bytes(10), Some(20));
        assert_eq!(DType::F32.storage_bytes(usize::MAX / 2), None);
    }

    #[test]
    fn test_attention_support() {
        assert!(DType::BF16.is_attention_supported());
        assert!(DType::F32.is_attention_supported());
        assert!(!DType::F16.is_attention_supported());
        assert!(!DType::I32.is_attention_supported());
        assert!(DType::F16.is_float());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", DType::BF16), "bf16");
        assert_eq!(format!("{}", DType::F32), "f32");
    }
}
