//! Host-facing attention operators.
//!
//! Each operator instance owns its scratch pool and is driven through
//! `compute(&mut self, ..)`; instances built from the same
//! [`AttentionContext`](crate::context::AttentionContext) share mask tables,
//! rotary tables and kernels.

pub mod gqa;
pub mod mha;
pub mod rope;

pub use gqa::{GqaAttributes, GqaInputs, GroupQueryAttention};
pub use mha::{MhaAttributes, MhaInputs, MultiHeadAttention};
pub use rope::{RotaryAttributes, RotaryEmbedding, RotaryInputs};

use vela_core::{Result, Tensor, VelaError};

/// Per-batch past lengths from an i32/i64 `[batch]` tensor.
pub(crate) fn past_lengths(t: &Tensor) -> Result<Vec<usize>> {
    if t.dims().len() != 1 {
        return Err(VelaError::InvalidShape(format!(
            "past_seq_lens must be 1-d, got {}",
            t.shape()
        )));
    }
    t.to_index_vec()
}

/// A scalar (or single-element) length tensor.
pub(crate) fn scalar_length(t: &Tensor, name: &str) -> Result<usize> {
    match t.to_index_vec()?.as_slice() {
        [n] => Ok(*n),
        _ => Err(VelaError::InvalidShape(format!(
            "{name} must hold one value, got shape {}",
            t.shape()
        ))),
    }
}

pub(crate) fn check_scale(scale: f32) -> Result<Option<f32>> {
    if !scale.is_finite() || scale < 0.0 {
        return Err(VelaError::InvalidAttribute {
            name: "scale",
            reason: format!("{scale} is not a finite non-negative number"),
        });
    }
    Ok((scale > 0.0).then_some(scale))
}
