//! Rotary position embedding tables.
//!
//! The host passes cos/sin as `[max_len, head_dim / 2]`. The NPU rope kernel
//! wants one full `head_dim` row per position, so the table is expanded once:
//! rotate-half duplicates the row into both halves (`c0 c1 .. c0 c1 ..`),
//! interleaved duplicates pairwise (`c0 c0 c1 c1 ..`). The expanded table is
//! stored in bf16 as `[2, max_len, head_dim]` (cos block, then sin block).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use half::bf16;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use vela_core::{Result, Tensor, VelaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotaryLayout {
    /// Rotate `(x[k], x[k + D/2])`.
    #[default]
    RotateHalf,
    /// Rotate `(x[2k], x[2k + 1])`.
    Interleaved,
}

impl RotaryLayout {
    pub fn from_interleaved(interleaved: bool) -> Self {
        if interleaved {
            RotaryLayout::Interleaved
        } else {
            RotaryLayout::RotateHalf
        }
    }

    pub fn is_interleaved(&self) -> bool {
        matches!(self, RotaryLayout::Interleaved)
    }
}

/// Expanded, bf16 cos/sin table.
#[derive(Debug, Clone)]
pub struct RotaryCache {
    layout: RotaryLayout,
    max_len: usize,
    head_dim: usize,
    table: Vec<bf16>,
}

impl RotaryCache {
    /// Expand `[max_len, half_dim]` cos/sin matrices.
    pub fn build(
        cos: &[f32],
        sin: &[f32],
        max_len: usize,
        half_dim: usize,
        layout: RotaryLayout,
    ) -> Result<Self> {
        if half_dim == 0 || max_len == 0 {
            return Err(VelaError::InvalidShape(format!(
                "rotary table [{max_len}, {half_dim}] is empty"
            )));
        }
        let n = max_len * half_dim;
        if cos.len() != n || sin.len() != n {
            return Err(VelaError::ShapeMismatch {
                expected: vec![max_len, half_dim],
                got: vec![cos.len(), sin.len()],
            });
        }

        let head_dim = 2 * half_dim;
        let mut table = vec![bf16::ZERO; 2 * max_len * head_dim];
        let (cos_out, sin_out) = table.split_at_mut(max_len * head_dim);
        for (src, dst) in [(cos, cos_out), (sin, sin_out)] {
            for pos in 0..max_len {
                let row = &src[pos * half_dim..(pos + 1) * half_dim];
                let out = &mut dst[pos * head_dim..(pos + 1) * head_dim];
                for (k, &v) in row.iter().enumerate() {
                    let v = bf16::from_f32(v);
                    match layout {
                        RotaryLayout::RotateHalf => {
                            out[k] = v;
                            out[k + half_dim] = v;
                        }
                        RotaryLayout::Interleaved => {
                            out[2 * k] = v;
                            out[2 * k + 1] = v;
                        }
                    }
                }
            }
        }

        Ok(Self {
            layout,
            max_len,
            head_dim,
            table,
        })
    }

    /// Build from 2-d cos/sin tensors (`[max_len, half_dim]`, f32 or bf16).
    pub fn from_tensors(cos: &Tensor, sin: &Tensor, layout: RotaryLayout) -> Result<Self> {
        let (max_len, half_dim) = table_dims(cos, sin)?;
        Self::build(&cos.to_f32_vec(), &sin.to_f32_vec(), max_len, half_dim, layout)
    }

    /// Cos and sin rows for positions `[offset, offset + len)`, each
    /// `len × head_dim` elements.
    pub fn lookup(&self, offset: usize, len: usize) -> Result<(&[bf16], &[bf16])> {
        if offset + len > self.max_len {
            return Err(VelaError::InvalidShape(format!(
                "rotary lookup [{offset}, {}) exceeds table of {} positions",
                offset + len,
                self.max_len
            )));
        }
        let block = self.max_len * self.head_dim;
        let start = offset * self.head_dim;
        let end = start + len * self.head_dim;
        Ok((&self.table[start..end], &self.table[block + start..block + end]))
    }

    pub fn layout(&self) -> RotaryLayout {
        self.layout
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// Validate a cos/sin pair and return `(max_len, half_dim)`.
pub fn table_dims(cos: &Tensor, sin: &Tensor) -> Result<(usize, usize)> {
    if cos.dims() != sin.dims() {
        return Err(VelaError::ShapeMismatch {
            expected: cos.dims().to_vec(),
            got: sin.dims().to_vec(),
        });
    }
    match *cos.dims() {
        [max_len, half_dim] => Ok((max_len, half_dim)),
        _ => Err(VelaError::InvalidShape(format!(
            "cos/sin cache must be 2-d [max_len, head_dim/2], got {}",
            cos.shape()
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RotaryKey {
    layout: RotaryLayout,
    max_len: usize,
    half_dim: usize,
}

/// Rotary tables built lazily from runtime cos/sin inputs.
///
/// The first call for a given layout and table geometry builds the table;
/// every later call, from any operator sharing the store, reuses it.
#[derive(Debug, Default)]
pub struct RotaryStore {
    tables: Mutex<HashMap<RotaryKey, Arc<RotaryCache>>>,
    builds: AtomicUsize,
}

impl RotaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&self, cos: &Tensor, sin: &Tensor, layout: RotaryLayout) -> Result<Arc<RotaryCache>> {
        let (max_len, half_dim) = table_dims(cos, sin)?;
        let key = RotaryKey {
            layout,
            max_len,
            half_dim,
        };
        let mut tables = self.tables.lock();
        if let Some(t) = tables.get(&key) {
            return Ok(Arc::clone(t));
        }
        let built = Arc::new(RotaryCache::from_tensors(cos, sin, layout)?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "rotary cache built: {} positions, head_dim {}, {:?}",
            max_len,
            2 * half_dim,
            layout
        );
        tables.insert(key, Arc::clone(&built));
        Ok(built)
    }

    /// Tables built so far.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_core::DType;

    fn tables(max_len: usize, half: usize) -> (Vec<f32>, Vec<f32>) {
        let cos = (0..max_len * half).map(|i| (i as f32 * 0.1).cos()).collect();
        let sin = (0..max_len * half).map(|i| (i as f32 * 0.1).sin()).collect();
        (cos, sin)
    }

    #[test]
    fn test_rotate_half_duplication() {
        let (cos, sin) = tables(6, 4);
        let rc = RotaryCache::build(&cos, &sin, 6, 4, RotaryLayout::RotateHalf).unwrap();
        let (c, s) = rc.lookup(0, 6).unwrap();
        for pos in 0..6 {
            for d in 0..4 {
                assert_eq!(c[pos * 8 + d], c[pos * 8 + d + 4]);
                assert_eq!(s[pos * 8 + d], s[pos * 8 + d + 4]);
                assert_eq!(c[pos * 8 + d], bf16::from_f32(cos[pos * 4 + d]));
            }
        }
    }

    #[test]
    fn test_interleaved_duplication() {
        let (cos, sin) = tables(2, 3);
        let rc = RotaryCache::build(&cos, &sin, 2, 3, RotaryLayout::Interleaved).unwrap();
        let (c, _) = rc.lookup(1, 1).unwrap();
        for k in 0..3 {
            assert_eq!(c[2 * k], c[2 * k + 1]);
            assert_eq!(c[2 * k], bf16::from_f32(cos[3 + k]));
        }
    }

    #[test]
    fn test_lookup_offset_and_range() {
        let (cos, sin) = tables(4, 2);
        let rc = RotaryCache::build(&cos, &sin, 4, 2, RotaryLayout::RotateHalf).unwrap();
        let (c, s) = rc.lookup(2, 2).unwrap();
        assert_eq!(c.len(), 8);
        assert_eq!(s.len(), 8);
        assert_eq!(c[0], bf16::from_f32(cos[4]));
        assert!(matches!(rc.lookup(3, 2), Err(VelaError::InvalidShape(_))));
    }

    #[test]
    fn test_bad_table_shape() {
        assert!(RotaryCache::build(&[1.0; 5], &[0.0; 5], 3, 2, RotaryLayout::RotateHalf).is_err());
    }

    #[test]
    fn test_store_builds_once_per_geometry() {
        let (cos, sin) = tables(8, 2);
        let cos = Tensor::from_vec(cos, &[8, 2]).unwrap();
        let sin = Tensor::from_vec(sin, &[8, 2]).unwrap();
        let store = RotaryStore::new();
        let a = store.get_or_build(&cos, &sin, RotaryLayout::RotateHalf).unwrap();
        let b = store.get_or_build(&cos, &sin, RotaryLayout::RotateHalf).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.build_count(), 1);
        store.get_or_build(&cos, &sin, RotaryLayout::Interleaved).unwrap();
        assert_eq!(store.build_count(), 2);
    }

    #[test]
    fn test_store_rejects_mismatched_tables() {
        let cos = Tensor::zeros(&[8, 2], DType::F32).unwrap();
        let sin = Tensor::zeros(&[8, 4], DType::F32).unwrap();
        assert!(RotaryStore::new().get_or_build(&cos, &sin, RotaryLayout::RotateHalf).is_err());
    }
}
