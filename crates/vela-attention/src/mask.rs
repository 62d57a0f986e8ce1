//! Attention masks: a shared causal lookup table plus transient masks.
//!
//! Masks are additive bf16 biases of shape `[rows, kv_len]`: `0` keeps a
//! key position, [`MASKED`] (negative infinity) removes it. The kernel library
//! adds the mask to the scores before the softmax.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use half::bf16;
use parking_lot::Mutex;
use vela_core::{Result, VelaError};

/// Additive bias for a masked position.
pub const MASKED: bf16 = bf16::NEG_INFINITY;

/// Additive bias for a visible position.
pub const VISIBLE: bf16 = bf16::ZERO;

/// Fill `out` (`[padded_rows, kv_len]`) with a causal mask.
///
/// Row `i < rows` sees keys `[0, past + i]`; rows `>= rows` are padding and
/// fully masked.
pub fn fill_causal(out: &mut [bf16], rows: usize, kv_len: usize, past: usize) {
    for (i, row) in out.chunks_exact_mut(kv_len).enumerate() {
        let visible = if i < rows { (past + i + 1).min(kv_len) } else { 0 };
        row[..visible].fill(VISIBLE);
        row[visible..].fill(MASKED);
    }
}

/// Fill `out` (`[padded_rows, kv_len]`) with a non-causal mask.
///
/// Every real row sees keys `[0, past + rows)`; padding rows are fully masked.
pub fn fill_full(out: &mut [bf16], rows: usize, kv_len: usize, past: usize) {
    let visible = (past + rows).min(kv_len);
    for (i, row) in out.chunks_exact_mut(kv_len).enumerate() {
        let v = if i < rows { visible } else { 0 };
        row[..v].fill(VISIBLE);
        row[v..].fill(MASKED);
    }
}

/// Causal masks for a fixed set of square sizes, built once.
#[derive(Debug, Default)]
pub struct AttentionMaskCache {
    luts: BTreeMap<usize, Arc<[bf16]>>,
}

impl AttentionMaskCache {
    pub fn build(sizes: &[usize]) -> Self {
        let mut luts = BTreeMap::new();
        for &size in sizes {
            if size == 0 || luts.contains_key(&size) {
                continue;
            }
            let mut data = vec![MASKED; size * size];
            fill_causal(&mut data, size, size, 0);
            luts.insert(size, Arc::from(data));
        }
        tracing::info!(
            "mask cache: {} causal tables ({:?})",
            luts.len(),
            luts.keys().collect::<Vec<_>>()
        );
        Self { luts }
    }

    pub fn has_lut(&self, size: usize) -> bool {
        self.luts.contains_key(&size)
    }

    pub fn get_lut(&self, size: usize) -> Option<&Arc<[bf16]>> {
        self.luts.get(&size)
    }

    pub fn sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.luts.keys().copied()
    }
}

/// What a caller needs a mask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskRequest {
    /// Real query rows.
    pub rows: usize,
    /// Rows after bucket padding.
    pub padded_rows: usize,
    /// Cached positions before the first query row.
    pub past: usize,
    /// Key columns after padding.
    pub kv_len: usize,
    pub causal: bool,
}

impl MaskRequest {
    fn lut_size(&self) -> Option<usize> {
        let square = self.rows == self.padded_rows && self.padded_rows == self.kv_len;
        (self.causal && self.past == 0 && square).then_some(self.rows)
    }
}

/// A mask handed out by [`AttenMaskProvider`].
#[derive(Debug)]
pub enum MaskRef {
    /// Shared read-only table entry.
    Lut { size: usize, data: Arc<[bf16]> },
    /// Single-use mask; must go back through
    /// [`AttenMaskProvider::free_if_transient`].
    Transient {
        rows: usize,
        cols: usize,
        data: Vec<bf16>,
    },
}

impl MaskRef {
    pub fn as_slice(&self) -> &[bf16] {
        match self {
            MaskRef::Lut { data, .. } => &data[..],
            MaskRef::Transient { data, .. } => &data[..],
        }
    }

    /// `(rows, cols)`.
    pub fn dims(&self) -> (usize, usize) {
        match self {
            MaskRef::Lut { size, .. } => (*size, *size),
            MaskRef::Transient { rows, cols, .. } => (*rows, *cols),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, MaskRef::Transient { .. })
    }
}

/// Hands out LUT masks where possible and builds transient ones otherwise.
///
/// Released transient storage is kept and reused for later masks that fit.
#[derive(Debug)]
pub struct AttenMaskProvider {
    cache: Arc<AttentionMaskCache>,
    free: Mutex<Vec<Vec<bf16>>>,
    outstanding: AtomicUsize,
}

impl AttenMaskProvider {
    pub fn new(cache: Arc<AttentionMaskCache>) -> Self {
        Self {
            cache,
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<AttentionMaskCache> {
        &self.cache
    }

    pub fn get_mask(&self, req: MaskRequest) -> Result<MaskRef> {
        if req.rows == 0 || req.padded_rows < req.rows {
            return Err(VelaError::InvalidShape(format!(
                "mask: {} rows cannot be padded to {}",
                req.rows, req.padded_rows
            )));
        }
        if req.kv_len < req.past + req.rows {
            return Err(VelaError::InvalidShape(format!(
                "mask: {} key columns cannot hold {} past + {} new positions",
                req.kv_len, req.past, req.rows
            )));
        }

        if let Some(size) = req.lut_size() {
            if let Some(data) = self.cache.get_lut(size) {
                return Ok(MaskRef::Lut {
                    size,
                    data: Arc::clone(data),
                });
            }
        }

        let n = req.padded_rows * req.kv_len;
        let mut data = self.take_storage(n);
        if req.causal {
            fill_causal(&mut data, req.rows, req.kv_len, req.past);
        } else {
            fill_full(&mut data, req.rows, req.kv_len, req.past);
        }
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "transient mask [{}, {}] (rows={} past={} causal={})",
            req.padded_rows,
            req.kv_len,
            req.rows,
            req.past,
            req.causal
        );
        Ok(MaskRef::Transient {
            rows: req.padded_rows,
            cols: req.kv_len,
            data,
        })
    }

    /// Release a mask obtained from [`get_mask`](Self::get_mask). No-op for
    /// LUT entries.
    pub fn free_if_transient(&self, mask: MaskRef) {
        if let MaskRef::Transient { data, .. } = mask {
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
            self.free.lock().push(data);
        }
    }

    /// Transient masks handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn take_storage(&self, n: usize) -> Vec<bf16> {
        let mut free = self.free.lock();
        // Smallest released buffer that fits.
        let best = free
            .iter()
            .enumerate()
            .filter(|(_, v)| v.capacity() >= n)
            .min_by_key(|(_, v)| v.capacity())
            .map(|(i, _)| i);
        let mut data = match best {
            Some(i) => free.swap_remove(i),
            None => Vec::with_capacity(n),
        };
        data.clear();
        data.resize(n, MASKED);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn provider(sizes: &[usize]) -> AttenMaskProvider {
        AttenMaskProvider::new(Arc::new(AttentionMaskCache::build(sizes)))
    }

    #[test]
    fn test_lut_is_lower_triangular() {
        let cache = AttentionMaskCache::build(&[4]);
        let m = cache.get_lut(4).unwrap();
        for i in 0..4 {
            for j in 0..4 {
                assert_eq!(m[i * 4 + j] == VISIBLE, j <= i, "({i},{j})");
            }
        }
        assert!(!cache.has_lut(8));
    }

    #[test]
    fn test_lut_used_only_for_plain_square() {
        let p = provider(&[4]);
        let plain = MaskRequest {
            rows: 4,
            padded_rows: 4,
            past: 0,
            kv_len: 4,
            causal: true,
        };
        assert!(!p.get_mask(plain).unwrap().is_transient());

        let with_past = MaskRequest {
            rows: 2,
            padded_rows: 4,
            past: 2,
            kv_len: 4,
            ..plain
        };
        let m = p.get_mask(with_past).unwrap();
        assert!(m.is_transient());
        assert_eq!(p.outstanding(), 1);
        p.free_if_transient(m);
        assert_eq!(p.outstanding(), 0);
    }

    #[test]
    fn test_padding_rows_fully_masked() {
        let p = provider(&[]);
        let m = p
            .get_mask(MaskRequest {
                rows: 300,
                padded_rows: 512,
                past: 0,
                kv_len: 512,
                causal: true,
            })
            .unwrap();
        let data = m.as_slice();
        let masked_rows = (0..512)
            .filter(|&i| data[i * 512..(i + 1) * 512].iter().all(|&v| v == MASKED))
            .count();
        assert_eq!(masked_rows, 212);
        p.free_if_transient(m);
    }

    #[test]
    fn test_full_mask_prefix() {
        let p = provider(&[]);
        let m = p
            .get_mask(MaskRequest {
                rows: 2,
                padded_rows: 3,
                past: 1,
                kv_len: 4,
                causal: false,
            })
            .unwrap();
        let d = m.as_slice();
        assert_eq!(&d[0..4], &[VISIBLE, VISIBLE, VISIBLE, MASKED]);
        assert_eq!(&d[4..8], &[VISIBLE, VISIBLE, VISIBLE, MASKED]);
        assert!(d[8..12].iter().all(|&v| v == MASKED));
    }

    #[test]
    fn test_transient_storage_recycled() {
        let p = provider(&[]);
        let big = MaskRequest {
            rows: 8,
            padded_rows: 8,
            past: 0,
            kv_len: 16,
            causal: true,
        };
        let m = p.get_mask(big).unwrap();
        let ptr = m.as_slice().as_ptr();
        p.free_if_transient(m);

        let small = MaskRequest {
            rows: 2,
            padded_rows: 4,
            kv_len: 4,
            ..big
        };
        let m2 = p.get_mask(small).unwrap();
        assert_eq!(m2.as_slice().as_ptr(), ptr);
        assert_eq!(m2.as_slice().len(), 16);
        p.free_if_transient(m2);
    }

    #[test]
    fn test_rejects_short_kv() {
        let p = provider(&[]);
        let req = MaskRequest {
            rows: 4,
            padded_rows: 4,
            past: 2,
            kv_len: 5,
            causal: true,
        };
        assert!(matches!(p.get_mask(req), Err(VelaError::InvalidShape(_))));
    }

    proptest! {
        #[test]
        fn prop_causal_visibility(c in 1usize..24, pad in 0usize..8, past in 0usize..24, extra in 0usize..8) {
            let p = provider(&[]);
            let kv_len = past + c + extra;
            let m = p.get_mask(MaskRequest {
                rows: c,
                padded_rows: c + pad,
                past,
                kv_len,
                causal: true,
            }).unwrap();
            let d = m.as_slice();
            for i in 0..c {
                for j in 0..past + c {
                    prop_assert_eq!(d[i * kv_len + j] == VISIBLE, j <= i + past);
                }
            }
            p.free_if_transient(m);
        }
    }
}
