//! KV-cache update engine.
//!
//! The persistent cache is a pair of `[batch, kv_heads, seq, head_dim]`
//! tensors owned by the caller. Two physical layouts are supported:
//!
//! - **growing**: `seq` is exactly the number of positions seen so far; every
//!   call produces a present tensor of `total_len` rows, copying the past in.
//! - **shared buffer**: `seq` is a fixed capacity `max_seq`; past and present
//!   are the same buffer and only rows `[past, past + new)` are written.
//!
//! Kernel inputs are separate padded copies (`[kv_heads, bucket, head_dim]`)
//! built from the cache before write-back, so write-back can overlap with the
//! attention kernels.

use half::bf16;
use vela_core::element::cast_slice_into;
use vela_core::{DType, Element, Result, Tensor, VelaError};

/// Physical layout of a KV cache for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvMode {
    Growing,
    SharedBuffer { max_seq: usize },
}

impl KvMode {
    /// Shared-buffer when the cache can already hold `total_len` rows.
    pub fn select(capacity: usize, total_len: usize) -> Self {
        if capacity >= total_len {
            KvMode::SharedBuffer { max_seq: capacity }
        } else {
            KvMode::Growing
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, KvMode::SharedBuffer { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            KvMode::Growing => "growing",
            KvMode::SharedBuffer { .. } => "shared-buffer",
        }
    }
}

/// Enforces that a request, once in shared-buffer mode, stays there.
#[derive(Debug, Default)]
pub struct KvModeTracker {
    active: Option<KvMode>,
}

impl KvModeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the mode of this call. `new_request` is true when every past
    /// length is zero.
    pub fn observe(&mut self, mode: KvMode, new_request: bool) -> Result<()> {
        if !new_request {
            if let Some(active) = self.active {
                if active.is_shared() && !mode.is_shared() {
                    return Err(VelaError::KvModeSwitch {
                        from: active.name(),
                        to: mode.name(),
                    });
                }
            }
        }
        self.active = Some(mode);
        Ok(())
    }

    pub fn active(&self) -> Option<KvMode> {
        self.active
    }
}

/// Persistent key/value cache tensors.
#[derive(Debug, Clone)]
pub struct KvCacheTensors {
    pub key: Tensor,
    pub value: Tensor,
}

impl KvCacheTensors {
    pub fn new(key: Tensor, value: Tensor) -> Result<Self> {
        if key.dims() != value.dims() {
            return Err(VelaError::ShapeMismatch {
                expected: key.dims().to_vec(),
                got: value.dims().to_vec(),
            });
        }
        if key.dtype() != value.dtype() {
            return Err(VelaError::DTypeMismatch {
                expected: key.dtype(),
                got: value.dtype(),
            });
        }
        key.ensure_attention_dtype()?;
        key.shape().dims4("kv cache")?;
        Ok(Self { key, value })
    }

    /// An empty growing cache (zero rows).
    pub fn empty(batch: usize, kv_heads: usize, head_dim: usize, dtype: DType) -> Result<Self> {
        Self::with_capacity(batch, kv_heads, 0, head_dim, dtype)
    }

    /// A zeroed cache with room for `max_seq` rows (shared-buffer when
    /// `max_seq` covers the request).
    pub fn with_capacity(
        batch: usize,
        kv_heads: usize,
        max_seq: usize,
        head_dim: usize,
        dtype: DType,
    ) -> Result<Self> {
        let dims = [batch, kv_heads, max_seq, head_dim];
        Self::new(Tensor::zeros(&dims, dtype)?, Tensor::zeros(&dims, dtype)?)
    }

    /// `(batch, kv_heads, seq, head_dim)`.
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        let d = self.key.dims();
        (d[0], d[1], d[2], d[3])
    }

    /// Rows available per (batch, head).
    pub fn capacity(&self) -> usize {
        self.dims().2
    }

    pub fn dtype(&self) -> DType {
        self.key.dtype()
    }

    /// Make both tensors ready to receive `total_len` rows under `mode`.
    pub fn prepare(&mut self, mode: KvMode, total_len: usize) -> Result<()> {
        prepare_present(&mut self.key, mode, total_len)?;
        prepare_present(&mut self.value, mode, total_len)
    }
}

/// Resize a growing cache tensor to `total_len` rows, keeping existing rows.
/// Shared-buffer tensors are left untouched.
pub fn prepare_present(cache: &mut Tensor, mode: KvMode, total_len: usize) -> Result<()> {
    let (b, h, t, d) = cache.shape().dims4("kv cache")?;
    match mode {
        KvMode::SharedBuffer { max_seq } => {
            if max_seq != t || t < total_len {
                return Err(VelaError::InvalidShape(format!(
                    "shared kv buffer of {t} rows cannot hold {total_len}"
                )));
            }
            Ok(())
        }
        KvMode::Growing => {
            if t == total_len {
                return Ok(());
            }
            let keep = t.min(total_len);
            let mut present = Tensor::zeros(&[b, h, total_len, d], cache.dtype())?;
            if keep * d > 0 {
                match cache.dtype() {
                    DType::BF16 => regrow(cache.as_slice::<bf16>()?, present.as_mut_slice::<bf16>()?, t, total_len, keep, d),
                    DType::F32 => regrow(cache.as_slice::<f32>()?, present.as_mut_slice::<f32>()?, t, total_len, keep, d),
                    other => return Err(VelaError::UnsupportedDType(other)),
                }
            }
            tracing::trace!("kv cache grown {} -> {} rows", t, total_len);
            *cache = present;
            Ok(())
        }
    }
}

fn regrow<T: Element>(src: &[T], dst: &mut [T], old_t: usize, new_t: usize, keep_rows: usize, d: usize) {
    let keep = keep_rows * d;
    for (o, n) in src.chunks_exact(old_t * d).zip(dst.chunks_exact_mut(new_t * d)) {
        n[..keep].copy_from_slice(&o[..keep]);
    }
}

/// Write `current` (`[kv_heads, new_len, head_dim]`) into rows
/// `[past, past + new_len)` of batch entry `batch`.
pub fn write_rows<S: Element>(
    cache: &mut Tensor,
    batch: usize,
    past: usize,
    current: &[S],
    new_len: usize,
) -> Result<()> {
    let (b, h, t, d) = cache.shape().dims4("kv cache")?;
    if batch >= b || past + new_len > t || current.len() != h * new_len * d {
        return Err(VelaError::InvalidShape(format!(
            "cannot write {} elements as rows [{past}, {}) of batch {batch} into kv cache {}",
            current.len(),
            past + new_len,
            cache.shape()
        )));
    }
    match cache.dtype() {
        DType::BF16 => scatter(cache.as_mut_slice::<bf16>()?, batch, past, current, h, t, d, new_len),
        DType::F32 => scatter(cache.as_mut_slice::<f32>()?, batch, past, current, h, t, d, new_len),
        other => return Err(VelaError::UnsupportedDType(other)),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn scatter<S: Element, T: Element>(
    dst: &mut [T],
    batch: usize,
    past: usize,
    src: &[S],
    heads: usize,
    t: usize,
    d: usize,
    new_len: usize,
) {
    for head in 0..heads {
        let at = ((batch * heads + head) * t + past) * d;
        let rows = &src[head * new_len * d..(head + 1) * new_len * d];
        cast_slice_into(rows, &mut dst[at..at + new_len * d]);
    }
}

/// Build the padded kernel input for batch entry `batch`: cache rows
/// `[0, past)`, then `current` (`[kv_heads, new_len, head_dim]`), then zeros
/// up to `bucket_len` rows. `out` is `[kv_heads, bucket_len, head_dim]`.
pub fn concat_padded<S: Element, D: Element>(
    cache: &Tensor,
    batch: usize,
    past: usize,
    current: &[S],
    new_len: usize,
    bucket_len: usize,
    out: &mut [D],
) -> Result<()> {
    let (b, h, t, d) = cache.shape().dims4("kv cache")?;
    if batch >= b || past > t || past + new_len > bucket_len {
        return Err(VelaError::InvalidShape(format!(
            "cannot pad {past} past + {new_len} new rows of batch {batch} to {bucket_len} (cache {})",
            cache.shape()
        )));
    }
    if d == 0 || current.len() != h * new_len * d || out.len() != h * bucket_len * d {
        return Err(VelaError::InvalidShape(format!(
            "kv concat: current has {} elements (want {}), output {} (want {})",
            current.len(),
            h * new_len * d,
            out.len(),
            h * bucket_len * d
        )));
    }
    match cache.dtype() {
        DType::BF16 => gather(cache.as_slice::<bf16>()?, batch, past, current, h, t, d, new_len, bucket_len, out),
        DType::F32 => gather(cache.as_slice::<f32>()?, batch, past, current, h, t, d, new_len, bucket_len, out),
        other => return Err(VelaError::UnsupportedDType(other)),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn gather<C: Element, S: Element, D: Element>(
    cache: &[C],
    batch: usize,
    past: usize,
    current: &[S],
    heads: usize,
    t: usize,
    d: usize,
    new_len: usize,
    bucket_len: usize,
    out: &mut [D],
) {
    for (head, dst) in out.chunks_exact_mut(bucket_len * d).enumerate() {
        let at = (batch * heads + head) * t * d;
        let (past_dst, rest) = dst.split_at_mut(past * d);
        let (new_dst, pad_dst) = rest.split_at_mut(new_len * d);
        cast_slice_into(&cache[at..at + past * d], past_dst);
        cast_slice_into(&current[head * new_len * d..(head + 1) * new_len * d], new_dst);
        pad_dst.fill(D::default());
    }
}

/// Append `current` (`[kv_heads, new_len, head_dim]`) for batch entry
/// `batch`, whose cache already holds `past` rows.
///
/// The tensor is first brought to `total_len` rows for `mode` (a no-op once
/// it is there), so the first entry of a call resizes and later entries only
/// write. Growing mode keeps rows `[0, past)` and appends; shared-buffer mode
/// writes the new slice in place at stride `max_seq`.
pub fn update<S: Element>(
    cache: &mut Tensor,
    batch: usize,
    past: usize,
    current: &[S],
    new_len: usize,
    mode: KvMode,
    total_len: usize,
) -> Result<()> {
    prepare_present(cache, mode, total_len)?;
    write_rows(cache, batch, past, current, new_len)
}
