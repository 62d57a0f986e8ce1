//! Tagged, growable buffer pool for attention scratch memory.
//!
//! Every transient tensor of an attention call (split Q/K/V, padded copies,
//! scores, masks, outputs) lives in a buffer keyed by its semantic role, a
//! [`BufferTag`]. A tag's buffer is allocated lazily, reused as long as it is
//! large enough, and replaced by a bigger one (requested size × growth factor)
//! when it is not. Buffers mapped for the accelerator are expensive to
//! register, so the pool never shrinks a tag and never frees the current
//! buffer before teardown.
//!
//! Replaced buffers become *retired generations*. They are never handed out
//! again, and [`BufferPool::reclaim`] drops them once no lease still
//! references them. Retained memory is bounded by the current capacities plus
//! whatever callers still hold.
//!
//! ```
//! use vela_core::pool::{BufferPool, BufferTag, PoolConfig};
//! use vela_core::DType;
//!
//! let pool = BufferPool::new(PoolConfig::default()).unwrap();
//! let a = pool.acquire_typed(BufferTag::Scores, DType::F32, 16).unwrap();
//! let b = pool.acquire_typed(BufferTag::Scores, DType::F32, 8).unwrap();
//! assert_eq!(a.as_ptr(), b.as_ptr());
//! ```

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::element::Element;
use crate::error::VelaError;
use crate::Result;

/// Alignment of every pooled allocation (one cache line, enough for any SIMD
/// load and for device-side buffer mapping).
pub const POOL_ALIGN: usize = 64;

/// Semantic role of a pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferTag {
    /// Query heads split out of the packed input, `[heads, seq, head_dim]`.
    QueryScratch,
    /// Key heads split out of the packed input, `[kv_heads, seq, head_dim]`.
    KeyScratch,
    /// Value heads split out of the packed input, `[kv_heads, seq, head_dim]`.
    ValueScratch,
    /// Query padded to the sequence bucket.
    PaddedQuery,
    /// Past + current keys padded to the kv bucket.
    PaddedKey,
    /// Past + current values padded to the kv bucket.
    PaddedValue,
    /// `Q·Kᵀ` scores.
    Scores,
    /// Softmax output.
    Probabilities,
    /// Kernel-facing copy of a transient attention mask.
    AttentionMask,
    /// Padded attention output, `[heads, seq_bucket, head_dim]`.
    AttentionOutput,
    /// Input/output of the standalone rotary-embedding kernel.
    RotaryScratch,
}

impl BufferTag {
    pub const ALL: [BufferTag; 11] = [
        BufferTag::QueryScratch,
        BufferTag::KeyScratch,
        BufferTag::ValueScratch,
        BufferTag::PaddedQuery,
        BufferTag::PaddedKey,
        BufferTag::PaddedValue,
        BufferTag::Scores,
        BufferTag::Probabilities,
        BufferTag::AttentionMask,
        BufferTag::AttentionOutput,
        BufferTag::RotaryScratch,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BufferTag::QueryScratch => "query-scratch",
            BufferTag::KeyScratch => "key-scratch",
            BufferTag::ValueScratch => "value-scratch",
            BufferTag::PaddedQuery => "padded-query",
            BufferTag::PaddedKey => "padded-key",
            BufferTag::PaddedValue => "padded-value",
            BufferTag::Scores => "scores",
            BufferTag::Probabilities => "probabilities",
            BufferTag::AttentionMask => "attention-mask",
            BufferTag::AttentionOutput => "attention-output",
            BufferTag::RotaryScratch => "rotary-scratch",
        }
    }

    /// Smallest allocation ever made for this tag.
    ///
    /// Score-shaped buffers scale with `seq × kv_len` and start larger.
    pub fn default_min_bytes(&self) -> usize {
        match self {
            BufferTag::Scores | BufferTag::Probabilities | BufferTag::AttentionMask => 64 * 1024,
            _ => 16 * 1024,
        }
    }
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pool sizing knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Multiplier applied to the requested size when a tag must grow (> 1).
    pub growth_factor: f32,
    /// Floor applied on top of every tag's default minimum.
    pub min_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            growth_factor: 2.0,
            min_bytes: 0,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.growth_factor > 1.0) || !self.growth_factor.is_finite() {
            return Err(VelaError::InvalidConfig(format!(
                "pool growth_factor must be a finite value > 1, got {}",
                self.growth_factor
            )));
        }
        Ok(())
    }
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Allocations made (first-use and growth).
    pub allocations: u64,
    /// Allocations that replaced a smaller buffer.
    pub grows: u64,
    /// Bytes held by current buffers.
    pub live_bytes: usize,
    /// Bytes held by retired generations not yet reclaimed.
    pub retired_bytes: usize,
    /// Bytes released by `reclaim`.
    pub reclaimed_bytes: usize,
}

// ============================================================================
// Aligned allocation
// ============================================================================

/// Zero-initialised, 64-byte aligned heap block.
struct AlignedBytes {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: AlignedBytes uniquely owns its allocation; access is mediated by the
// Mutex in PoolBuffer.
unsafe impl Send for AlignedBytes {}
unsafe impl Sync for AlignedBytes {}

impl AlignedBytes {
    fn zeroed(nbytes: usize, what: BufferTag) -> Result<Self> {
        let size = nbytes.max(POOL_ALIGN);
        let layout = Layout::from_size_align(size, POOL_ALIGN).map_err(|_| VelaError::OutOfMemory {
            what: what.name().to_string(),
            bytes: size,
        })?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| VelaError::OutOfMemory {
            what: what.name().to_string(),
            bytes: size,
        })?;
        Ok(Self { ptr, layout })
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBytes {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// ============================================================================
// Buffers and leases
// ============================================================================

/// One generation of a tag's buffer.
pub struct PoolBuffer {
    tag: BufferTag,
    generation: u64,
    base: usize,
    capacity: usize,
    bytes: Mutex<AlignedBytes>,
}

impl PoolBuffer {
    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.base as *const u8
    }
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("tag", &self.tag)
            .field("generation", &self.generation)
            .field("base", &format_args!("{:#x}", self.base))
            .finish()
    }
}

/// A borrowed view of a pooled buffer for the duration of one call.
///
/// The lease keeps its generation alive even if the tag is grown meanwhile.
/// Typed leases (from [`BufferPool::acquire_typed`]) know their element type
/// and refuse to be viewed as anything else.
#[derive(Clone)]
pub struct PoolLease {
    buffer: Arc<PoolBuffer>,
    dtype: Option<DType>,
    len_bytes: usize,
}

impl PoolLease {
    pub fn tag(&self) -> BufferTag {
        self.buffer.tag
    }

    pub fn generation(&self) -> u64 {
        self.buffer.generation
    }

    pub fn dtype(&self) -> Option<DType> {
        self.dtype
    }

    /// Bytes requested for this lease (≤ capacity).
    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Base address of the underlying allocation (identity, not for deref).
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    /// Lock the leased bytes.
    pub fn lock_bytes(&self) -> BytesGuard<'_> {
        BytesGuard {
            guard: self.buffer.bytes.lock(),
            len: self.len_bytes,
        }
    }

    /// Lock the lease as a typed slice of exactly the requested length.
    pub fn lock<T: Element>(&self) -> Result<LeaseGuard<'_, T>> {
        match self.dtype {
            Some(dt) if dt == T::DTYPE => {}
            Some(dt) => {
                return Err(VelaError::DTypeMismatch {
                    expected: dt,
                    got: T::DTYPE,
                })
            }
            None => {
                return Err(VelaError::UntypedLease {
                    tag: self.tag().name(),
                    requested: T::DTYPE,
                })
            }
        }
        Ok(LeaseGuard {
            guard: self.buffer.bytes.lock(),
            len_bytes: self.len_bytes,
            _marker: PhantomData,
        })
    }
}

impl fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLease")
            .field("tag", &self.tag())
            .field("generation", &self.generation())
            .field("dtype", &self.dtype)
            .field("len_bytes", &self.len_bytes)
            .finish()
    }
}

/// Exclusive access to a lease's bytes.
pub struct BytesGuard<'a> {
    guard: MutexGuard<'a, AlignedBytes>,
    len: usize,
}

impl Deref for BytesGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.as_slice()[..self.len]
    }
}

impl DerefMut for BytesGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.guard.as_mut_slice()[..len]
    }
}

/// Exclusive typed access to a lease.
pub struct LeaseGuard<'a, T: Element> {
    guard: MutexGuard<'a, AlignedBytes>,
    len_bytes: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> Deref for LeaseGuard<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        bytemuck::cast_slice(&self.guard.as_slice()[..self.len_bytes])
    }
}

impl<T: Element> DerefMut for LeaseGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        let len = self.len_bytes;
        bytemuck::cast_slice_mut(&mut self.guard.as_mut_slice()[..len])
    }
}

// ============================================================================
// Pool
// ============================================================================

struct PoolInner {
    current: HashMap<BufferTag, Arc<PoolBuffer>>,
    retired: Vec<Arc<PoolBuffer>>,
    stats: PoolStats,
}

/// Keyed pool of reusable, size-growing scratch buffers.
///
/// Owned by one operator instance. Internally locked so leases can be filled
/// from fork-join tasks of the same call.
pub struct BufferPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(PoolInner {
                current: HashMap::new(),
                retired: Vec::new(),
                stats: PoolStats::default(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Minimum allocation for `tag` under this pool's configuration.
    pub fn tag_minimum(&self, tag: BufferTag) -> usize {
        tag.default_min_bytes().max(self.config.min_bytes)
    }

    /// Borrow at least `min_bytes` of untyped memory for `tag`.
    pub fn acquire(&self, tag: BufferTag, min_bytes: usize) -> Result<PoolLease> {
        let buffer = self.buffer_for(tag, min_bytes)?;
        Ok(PoolLease {
            buffer,
            dtype: None,
            len_bytes: min_bytes,
        })
    }

    /// Borrow room for `numel` elements of `dtype` for `tag`.
    pub fn acquire_typed(&self, tag: BufferTag, dtype: DType, numel: usize) -> Result<PoolLease> {
        let nbytes = dtype.storage_bytes(numel).ok_or_else(|| out_of_memory(tag, usize::MAX))?;
        let buffer = self.buffer_for(tag, nbytes)?;
        Ok(PoolLease {
            buffer,
            dtype: Some(dtype),
            len_bytes: nbytes,
        })
    }

    fn buffer_for(&self, tag: BufferTag, min_bytes: usize) -> Result<Arc<PoolBuffer>> {
        let mut inner = self.inner.lock();

        let (capacity, generation) = match inner.current.get(&tag) {
            Some(buf) => {
                let cap = buf.capacity();
                if cap >= min_bytes {
                    return Ok(Arc::clone(buf));
                }
                (self.grown_capacity(tag, min_bytes)?, buf.generation + 1)
            }
            None => {
                let wanted = min_bytes.max(self.tag_minimum(tag));
                (round_up(wanted, POOL_ALIGN).ok_or_else(|| out_of_memory(tag, wanted))?, 0)
            }
        };

        let bytes = AlignedBytes::zeroed(capacity, tag)?;
        let base = bytes.ptr.as_ptr() as usize;
        let capacity = bytes.len();
        let fresh = Arc::new(PoolBuffer {
            tag,
            generation,
            base,
            capacity,
            bytes: Mutex::new(bytes),
        });

        inner.stats.allocations += 1;
        inner.stats.live_bytes += capacity;
        if let Some(old) = inner.current.insert(tag, Arc::clone(&fresh)) {
            let old_cap = old.capacity();
            inner.stats.grows += 1;
            inner.stats.live_bytes -= old_cap;
            inner.stats.retired_bytes += old_cap;
            tracing::debug!(
                "pool: {} grew {} -> {} bytes (generation {})",
                tag,
                old_cap,
                capacity,
                generation
            );
            inner.retired.push(old);
        } else {
            tracing::trace!("pool: {} allocated {} bytes", tag, capacity);
        }

        Ok(fresh)
    }

    fn grown_capacity(&self, tag: BufferTag, min_bytes: usize) -> Result<usize> {
        let grown = (min_bytes as f64 * self.config.growth_factor as f64).ceil();
        if !grown.is_finite() || grown > (isize::MAX as usize - POOL_ALIGN) as f64 {
            return Err(out_of_memory(tag, min_bytes));
        }
        round_up((grown as usize).max(min_bytes), POOL_ALIGN).ok_or_else(|| out_of_memory(tag, min_bytes))
    }

    /// Drop retired generations that no lease references any more.
    ///
    /// Returns the number of bytes released.
    pub fn reclaim(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0usize;
        inner.retired.retain(|buf| {
            // The pool never clones a retired buffer, so the count only falls.
            if Arc::strong_count(buf) == 1 {
                released += buf.capacity();
                false
            } else {
                true
            }
        });
        inner.stats.retired_bytes -= released;
        inner.stats.reclaimed_bytes += released;
        released
    }

    /// Current generation of `tag`, if it has been allocated.
    pub fn generation(&self, tag: BufferTag) -> Option<u64> {
        self.inner.lock().current.get(&tag).map(|b| b.generation)
    }

    /// Current capacity of `tag`, if it has been allocated.
    pub fn capacity(&self, tag: BufferTag) -> Option<usize> {
        self.inner.lock().current.get(&tag).map(|b| b.capacity())
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats.clone()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BufferPool")
            .field("tags", &inner.current.len())
            .field("retired", &inner.retired.len())
            .field("live_bytes", &inner.stats.live_bytes)
            .finish()
    }
}

/// `None` when the rounded size would not fit a single allocation.
fn round_up(n: usize, align: usize) -> Option<usize> {
    let rounded = n.checked_add(align - 1)? & !(align - 1);
    (rounded <= isize::MAX as usize - align).then_some(rounded)
}

fn out_of_memory(tag: BufferTag, bytes: usize) -> VelaError {
    VelaError::OutOfMemory {
        what: tag.name().to_string(),
        bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    fn pool() -> BufferPool {
        BufferPool::new(PoolConfig::default()).unwrap()
    }

    #[test]
    fn test_first_acquire_uses_tag_minimum() {
        let p = pool();
        let lease = p.acquire(BufferTag::KeyScratch, 10).unwrap();
        assert_eq!(lease.len_bytes(), 10);
        assert_eq!(lease.capacity(), BufferTag::KeyScratch.default_min_bytes());
        assert_eq!(lease.generation(), 0);
    }

    #[test]
    fn test_same_or_smaller_returns_identical_buffer() {
        let p = pool();
        let a = p.acquire(BufferTag::Scores, 100_000).unwrap();
        let b = p.acquire(BufferTag::Scores, 100_000).unwrap();
        let c = p.acquire(BufferTag::Scores, 10).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(a.as_ptr(), c.as_ptr());
        assert_eq!(p.stats().allocations, 1);
    }

    #[test]
    fn test_grow_applies_factor_and_bumps_generation() {
        let p = pool();
        let small = p.acquire(BufferTag::PaddedKey, 1000).unwrap();
        let want = BufferTag::PaddedKey.default_min_bytes() + 1;
        let big = p.acquire(BufferTag::PaddedKey, want).unwrap();
        assert_ne!(small.as_ptr(), big.as_ptr());
        assert!(big.capacity() >= want * 2);
        assert_eq!(big.generation(), 1);

        // Later requests keep getting the new generation, never the old one.
        let again = p.acquire(BufferTag::PaddedKey, 8).unwrap();
        assert_eq!(again.as_ptr(), big.as_ptr());
        assert_ne!(again.as_ptr(), small.as_ptr());
        assert_eq!(p.stats().grows, 1);
    }

    #[test]
    fn test_never_shrinks() {
        let p = pool();
        p.acquire(BufferTag::Scores, 1 << 20).unwrap();
        let cap = p.capacity(BufferTag::Scores).unwrap();
        p.acquire(BufferTag::Scores, 16).unwrap();
        assert_eq!(p.capacity(BufferTag::Scores), Some(cap));
    }

    #[test]
    fn test_reclaim_keeps_leased_generations() {
        let p = pool();
        let old = p.acquire(BufferTag::QueryScratch, 64).unwrap();
        let _new = p.acquire(BufferTag::QueryScratch, 1 << 16).unwrap();
        assert!(p.stats().retired_bytes > 0);

        assert_eq!(p.reclaim(), 0, "old generation is still leased");
        drop(old);
        assert!(p.reclaim() > 0);
        assert_eq!(p.stats().retired_bytes, 0);
    }

    #[test]
    fn test_typed_lease_checks_dtype() {
        let p = pool();
        let lease = p.acquire_typed(BufferTag::PaddedQuery, DType::BF16, 32).unwrap();
        {
            let mut view = lease.lock::<bf16>().unwrap();
            assert_eq!(view.len(), 32);
            view[3] = bf16::from_f32(2.0);
        }
        assert_eq!(lease.lock::<bf16>().unwrap()[3].to_f32(), 2.0);
        assert!(matches!(
            lease.lock::<f32>(),
            Err(VelaError::DTypeMismatch { .. })
        ));

        let raw = p.acquire(BufferTag::Scores, 16).unwrap();
        assert!(matches!(raw.lock::<f32>(), Err(VelaError::UntypedLease { .. })));
        assert_eq!(raw.lock_bytes().len(), 16);
    }

    #[test]
    fn test_allocations_are_aligned_and_zeroed() {
        let p = pool();
        let lease = p.acquire_typed(BufferTag::Probabilities, DType::F32, 1000).unwrap();
        assert_eq!(lease.as_ptr() as usize % POOL_ALIGN, 0);
        assert!(lease.lock::<f32>().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_invalid_growth_factor() {
        let cfg = PoolConfig {
            growth_factor: 1.0,
            min_bytes: 0,
        };
        assert!(matches!(BufferPool::new(cfg), Err(VelaError::InvalidConfig(_))));
    }

    #[test]
    fn test_oversized_requests_are_out_of_memory() {
        let p = pool();
        assert!(matches!(
            p.acquire(BufferTag::Scores, usize::MAX - 8),
            Err(VelaError::OutOfMemory { .. })
        ));
        assert!(matches!(
            p.acquire(BufferTag::Scores, isize::MAX as usize),
            Err(VelaError::OutOfMemory { .. })
        ));
        assert!(matches!(
            p.acquire_typed(BufferTag::Scores, DType::F32, usize::MAX / 2),
            Err(VelaError::OutOfMemory { .. })
        ));
        assert_eq!(p.capacity(BufferTag::Scores), None);

        // Growing an existing tag past the limit fails the same way.
        let _lease = p.acquire(BufferTag::Scores, 64).unwrap();
        assert!(matches!(
            p.acquire(BufferTag::Scores, usize::MAX - 8),
            Err(VelaError::OutOfMemory { .. })
        ));
        assert_eq!(p.stats().grows, 0);
    }

    #[test]
    fn test_min_bytes_floor() {
        let cfg = PoolConfig {
            growth_factor: 1.5,
            min_bytes: 1 << 20,
        };
        let p = BufferPool::new(cfg).unwrap();
        let lease = p.acquire(BufferTag::ValueScratch, 1).unwrap();
        assert_eq!(lease.capacity(), 1 << 20);
    }

    #[test]
    fn test_concurrent_fill_of_distinct_tags() {
        let p = pool();
        let k = p.acquire_typed(BufferTag::PaddedKey, DType::F32, 4096).unwrap();
        let v = p.acquire_typed(BufferTag::PaddedValue, DType::F32, 4096).unwrap();
        rayon::join(
            || k.lock::<f32>().unwrap().fill(1.0),
            || v.lock::<f32>().unwrap().fill(2.0),
        );
        assert!(k.lock::<f32>().unwrap().iter().all(|&x| x == 1.0));
        assert!(v.lock::<f32>().unwrap().iter().all(|&x| x == 2.0));
    }
}
