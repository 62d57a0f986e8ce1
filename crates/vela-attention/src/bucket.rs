//! Sequence-length buckets.
//!
//! NPU kernels are compiled for a fixed set of sequence lengths. Inputs are
//! zero-padded up to the nearest supported bucket and the result is cut back
//! to the original length.

use smallvec::SmallVec;
use vela_core::{Result, VelaError};

pub const DEFAULT_BUCKETS: [usize; 5] = [128, 256, 512, 1024, 2048];
pub const DEFAULT_MAX_SEQ: usize = 2048;
pub const DEFAULT_KV_PAD_MULTIPLE: usize = 128;

/// A validated, strictly increasing set of bucket sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPolicy {
    buckets: SmallVec<[usize; 8]>,
    max_seq: usize,
    kv_pad_multiple: usize,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            buckets: SmallVec::from_slice(&DEFAULT_BUCKETS),
            max_seq: DEFAULT_MAX_SEQ,
            kv_pad_multiple: DEFAULT_KV_PAD_MULTIPLE,
        }
    }
}

impl BucketPolicy {
    pub fn new(buckets: &[usize], max_seq: usize, kv_pad_multiple: usize) -> Result<Self> {
        if buckets.is_empty() {
            return Err(VelaError::InvalidConfig("bucket set is empty".into()));
        }
        if buckets[0] == 0 {
            return Err(VelaError::InvalidConfig("bucket sizes must be non-zero".into()));
        }
        if buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(VelaError::InvalidConfig(format!(
                "bucket sizes must be strictly increasing: {buckets:?}"
            )));
        }
        let largest = buckets[buckets.len() - 1];
        if max_seq < largest {
            return Err(VelaError::InvalidConfig(format!(
                "max supported sequence {max_seq} is below the largest bucket {largest}"
            )));
        }
        if kv_pad_multiple == 0 {
            return Err(VelaError::InvalidConfig("kv pad multiple must be non-zero".into()));
        }
        Ok(Self {
            buckets: SmallVec::from_slice(buckets),
            max_seq,
            kv_pad_multiple,
        })
    }

    pub fn buckets(&self) -> &[usize] {
        &self.buckets
    }

    pub fn max_seq(&self) -> usize {
        self.max_seq
    }

    pub fn kv_pad_multiple(&self) -> usize {
        self.kv_pad_multiple
    }

    /// Smallest bucket `>= seq`, or the configured maximum when `seq` is
    /// larger than every bucket.
    ///
    /// For `seq > max_seq` the result is *smaller* than `seq`; such a length
    /// cannot be padded at all. Use [`covering_bucket`](Self::covering_bucket)
    /// when the result must hold `seq` rows.
    pub fn pad_to_bucket(&self, seq: usize) -> usize {
        self.covering_bucket(seq).unwrap_or(self.max_seq)
    }

    /// Padded length that holds `seq` rows: the smallest bucket `>= seq`,
    /// else `max_seq` if it still fits, else `None`.
    pub fn covering_bucket(&self, seq: usize) -> Option<usize> {
        match self.buckets.iter().find(|&&b| b >= seq) {
            Some(&b) => Some(b),
            None => (seq <= self.max_seq).then_some(self.max_seq),
        }
    }

    /// Rows of zero padding added by [`pad_to_bucket`](Self::pad_to_bucket).
    pub fn padding(&self, seq: usize) -> usize {
        self.pad_to_bucket(seq).saturating_sub(seq)
    }

    /// Whether `seq` is exactly a bucket (no padding needed).
    pub fn is_bucket(&self, seq: usize) -> bool {
        self.buckets.binary_search(&seq).is_ok()
    }

    /// Round a key/value length up to the kv pad multiple.
    pub fn pad_kv(&self, total_len: usize) -> usize {
        pad_to_multiple(total_len, self.kv_pad_multiple)
    }
}

/// Round `n` up to the next multiple of `k` (`k > 0`).
pub fn pad_to_multiple(n: usize, k: usize) -> usize {
    n.div_ceil(k) * k
}
