//! Per-call dispatch decision.
//!
//! A pure function of the sequence length, the total (past + new) length and
//! the engine configuration: the same inputs always produce the same
//! decision.

use std::fmt;

use serde::Serialize;

use crate::bucket::BucketPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// More than one new position (prompt processing).
    Prefill,
    /// Exactly one new position (decode step).
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Path {
    Accelerator,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DispatchDecision {
    pub phase: Phase,
    pub path: Path,
    /// Query rows the kernels see (sequence length after bucket padding).
    pub bucket_size: usize,
    /// Key/value rows the kernels see.
    pub kv_bucket: usize,
}

impl DispatchDecision {
    pub fn is_accelerated(&self) -> bool {
        self.path == Path::Accelerator
    }
}

impl fmt::Display for DispatchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} bucket={} kv_bucket={}",
            self.phase, self.path, self.bucket_size, self.kv_bucket
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    buckets: BucketPolicy,
    enable_accelerator: bool,
    enable_token_path: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::new(BucketPolicy::default(), true, true)
    }
}

impl DispatchPolicy {
    pub fn new(buckets: BucketPolicy, enable_accelerator: bool, enable_token_path: bool) -> Self {
        Self {
            buckets,
            enable_accelerator,
            enable_token_path,
        }
    }

    pub fn buckets(&self) -> &BucketPolicy {
        &self.buckets
    }

    pub fn accelerator_enabled(&self) -> bool {
        self.enable_accelerator
    }

    /// Decide phase, path and padded sizes for `seq` new positions on top of
    /// a cache that will hold `total_len` positions afterwards.
    pub fn decide(&self, seq: usize, total_len: usize) -> DispatchDecision {
        let max = self.buckets.max_seq();
        let phase = if seq > 1 { Phase::Prefill } else { Phase::Token };
        let bucket = match phase {
            Phase::Prefill => self.buckets.covering_bucket(seq),
            Phase::Token => (self.enable_token_path && total_len < max).then_some(1),
        };

        let Some(bucket_size) = bucket.filter(|_| self.enable_accelerator) else {
            return DispatchDecision {
                phase,
                path: Path::Fallback,
                bucket_size: seq,
                kv_bucket: total_len,
            };
        };

        let kv_bucket = match phase {
            Phase::Prefill => bucket_size.max(self.buckets.pad_kv(total_len)),
            Phase::Token => self.buckets.pad_kv(total_len),
        };
        DispatchDecision {
            phase,
            path: Path::Accelerator,
            bucket_size,
            kv_bucket,
        }
    }
}
