//! Engine configuration.
//!
//! Read once (defaults, a JSON file, or `VELA_*` environment variables) and
//! turned into a [`DispatchPolicy`]. Nothing here is consulted per call.

use std::path::Path;

use serde::{Deserialize, Serialize};
use vela_core::{PoolConfig, Result, VelaError};
use vela_kernels::ExecutionMode;

use crate::bucket::{BucketPolicy, DEFAULT_BUCKETS, DEFAULT_KV_PAD_MULTIPLE, DEFAULT_MAX_SEQ};
use crate::dispatch::DispatchPolicy;

/// Settings shared by every attention operator of one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Master switch for the NPU datapath.
    pub enable_accelerator: bool,

    /// Allow single-token (decode) calls on the NPU datapath.
    pub enable_token_path: bool,

    /// Longest sequence the NPU kernels accept.
    pub max_supported_seq: usize,

    /// Sequence buckets the kernels are compiled for, strictly increasing.
    pub bucket_sizes: Vec<usize>,

    /// Key/value lengths are padded up to a multiple of this.
    pub kv_pad_multiple: usize,

    /// Square causal masks precomputed at startup.
    pub mask_lut_sizes: Vec<usize>,

    /// Scratch buffer pool sizing.
    pub pool: PoolConfig,

    /// `normal` propagates kernel failures, `dry_run` records them.
    pub execution_mode: ExecutionMode,

    /// Overlap K/V padding and cache write-back with the attention kernels.
    pub overlap_stages: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_accelerator: true,
            enable_token_path: true,
            max_supported_seq: DEFAULT_MAX_SEQ,
            bucket_sizes: DEFAULT_BUCKETS.to_vec(),
            kv_pad_multiple: DEFAULT_KV_PAD_MULTIPLE,
            mask_lut_sizes: vec![128, 256, 512],
            pool: PoolConfig::default(),
            execution_mode: ExecutionMode::Normal,
            overlap_stages: true,
        }
    }
}

impl EngineConfig {
    /// Everything on the fallback datapath.
    pub fn fallback_only() -> Self {
        Self {
            enable_accelerator: false,
            ..Self::default()
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| VelaError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `VELA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by `VELA_*` pairs from `vars`.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `VELA_ENABLE_ACCELERATOR` | `enable_accelerator` |
    /// | `VELA_ENABLE_TOKEN_PATH` | `enable_token_path` |
    /// | `VELA_MAX_SEQ` | `max_supported_seq` |
    /// | `VELA_BUCKETS` | `bucket_sizes` (comma separated) |
    /// | `VELA_KV_PAD` | `kv_pad_multiple` |
    /// | `VELA_MASK_LUT` | `mask_lut_sizes` (comma separated) |
    /// | `VELA_POOL_GROWTH` | `pool.growth_factor` |
    /// | `VELA_POOL_MIN_BYTES` | `pool.min_bytes` |
    /// | `VELA_DRY_RUN` | `execution_mode` |
    /// | `VELA_OVERLAP` | `overlap_stages` |
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut c = Self::default();
        for (k, v) in vars {
            let (k, v) = (k.as_ref(), v.as_ref().trim());
            match k {
                "VELA_ENABLE_ACCELERATOR" => c.enable_accelerator = parse_bool(k, v)?,
                "VELA_ENABLE_TOKEN_PATH" => c.enable_token_path = parse_bool(k, v)?,
                "VELA_MAX_SEQ" => c.max_supported_seq = parse_num(k, v)?,
                "VELA_BUCKETS" => c.bucket_sizes = parse_list(k, v)?,
                "VELA_KV_PAD" => c.kv_pad_multiple = parse_num(k, v)?,
                "VELA_MASK_LUT" => c.mask_lut_sizes = parse_list(k, v)?,
                "VELA_POOL_GROWTH" => c.pool.growth_factor = parse_num(k, v)?,
                "VELA_POOL_MIN_BYTES" => c.pool.min_bytes = parse_num(k, v)?,
                "VELA_DRY_RUN" => {
                    c.execution_mode = if parse_bool(k, v)? {
                        ExecutionMode::DryRun
                    } else {
                        ExecutionMode::Normal
                    }
                }
                "VELA_OVERLAP" => c.overlap_stages = parse_bool(k, v)?,
                _ => {}
            }
        }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<()> {
        self.bucket_policy()?;
        self.pool.validate()?;
        if self.mask_lut_sizes.iter().any(|&s| s == 0) {
            return Err(VelaError::InvalidConfig("mask LUT sizes must be non-zero".into()));
        }
        Ok(())
    }

    pub fn bucket_policy(&self) -> Result<BucketPolicy> {
        BucketPolicy::new(&self.bucket_sizes, self.max_supported_seq, self.kv_pad_multiple)
    }

    pub fn dispatch_policy(&self) -> Result<DispatchPolicy> {
        Ok(DispatchPolicy::new(
            self.bucket_policy()?,
            self.enable_accelerator,
            self.enable_token_path,
        ))
    }
}

fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(VelaError::InvalidConfig(format!("{key}: expected a boolean, got '{v}'"))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, v: &str) -> Result<T> {
    v.parse()
        .map_err(|_| VelaError::InvalidConfig(format!("{key}: cannot parse '{v}'")))
}

fn parse_list(key: &str, v: &str) -> Result<Vec<usize>> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_num(key, s))
        .collect()
}
