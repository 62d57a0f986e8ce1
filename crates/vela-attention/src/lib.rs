//! # vela-attention
//!
//! Attention dispatch for NPU inference.
//!
//! Provides:
//! - Sequence-bucket padding policy and the per-call dispatch decision
//! - Causal attention-mask tables and a transient mask provider
//! - Rotary cos/sin tables, expanded once and shared
//! - KV-cache update engine (growing and shared-buffer layouts)
//! - The stage pipeline with fork-join overlap of cache write-back
//! - `GroupQueryAttention`, `MultiHeadAttention` and `RotaryEmbedding`

pub mod bucket;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod kv_cache;
pub mod mask;
pub mod ops;
pub mod pipeline;
pub mod rotary;

pub use bucket::BucketPolicy;
pub use config::EngineConfig;
pub use context::AttentionContext;
pub use dispatch::{DispatchDecision, DispatchPolicy, Path, Phase};
pub use kv_cache::{KvCacheTensors, KvMode};
pub use mask::{AttenMaskProvider, AttentionMaskCache, MaskRef, MaskRequest};
pub use ops::{
    GqaAttributes, GqaInputs, GroupQueryAttention, MhaAttributes, MhaInputs, MultiHeadAttention,
    RotaryAttributes, RotaryEmbedding, RotaryInputs,
};
pub use pipeline::{AttentionPipeline, Stage, StageTrace};
pub use rotary::{RotaryCache, RotaryLayout, RotaryStore};
