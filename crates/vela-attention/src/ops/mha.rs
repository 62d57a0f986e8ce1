//! Multi-head attention: separate Q/K/V, one KV head per query head, no
//! rotary embedding.

use std::sync::Arc;

use vela_core::{PoolStats, Result, Tensor, VelaError};

use crate::context::AttentionContext;
use crate::dispatch::DispatchDecision;
use crate::kv_cache::KvCacheTensors;
use crate::ops::{check_scale, past_lengths, scalar_length};
use crate::pipeline::{AttentionPipeline, AttentionProblem, QkvInput, StageTrace};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MhaAttributes {
    pub num_heads: usize,
    /// 0 means `1 / sqrt(head_dim)`.
    pub scale: f32,
    /// Causal masking. Without it every query sees every cached and new key.
    pub unidirectional: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MhaInputs<'a> {
    /// `[batch, seq, num_heads * head_dim]`, likewise `key` and `value`.
    pub query: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
    pub past_seq_lens: &'a Tensor,
    pub total_sequence_length: &'a Tensor,
}

#[derive(Debug)]
pub struct MultiHeadAttention {
    attrs: MhaAttributes,
    scale: Option<f32>,
    pipeline: AttentionPipeline,
}

impl MultiHeadAttention {
    pub fn new(attrs: MhaAttributes, ctx: Arc<AttentionContext>) -> Result<Self> {
        if attrs.num_heads == 0 {
            return Err(VelaError::MissingAttribute("num_heads"));
        }
        let scale = check_scale(attrs.scale)?;
        tracing::info!(
            "MultiHeadAttention: heads={} unidirectional={}",
            attrs.num_heads,
            attrs.unidirectional
        );
        Ok(Self {
            attrs,
            scale,
            pipeline: AttentionPipeline::new(ctx)?,
        })
    }

    pub fn attributes(&self) -> &MhaAttributes {
        &self.attrs
    }

    pub fn compute(&mut self, inputs: &MhaInputs<'_>, cache: &mut KvCacheTensors) -> Result<Tensor> {
        let past = past_lengths(inputs.past_seq_lens)?;
        let total_len = scalar_length(inputs.total_sequence_length, "total_sequence_length")?;
        let problem = AttentionProblem {
            qkv: QkvInput::Separate {
                query: inputs.query,
                key: inputs.key,
                value: inputs.value,
            },
            heads: self.attrs.num_heads,
            kv_heads: self.attrs.num_heads,
            past: &past,
            total_len,
            scale: self.scale,
            causal: self.attrs.unidirectional,
            rotary: None,
        };
        self.pipeline.run(&problem, cache)
    }

    pub fn last_trace(&self) -> &StageTrace {
        self.pipeline.last_trace()
    }

    pub fn last_decision(&self) -> Option<DispatchDecision> {
        self.pipeline.last_decision()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pipeline.pool_stats()
    }
}
