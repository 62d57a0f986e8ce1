//! Grouped-query attention with optional rotary embedding and an in-place
//! KV cache.

use std::sync::Arc;

use vela_core::{PoolStats, Result, Tensor, VelaError};

use crate::context::AttentionContext;
use crate::dispatch::DispatchDecision;
use crate::kv_cache::{KvCacheTensors, KvMode};
use crate::ops::{check_scale, past_lengths, scalar_length};
use crate::pipeline::{AttentionPipeline, AttentionProblem, QkvInput, RotaryInput, StageTrace};
use crate::rotary::{RotaryCache, RotaryLayout};

#[derive(Debug, Clone, Default)]
pub struct GqaAttributes {
    pub num_heads: usize,
    pub kv_num_heads: usize,
    pub do_rotary: bool,
    pub rotary_interleaved: bool,
    /// 0 means `1 / sqrt(head_dim)`.
    pub scale: f32,
    /// Constant `[max_len, head_dim / 2]` tables, expanded at construction.
    pub cos_cache: Option<Tensor>,
    pub sin_cache: Option<Tensor>,
}

/// Per-call inputs. `key`/`value` are absent when `query` is packed QKV.
#[derive(Debug, Clone, Copy)]
pub struct GqaInputs<'a> {
    pub query: &'a Tensor,
    pub key: Option<&'a Tensor>,
    pub value: Option<&'a Tensor>,
    /// i32/i64 `[batch]`.
    pub past_seq_lens: &'a Tensor,
    /// i32/i64 scalar.
    pub total_sequence_length: &'a Tensor,
    pub cos_cache: Option<&'a Tensor>,
    pub sin_cache: Option<&'a Tensor>,
}

impl<'a> GqaInputs<'a> {
    /// Packed QKV input without runtime rotary tables.
    pub fn packed(query: &'a Tensor, past_seq_lens: &'a Tensor, total_sequence_length: &'a Tensor) -> Self {
        Self {
            query,
            key: None,
            value: None,
            past_seq_lens,
            total_sequence_length,
            cos_cache: None,
            sin_cache: None,
        }
    }

    pub fn with_kv(mut self, key: &'a Tensor, value: &'a Tensor) -> Self {
        self.key = Some(key);
        self.value = Some(value);
        self
    }

    pub fn with_rotary(mut self, cos: &'a Tensor, sin: &'a Tensor) -> Self {
        self.cos_cache = Some(cos);
        self.sin_cache = Some(sin);
        self
    }
}

#[derive(Debug)]
pub struct GroupQueryAttention {
    attrs: GqaAttributes,
    scale: Option<f32>,
    layout: RotaryLayout,
    constant_table: Option<Arc<RotaryCache>>,
    pipeline: AttentionPipeline,
}

impl GroupQueryAttention {
    pub fn new(attrs: GqaAttributes, ctx: Arc<AttentionContext>) -> Result<Self> {
        if attrs.num_heads == 0 {
            return Err(VelaError::MissingAttribute("num_heads"));
        }
        if attrs.kv_num_heads == 0 || attrs.num_heads % attrs.kv_num_heads != 0 {
            return Err(VelaError::InvalidAttribute {
                name: "kv_num_heads",
                reason: format!(
                    "{} query heads cannot be grouped over {} kv heads",
                    attrs.num_heads, attrs.kv_num_heads
                ),
            });
        }
        let scale = check_scale(attrs.scale)?;
        let layout = RotaryLayout::from_interleaved(attrs.rotary_interleaved);

        let constant_table = match (&attrs.cos_cache, &attrs.sin_cache) {
            (Some(cos), Some(sin)) if attrs.do_rotary => Some(Arc::new(RotaryCache::from_tensors(cos, sin, layout)?)),
            (Some(_), Some(_)) | (None, None) => None,
            (Some(_), None) => return Err(VelaError::MissingAttribute("sin_cache")),
            (None, Some(_)) => return Err(VelaError::MissingAttribute("cos_cache")),
        };

        tracing::info!(
            "GroupQueryAttention: heads={} kv_heads={} rotary={} ({:?}, constant table: {})",
            attrs.num_heads,
            attrs.kv_num_heads,
            attrs.do_rotary,
            layout,
            constant_table.is_some()
        );
        Ok(Self {
            attrs,
            scale,
            layout,
            constant_table,
            pipeline: AttentionPipeline::new(ctx)?,
        })
    }

    pub fn attributes(&self) -> &GqaAttributes {
        &self.attrs
    }

    /// Run one call. Returns `[batch, seq, num_heads * head_dim]`; `cache`
    /// becomes the present key/value.
    pub fn compute(&mut self, inputs: &GqaInputs<'_>, cache: &mut KvCacheTensors) -> Result<Tensor> {
        let past = past_lengths(inputs.past_seq_lens)?;
        let total_len = scalar_length(inputs.total_sequence_length, "total_sequence_length")?;

        let qkv = match (inputs.key, inputs.value) {
            (Some(key), Some(value)) => QkvInput::Separate {
                query: inputs.query,
                key,
                value,
            },
            (None, None) => QkvInput::Packed(inputs.query),
            (Some(_), None) => return Err(VelaError::MissingAttribute("value")),
            (None, Some(_)) => return Err(VelaError::MissingAttribute("key")),
        };

        let rotary = if self.attrs.do_rotary {
            Some(rotary_input(&self.attrs, self.layout, &self.constant_table, inputs)?)
        } else {
            None
        };

        let problem = AttentionProblem {
            qkv,
            heads: self.attrs.num_heads,
            kv_heads: self.attrs.kv_num_heads,
            past: &past,
            total_len,
            scale: self.scale,
            causal: true,
            rotary,
        };
        self.pipeline.run(&problem, cache)
    }

    pub fn last_trace(&self) -> &StageTrace {
        self.pipeline.last_trace()
    }

    pub fn last_decision(&self) -> Option<DispatchDecision> {
        self.pipeline.last_decision()
    }

    pub fn kv_mode(&self) -> Option<KvMode> {
        self.pipeline.kv_mode()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pipeline.pool_stats()
    }

    pub fn pipeline(&self) -> &AttentionPipeline {
        &self.pipeline
    }
}

/// Constant tables win; otherwise the runtime cos/sin inputs are used and
/// expanded once through the shared rotary store.
fn rotary_input<'a>(
    attrs: &'a GqaAttributes,
    layout: RotaryLayout,
    constant: &Option<Arc<RotaryCache>>,
    inputs: &GqaInputs<'a>,
) -> Result<RotaryInput<'a>> {
    if let (Some(cos), Some(sin)) = (&attrs.cos_cache, &attrs.sin_cache) {
        return Ok(RotaryInput {
            cos,
            sin,
            layout,
            table: constant.clone(),
        });
    }
    let cos = inputs.cos_cache.ok_or(VelaError::MissingAttribute("cos_cache"))?;
    let sin = inputs.sin_cache.ok_or(VelaError::MissingAttribute("sin_cache"))?;
    Ok(RotaryInput {
        cos,
        sin,
        layout,
        table: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pipeline::Stage;
    use vela_core::DType;

    fn ctx() -> Arc<AttentionContext> {
        AttentionContext::new(EngineConfig::default()).unwrap()
    }

    fn attrs(h: usize, hkv: usize) -> GqaAttributes {
        GqaAttributes {
            num_heads: h,
            kv_num_heads: hkv,
            ..Default::default()
        }
    }

    fn rope_tables(max_len: usize, half: usize) -> (Tensor, Tensor) {
        let mut cos = Vec::with_capacity(max_len * half);
        let mut sin = Vec::with_capacity(max_len * half);
        for pos in 0..max_len {
            for k in 0..half {
                let theta = pos as f32 / 10000f32.powf(2.0 * k as f32 / (2 * half) as f32);
                cos.push(theta.cos());
                sin.push(theta.sin());
            }
        }
        (
            Tensor::from_vec(cos, &[max_len, half]).unwrap(),
            Tensor::from_vec(sin, &[max_len, half]).unwrap(),
        )
    }

    #[test]
    fn test_attribute_validation() {
        assert!(matches!(
            GroupQueryAttention::new(attrs(0, 1), ctx()),
            Err(VelaError::MissingAttribute("num_heads"))
        ));
        assert!(matches!(
            GroupQueryAttention::new(attrs(6, 4), ctx()),
            Err(VelaError::InvalidAttribute { name: "kv_num_heads", .. })
        ));
        let mut a = attrs(4, 2);
        a.scale = -1.0;
        assert!(GroupQueryAttention::new(a, ctx()).is_err());

        let (cos, _) = rope_tables(8, 2);
        let mut a = attrs(4, 2);
        a.do_rotary = true;
        a.cos_cache = Some(cos);
        assert!(matches!(
            GroupQueryAttention::new(a, ctx()),
            Err(VelaError::MissingAttribute("sin_cache"))
        ));
    }

    #[test]
    fn test_rotary_requires_tables() {
        let mut a = attrs(2, 1);
        a.do_rotary = true;
        let mut op = GroupQueryAttention::new(a, ctx()).unwrap();
        let q = Tensor::zeros(&[1, 4, 16], DType::F32).unwrap();
        let past = Tensor::from_vec(vec![0i32], &[1]).unwrap();
        let total = Tensor::scalar_i64(4);
        let mut cache = KvCacheTensors::empty(1, 1, 4, DType::F32).unwrap();
        let err = op.compute(&GqaInputs::packed(&q, &past, &total), &mut cache);
        assert!(matches!(err, Err(VelaError::MissingAttribute("cos_cache"))));
    }

    #[test]
    fn test_prefill_then_decode() {
        let (h, hkv, d) = (4, 2, 8);
        let (cos, sin) = rope_tables(64, d / 2);
        let mut a = attrs(h, hkv);
        a.do_rotary = true;
        a.cos_cache = Some(cos);
        a.sin_cache = Some(sin);
        let mut op = GroupQueryAttention::new(a, ctx()).unwrap();
        let width = (h + 2 * hkv) * d;

        let prompt: Vec<f32> = (0..6 * width).map(|i| ((i * 7 % 19) as f32 - 9.0) / 9.0).collect();
        let q = Tensor::from_f32(&prompt, &[1, 6, width], DType::BF16).unwrap();
        let mut cache = KvCacheTensors::empty(1, hkv, d, DType::BF16).unwrap();
        let out = op
            .compute(
                &GqaInputs::packed(&q, &Tensor::from_vec(vec![0i32], &[1]).unwrap(), &Tensor::scalar_i64(6)),
                &mut cache,
            )
            .unwrap();
        assert_eq!(out.dims(), &[1, 6, h * d]);
        assert!(op.last_trace().contains(Stage::Rope));
        assert_eq!(cache.capacity(), 6);
        assert_eq!(op.kv_mode(), Some(KvMode::Growing));

        let step: Vec<f32> = (0..width).map(|i| (i as f32 / width as f32) - 0.5).collect();
        let q = Tensor::from_f32(&step, &[1, 1, width], DType::BF16).unwrap();
        let out = op
            .compute(
                &GqaInputs::packed(&q, &Tensor::from_vec(vec![6i32], &[1]).unwrap(), &Tensor::scalar_i64(7)),
                &mut cache,
            )
            .unwrap();
        assert_eq!(out.dims(), &[1, 1, h * d]);
        let decision = op.last_decision().unwrap();
        assert_eq!(decision.bucket_size, 1);
        assert_eq!(decision.kv_bucket, 128);
        assert_eq!(cache.capacity(), 7);
    }

    #[test]
    fn test_total_length_must_be_scalar() {
        let mut op = GroupQueryAttention::new(attrs(1, 1), ctx()).unwrap();
        let q = Tensor::zeros(&[1, 2, 12], DType::F32).unwrap();
        let past = Tensor::from_vec(vec![0i32], &[1]).unwrap();
        let total = Tensor::from_vec(vec![2i64, 2], &[2]).unwrap();
        let mut cache = KvCacheTensors::empty(1, 1, 4, DType::F32).unwrap();
        assert!(matches!(
            op.compute(&GqaInputs::packed(&q, &past, &total), &mut cache),
            Err(VelaError::InvalidShape(_))
        ));
    }
}
