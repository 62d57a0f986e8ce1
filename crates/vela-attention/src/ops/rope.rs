//! Standalone rotary position embedding.

use std::sync::Arc;

use half::bf16;
use vela_core::element::cast_slice_into;
use vela_core::{BufferPool, BufferTag, DType, Element, Result, Tensor, VelaError};
use vela_kernels::fallback;
use vela_kernels::{KernelArgs, KernelKind, KernelShape};

use crate::context::AttentionContext;
use crate::dispatch::Path;
use crate::rotary::{self, RotaryLayout};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotaryAttributes {
    /// 0: input is `[batch, heads, seq, head_dim]`. Otherwise input is
    /// `[batch, seq, num_heads * head_dim]`.
    pub num_heads: usize,
    pub interleaved: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RotaryInputs<'a> {
    pub input: &'a Tensor,
    /// i64 `[batch, seq]`.
    pub position_ids: &'a Tensor,
    /// `[max_len, head_dim / 2]`.
    pub cos_cache: &'a Tensor,
    pub sin_cache: &'a Tensor,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    batch: usize,
    heads: usize,
    seq: usize,
    head_dim: usize,
    head_major: bool,
}

impl Layout {
    fn of(input: &Tensor, num_heads: usize) -> Result<Self> {
        if num_heads == 0 {
            let (batch, heads, seq, head_dim) = input.shape().dims4("rotary input")?;
            return Ok(Self { batch, heads, seq, head_dim, head_major: true });
        }
        let (batch, seq, width) = input.shape().dims3("rotary input")?;
        if width % num_heads != 0 {
            return Err(VelaError::InvalidShape(format!(
                "rotary input width {width} is not a multiple of {num_heads} heads"
            )));
        }
        Ok(Self {
            batch,
            heads: num_heads,
            seq,
            head_dim: width / num_heads,
            head_major: false,
        })
    }

    /// Element offset of row `(b, h, s)`.
    fn row(&self, b: usize, h: usize, s: usize) -> usize {
        if self.head_major {
            ((b * self.heads + h) * self.seq + s) * self.head_dim
        } else {
            (b * self.seq + s) * self.heads * self.head_dim + h * self.head_dim
        }
    }

    /// Copy batch entry `b` into head-major `[heads, seq, head_dim]`.
    fn load<S: Element, D: Element>(&self, src: &[S], b: usize, out: &mut [D]) {
        let d = self.head_dim;
        for h in 0..self.heads {
            for s in 0..self.seq {
                let (from, to) = (self.row(b, h, s), (h * self.seq + s) * d);
                cast_slice_into(&src[from..from + d], &mut out[to..to + d]);
            }
        }
    }

    fn store<S: Element, D: Element>(&self, src: &[S], b: usize, out: &mut [D]) {
        let d = self.head_dim;
        for h in 0..self.heads {
            for s in 0..self.seq {
                let (from, to) = ((h * self.seq + s) * d, self.row(b, h, s));
                cast_slice_into(&src[from..from + d], &mut out[to..to + d]);
            }
        }
    }
}

fn load_batch<D: Element>(layout: &Layout, input: &Tensor, b: usize, out: &mut [D]) -> Result<()> {
    match input.dtype() {
        DType::BF16 => layout.load(input.as_slice::<bf16>()?, b, out),
        DType::F32 => layout.load(input.as_slice::<f32>()?, b, out),
        other => return Err(VelaError::UnsupportedDType(other)),
    }
    Ok(())
}

fn store_batch<S: Element>(layout: &Layout, src: &[S], b: usize, output: &mut Tensor) -> Result<()> {
    match output.dtype() {
        DType::BF16 => layout.store(src, b, output.as_mut_slice::<bf16>()?),
        DType::F32 => layout.store(src, b, output.as_mut_slice::<f32>()?),
        other => return Err(VelaError::UnsupportedDType(other)),
    }
    Ok(())
}

/// Rotary embedding operator. Output has the input's shape and dtype.
#[derive(Debug)]
pub struct RotaryEmbedding {
    attrs: RotaryAttributes,
    ctx: Arc<AttentionContext>,
    pool: BufferPool,
    last_path: Option<Path>,
}

impl RotaryEmbedding {
    pub fn new(attrs: RotaryAttributes, ctx: Arc<AttentionContext>) -> Result<Self> {
        let pool = BufferPool::new(ctx.config().pool.clone())?;
        tracing::info!(
            "RotaryEmbedding: num_heads={} interleaved={}",
            attrs.num_heads,
            attrs.interleaved
        );
        Ok(Self {
            attrs,
            ctx,
            pool,
            last_path: None,
        })
    }

    pub fn attributes(&self) -> &RotaryAttributes {
        &self.attrs
    }

    /// Datapath taken by the last successful call.
    pub fn last_path(&self) -> Option<Path> {
        self.last_path
    }

    pub fn compute(&mut self, inputs: &RotaryInputs<'_>) -> Result<Tensor> {
        let dtype = inputs.input.ensure_attention_dtype()?;
        let layout = Layout::of(inputs.input, self.attrs.num_heads)?;
        let (max_len, half) = rotary::table_dims(inputs.cos_cache, inputs.sin_cache)?;
        if layout.head_dim == 0 || 2 * half != layout.head_dim {
            return Err(VelaError::InvalidShape(format!(
                "rotary table covers head_dim {}, input has {}",
                2 * half,
                layout.head_dim
            )));
        }

        if inputs.position_ids.dims() != [layout.batch, layout.seq] {
            return Err(VelaError::ShapeMismatch {
                expected: vec![layout.batch, layout.seq],
                got: inputs.position_ids.dims().to_vec(),
            });
        }
        let positions = inputs.position_ids.to_index_vec()?;
        if let Some(&p) = positions.iter().find(|&&p| p >= max_len) {
            return Err(VelaError::InvalidShape(format!(
                "position {p} is outside the {max_len}-entry rotary table"
            )));
        }

        let contiguous = positions
            .chunks_exact(layout.seq.max(1))
            .all(|row| row.windows(2).all(|w| w[1] == w[0] + 1));
        let path = if self.ctx.config().enable_accelerator && contiguous && layout.seq > 0 {
            Path::Accelerator
        } else {
            Path::Fallback
        };
        tracing::debug!(
            "rotary embedding: batch={} heads={} seq={} head_dim={} -> {:?}",
            layout.batch,
            layout.heads,
            layout.seq,
            layout.head_dim,
            path
        );

        let mut output = Tensor::zeros(inputs.input.dims(), dtype)?;
        match path {
            Path::Accelerator => self.accelerated(inputs, &layout, &positions, &mut output)?,
            Path::Fallback => self.fallback(inputs, &layout, &positions, &mut output)?,
        }
        self.pool.reclaim();
        self.last_path = Some(path);
        Ok(output)
    }

    fn accelerated(
        &self,
        inputs: &RotaryInputs<'_>,
        layout: &Layout,
        positions: &[usize],
        output: &mut Tensor,
    ) -> Result<()> {
        let rope_layout = RotaryLayout::from_interleaved(self.attrs.interleaved);
        let table = self
            .ctx
            .rotary()
            .get_or_build(inputs.cos_cache, inputs.sin_cache, rope_layout)?;
        let (h, s, d) = (layout.heads, layout.seq, layout.head_dim);
        let scratch = self.pool.acquire_typed(BufferTag::RotaryScratch, DType::BF16, h * s * d)?;
        for b in 0..layout.batch {
            let (cos, sin) = table.lookup(positions[b * s], s)?;
            let mut x = scratch.lock::<bf16>()?;
            load_batch(layout, inputs.input, b, &mut x[..])?;
            self.ctx.registry().invoke(
                KernelKind::Rope,
                &KernelShape::rope(h, s, d),
                KernelArgs::new(&[cos, sin], &mut x[..]).with_interleaved(self.attrs.interleaved),
            )?;
            store_batch(layout, &x[..], b, output)?;
        }
        Ok(())
    }

    fn fallback(
        &self,
        inputs: &RotaryInputs<'_>,
        layout: &Layout,
        positions: &[usize],
        output: &mut Tensor,
    ) -> Result<()> {
        let (cos, sin) = (inputs.cos_cache.to_f32_vec(), inputs.sin_cache.to_f32_vec());
        let (h, s, d) = (layout.heads, layout.seq, layout.head_dim);
        let scratch = self.pool.acquire_typed(BufferTag::RotaryScratch, DType::F32, h * s * d)?;
        for b in 0..layout.batch {
            let mut x = scratch.lock::<f32>()?;
            load_batch(layout, inputs.input, b, &mut x[..])?;
            fallback::apply_rotary(
                &mut x[..],
                h,
                d,
                &cos,
                &sin,
                &positions[b * s..(b + 1) * s],
                self.attrs.interleaved,
            )?;
            store_batch(layout, &x[..], b, output)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn tables(max_len: usize, half: usize) -> (Tensor, Tensor) {
        let theta = |p: usize, k: usize| p as f32 * 0.3 / (k + 1) as f32;
        let cos = (0..max_len * half).map(|i| theta(i / half, i % half).cos()).collect();
        let sin = (0..max_len * half).map(|i| theta(i / half, i % half).sin()).collect();
        (
            Tensor::from_vec(cos, &[max_len, half]).unwrap(),
            Tensor::from_vec(sin, &[max_len, half]).unwrap(),
        )
    }

    fn op(config: EngineConfig, attrs: RotaryAttributes) -> RotaryEmbedding {
        RotaryEmbedding::new(attrs, AttentionContext::new(config).unwrap()).unwrap()
    }

    #[test]
    fn test_position_zero_is_identity() {
        let (cos, sin) = tables(8, 2);
        let x = Tensor::from_vec((0..8).map(|i| i as f32 - 3.5).collect::<Vec<_>>(), &[1, 1, 2, 4]).unwrap();
        let pos = Tensor::from_vec(vec![0i64, 0], &[1, 2]).unwrap();
        let mut rope = op(EngineConfig::fallback_only(), RotaryAttributes::default());
        let inputs = RotaryInputs {
            input: &x,
            position_ids: &pos,
            cos_cache: &cos,
            sin_cache: &sin,
        };
        let out = rope.compute(&inputs).unwrap();
        assert_eq!(out.to_f32_vec()[..4], x.to_f32_vec()[..4]);
        assert_eq!(rope.last_path(), Some(Path::Fallback));
    }

    #[test]
    fn test_contiguous_positions_use_accelerator() {
        let (cos, sin) = tables(16, 4);
        let (b, s, h, d) = (2, 3, 2, 8);
        let data: Vec<f32> = (0..b * s * h * d).map(|i| ((i % 11) as f32 - 5.0) / 4.0).collect();
        let x = Tensor::from_f32(&data, &[b, s, h * d], DType::BF16).unwrap();
        let contiguous = Tensor::from_vec(vec![0i64, 1, 2, 5, 6, 7], &[b, s]).unwrap();
        let scattered = Tensor::from_vec(vec![0i64, 2, 1, 5, 6, 7], &[b, s]).unwrap();

        let attrs = RotaryAttributes {
            num_heads: h,
            interleaved: true,
        };
        let mut rope = op(EngineConfig::default(), attrs);
        let run = |rope: &mut RotaryEmbedding, pos: &Tensor| {
            rope.compute(&RotaryInputs {
                input: &x,
                position_ids: pos,
                cos_cache: &cos,
                sin_cache: &sin,
            })
            .unwrap()
        };
        let npu = run(&mut rope, &contiguous);
        assert_eq!(rope.last_path(), Some(Path::Accelerator));
        assert_eq!(npu.dims(), x.dims());
        assert_eq!(npu.dtype(), DType::BF16);
        run(&mut rope, &scattered);
        assert_eq!(rope.last_path(), Some(Path::Fallback));

        let mut cpu_rope = op(EngineConfig::fallback_only(), attrs);
        let cpu = run(&mut cpu_rope, &contiguous);
        for (a, c) in npu.to_f32_vec().iter().zip(cpu.to_f32_vec()) {
            assert!((a - c).abs() < 2e-2, "{a} vs {c}");
        }
    }

    #[test]
    fn test_rejects_out_of_table_positions() {
        let (cos, sin) = tables(4, 2);
        let x = Tensor::zeros(&[1, 2, 4], DType::F32).unwrap();
        let pos = Tensor::from_vec(vec![3i64, 4], &[1, 2]).unwrap();
        let mut rope = op(
            EngineConfig::default(),
            RotaryAttributes {
                num_heads: 1,
                interleaved: false,
            },
        );
        let err = rope.compute(&RotaryInputs {
            input: &x,
            position_ids: &pos,
            cos_cache: &cos,
            sin_cache: &sin,
        });
        assert!(matches!(err, Err(VelaError::InvalidShape(_))));
    }

    #[test]
    fn test_unsupported_dtype() {
        let (cos, sin) = tables(4, 2);
        let x = Tensor::from_vec(vec![1i32; 8], &[1, 2, 4]).unwrap();
        let pos = Tensor::from_vec(vec![0i64, 1], &[1, 2]).unwrap();
        let mut rope = op(
            EngineConfig::default(),
            RotaryAttributes {
                num_heads: 1,
                interleaved: false,
            },
        );
        let err = rope.compute(&RotaryInputs {
            input: &x,
            position_ids: &pos,
            cos_cache: &cos,
            sin_cache: &sin,
        });
        assert!(matches!(err, Err(VelaError::UnsupportedDType(DType::I32))));
    }
}
