//! Per-call attention pipeline.
//!
//! One call walks the stage machine
//!
//! ```text
//! Init -> [SplitQkv] -> [Rope] -> PadConcatKv -> MatMul1 -> Softmax -> MatMul2 -> WriteBackCache -> Done
//! ```
//!
//! once per batch entry (`SplitQkv` only for packed QKV inputs, `Rope` only
//! when rotary is requested). Cache write-back only reads the current K/V
//! scratch, so with `overlap_stages` it runs on a second rayon worker while
//! the three attention kernels run. Both branches are joined before the
//! output is unpadded.

use std::sync::Arc;

use half::bf16;
use smallvec::SmallVec;
use vela_core::element::cast_slice_into;
use vela_core::{BufferPool, BufferTag, DType, Element, PoolLease, PoolStats, Result, Tensor, VelaError};
use vela_kernels::fallback::{self, AttentionDims, Visibility};
use vela_kernels::{KernelArgs, KernelKind, KernelShape};

use crate::context::AttentionContext;
use crate::dispatch::{DispatchDecision, Path};
use crate::kv_cache::{self, KvCacheTensors, KvMode, KvModeTracker};
use crate::mask::{AttenMaskProvider, MaskRef, MaskRequest};
use crate::rotary::{self, RotaryCache, RotaryLayout};

// ============================================================================
// Stages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    SplitQkv,
    Rope,
    PadConcatKv,
    MatMul1,
    Softmax,
    MatMul2,
    WriteBackCache,
    Done,
}

/// Stages visited by the last call, in order.
#[derive(Debug, Clone, Default)]
pub struct StageTrace {
    stages: SmallVec<[Stage; 12]>,
}

impl StageTrace {
    fn clear(&mut self) {
        self.stages.clear();
    }

    fn enter(&mut self, stage: Stage) {
        tracing::trace!("stage {:?}", stage);
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }
}

// ============================================================================
// Problem description
// ============================================================================

/// Query/key/value activations of one call.
#[derive(Debug, Clone, Copy)]
pub enum QkvInput<'a> {
    /// `[batch, seq, (heads + 2 * kv_heads) * head_dim]`.
    Packed(&'a Tensor),
    /// `[batch, seq, heads * head_dim]` and two `[batch, seq, kv_heads * head_dim]`.
    Separate {
        query: &'a Tensor,
        key: &'a Tensor,
        value: &'a Tensor,
    },
}

impl<'a> QkvInput<'a> {
    pub fn query(&self) -> &'a Tensor {
        match *self {
            QkvInput::Packed(t) => t,
            QkvInput::Separate { query, .. } => query,
        }
    }

    pub fn is_packed(&self) -> bool {
        matches!(self, QkvInput::Packed(_))
    }
}

/// Rotary tables for one call: the raw `[max_len, head_dim / 2]` cos/sin
/// (fallback path) plus the expanded bf16 table when one was built ahead of
/// time.
#[derive(Debug, Clone)]
pub struct RotaryInput<'a> {
    pub cos: &'a Tensor,
    pub sin: &'a Tensor,
    pub layout: RotaryLayout,
    pub table: Option<Arc<RotaryCache>>,
}

#[derive(Debug, Clone)]
pub struct AttentionProblem<'a> {
    pub qkv: QkvInput<'a>,
    pub heads: usize,
    pub kv_heads: usize,
    /// Cached positions per batch entry.
    pub past: &'a [usize],
    /// Positions held by the cache after this call.
    pub total_len: usize,
    /// `None` scales by `1 / sqrt(head_dim)`.
    pub scale: Option<f32>,
    pub causal: bool,
    pub rotary: Option<RotaryInput<'a>>,
}

/// Rows of `heads` consecutive heads starting at column `col` of a
/// `[batch, seq, width]` activation.
#[derive(Debug, Clone, Copy)]
struct HeadSlice<'a> {
    tensor: &'a Tensor,
    width: usize,
    col: usize,
    heads: usize,
}

impl HeadSlice<'_> {
    /// Gather batch entry `batch` into head-major `[heads, seq, head_dim]`.
    fn gather<D: Element>(&self, batch: usize, seq: usize, head_dim: usize, out: &mut [D]) -> Result<()> {
        match self.tensor.dtype() {
            DType::BF16 => self.gather_from(self.tensor.as_slice::<bf16>()?, batch, seq, head_dim, out),
            DType::F32 => self.gather_from(self.tensor.as_slice::<f32>()?, batch, seq, head_dim, out),
            other => return Err(VelaError::UnsupportedDType(other)),
        }
        Ok(())
    }

    fn gather_from<S: Element, D: Element>(&self, src: &[S], batch: usize, seq: usize, d: usize, out: &mut [D]) {
        for h in 0..self.heads {
            for s in 0..seq {
                let from = (batch * seq + s) * self.width + self.col + h * d;
                let to = (h * seq + s) * d;
                cast_slice_into(&src[from..from + d], &mut out[to..to + d]);
            }
        }
    }
}

/// Validated geometry of a problem.
#[derive(Debug, Clone, Copy)]
struct Geometry<'a> {
    batch: usize,
    seq: usize,
    heads: usize,
    kv_heads: usize,
    head_dim: usize,
    scale: f32,
    dtype: DType,
    q: HeadSlice<'a>,
    k: HeadSlice<'a>,
    v: HeadSlice<'a>,
}

impl<'a> AttentionProblem<'a> {
    fn geometry(&self) -> Result<Geometry<'a>> {
        let (h, hkv) = (self.heads, self.kv_heads);
        if h == 0 || hkv == 0 || h % hkv != 0 {
            return Err(VelaError::InvalidAttribute {
                name: "num_heads",
                reason: format!("{h} query heads cannot be grouped over {hkv} kv heads"),
            });
        }

        let query = self.qkv.query();
        let dtype = query.ensure_attention_dtype()?;
        let (batch, seq, width) = query.shape().dims3("query")?;
        let slots = match self.qkv {
            QkvInput::Packed(_) => h + 2 * hkv,
            QkvInput::Separate { .. } => h,
        };
        if width == 0 || width % slots != 0 {
            return Err(VelaError::InvalidShape(format!(
                "query width {width} is not a multiple of {slots} heads"
            )));
        }
        let d = width / slots;
        if seq == 0 {
            return Err(VelaError::InvalidShape("query has no sequence positions".into()));
        }

        let (q, k, v) = match self.qkv {
            QkvInput::Packed(t) => (
                HeadSlice { tensor: t, width, col: 0, heads: h },
                HeadSlice { tensor: t, width, col: h * d, heads: hkv },
                HeadSlice { tensor: t, width, col: (h + hkv) * d, heads: hkv },
            ),
            QkvInput::Separate { query, key, value } => {
                let want = [batch, seq, hkv * d];
                for t in [key, value] {
                    if t.dims() != want {
                        return Err(VelaError::ShapeMismatch {
                            expected: want.to_vec(),
                            got: t.dims().to_vec(),
                        });
                    }
                    if t.dtype() != dtype {
                        return Err(VelaError::DTypeMismatch {
                            expected: dtype,
                            got: t.dtype(),
                        });
                    }
                }
                (
                    HeadSlice { tensor: query, width, col: 0, heads: h },
                    HeadSlice { tensor: key, width: hkv * d, col: 0, heads: hkv },
                    HeadSlice { tensor: value, width: hkv * d, col: 0, heads: hkv },
                )
            }
        };

        if self.past.len() != batch {
            return Err(VelaError::InvalidShape(format!(
                "{} past lengths for a batch of {batch}",
                self.past.len()
            )));
        }
        if let Some(&p) = self.past.iter().find(|&&p| p + seq > self.total_len) {
            return Err(VelaError::InvalidShape(format!(
                "past length {p} + {seq} new positions exceed total length {}",
                self.total_len
            )));
        }

        if let Some(r) = &self.rotary {
            let (_, half) = rotary::table_dims(r.cos, r.sin)?;
            if 2 * half != d {
                return Err(VelaError::InvalidShape(format!(
                    "rotary table covers head_dim {}, activations have {d}",
                    2 * half
                )));
            }
        }

        Ok(Geometry {
            batch,
            seq,
            heads: h,
            kv_heads: hkv,
            head_dim: d,
            scale: self.scale.unwrap_or(1.0 / (d as f32).sqrt()),
            dtype,
            q,
            k,
            v,
        })
    }
}

/// f32 cos/sin for the fallback rotary path.
struct FallbackRope {
    cos: Vec<f32>,
    sin: Vec<f32>,
    interleaved: bool,
}

/// Mask as handed to the softmax kernel.
enum KernelMask {
    Shared(Arc<[bf16]>),
    Pooled(PoolLease),
}

// ============================================================================
// Pipeline
// ============================================================================

/// Per-operator dispatcher state: scratch pool, mask provider, KV mode
/// tracker and the trace of the last call.
#[derive(Debug)]
pub struct AttentionPipeline {
    ctx: Arc<AttentionContext>,
    pool: BufferPool,
    masks: AttenMaskProvider,
    kv_modes: KvModeTracker,
    trace: StageTrace,
    last_decision: Option<DispatchDecision>,
}

impl AttentionPipeline {
    pub fn new(ctx: Arc<AttentionContext>) -> Result<Self> {
        let pool = BufferPool::new(ctx.config().pool.clone())?;
        let masks = AttenMaskProvider::new(Arc::clone(ctx.masks()));
        Ok(Self {
            ctx,
            pool,
            masks,
            kv_modes: KvModeTracker::new(),
            trace: StageTrace::default(),
            last_decision: None,
        })
    }

    pub fn context(&self) -> &Arc<AttentionContext> {
        &self.ctx
    }

    pub fn last_trace(&self) -> &StageTrace {
        &self.trace
    }

    pub fn last_decision(&self) -> Option<DispatchDecision> {
        self.last_decision
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn mask_provider(&self) -> &AttenMaskProvider {
        &self.masks
    }

    pub fn kv_mode(&self) -> Option<KvMode> {
        self.kv_modes.active()
    }

    /// Run one attention call. Returns `[batch, seq, heads * head_dim]` in
    /// the query's dtype and leaves `cache` holding `total_len` positions.
    pub fn run(&mut self, p: &AttentionProblem<'_>, cache: &mut KvCacheTensors) -> Result<Tensor> {
        self.trace.clear();
        self.trace.enter(Stage::Init);
        let g = p.geometry()?;

        let (cb, ch, _, cd) = cache.dims();
        if (cb, ch, cd) != (g.batch, g.kv_heads, g.head_dim) {
            return Err(VelaError::ShapeMismatch {
                expected: vec![g.batch, g.kv_heads, cache.capacity(), g.head_dim],
                got: cache.key.dims().to_vec(),
            });
        }
        if cache.dtype() != g.dtype {
            return Err(VelaError::DTypeMismatch {
                expected: g.dtype,
                got: cache.dtype(),
            });
        }

        let mode = KvMode::select(cache.capacity(), p.total_len);
        self.kv_modes.observe(mode, p.past.iter().all(|&x| x == 0))?;
        let decision = self.ctx.policy().decide(g.seq, p.total_len);
        self.last_decision = Some(decision);
        tracing::debug!(
            "attention call: batch={} seq={} total={} kv={} -> {}",
            g.batch,
            g.seq,
            p.total_len,
            mode.name(),
            decision
        );
        cache.prepare(mode, p.total_len)?;

        let mut output = Tensor::zeros(&[g.batch, g.seq, g.heads * g.head_dim], g.dtype)?;
        match decision.path {
            Path::Accelerator => {
                let table = match &p.rotary {
                    Some(r) => Some(match &r.table {
                        Some(t) => Arc::clone(t),
                        None => self.ctx.rotary().get_or_build(r.cos, r.sin, r.layout)?,
                    }),
                    None => None,
                };
                for b in 0..g.batch {
                    self.accelerated(p, &g, &decision, mode, table.as_deref(), b, cache, &mut output)?;
                }
            }
            Path::Fallback => {
                let rope = p.rotary.as_ref().map(|r| FallbackRope {
                    cos: r.cos.to_f32_vec(),
                    sin: r.sin.to_f32_vec(),
                    interleaved: r.layout.is_interleaved(),
                });
                for b in 0..g.batch {
                    self.fallback(p, &g, mode, rope.as_ref(), b, cache, &mut output)?;
                }
            }
        }

        self.trace.enter(Stage::Done);
        let released = self.pool.reclaim();
        if released > 0 {
            tracing::debug!("pool reclaimed {} retired buffers", released);
        }
        Ok(output)
    }

    /// One batch entry on the NPU datapath.
    #[allow(clippy::too_many_arguments)]
    fn accelerated(
        &mut self,
        p: &AttentionProblem<'_>,
        g: &Geometry<'_>,
        decision: &DispatchDecision,
        mode: KvMode,
        rope: Option<&RotaryCache>,
        b: usize,
        cache: &mut KvCacheTensors,
        output: &mut Tensor,
    ) -> Result<()> {
        let (h, hkv, s, d) = (g.heads, g.kv_heads, g.seq, g.head_dim);
        let (s_pad, kv_len) = (decision.bucket_size, decision.kv_bucket);
        let past = p.past[b];
        let ctx = Arc::clone(&self.ctx);
        let registry = ctx.registry();
        let overlap = ctx.config().overlap_stages;

        let q = self.pool.acquire_typed(BufferTag::QueryScratch, DType::BF16, h * s * d)?;
        let k = self.pool.acquire_typed(BufferTag::KeyScratch, DType::BF16, hkv * s * d)?;
        let v = self.pool.acquire_typed(BufferTag::ValueScratch, DType::BF16, hkv * s * d)?;
        g.q.gather(b, s, d, &mut q.lock::<bf16>()?[..])?;
        g.k.gather(b, s, d, &mut k.lock::<bf16>()?[..])?;
        g.v.gather(b, s, d, &mut v.lock::<bf16>()?[..])?;
        if p.qkv.is_packed() {
            self.trace.enter(Stage::SplitQkv);
        }

        if let Some(table) = rope {
            self.trace.enter(Stage::Rope);
            let (cos, sin) = table.lookup(past, s)?;
            let interleaved = table.layout().is_interleaved();
            for (lease, heads) in [(&q, h), (&k, hkv)] {
                let mut x = lease.lock::<bf16>()?;
                registry.invoke(
                    KernelKind::Rope,
                    &KernelShape::rope(heads, s, d),
                    KernelArgs::new(&[cos, sin], &mut x[..]).with_interleaved(interleaved),
                )?;
            }
        }

        self.trace.enter(Stage::PadConcatKv);
        let q_in = if s_pad == s {
            q.clone()
        } else {
            let padded = self.pool.acquire_typed(BufferTag::PaddedQuery, DType::BF16, h * s_pad * d)?;
            pad_rows(&q.lock::<bf16>()?[..], &mut padded.lock::<bf16>()?[..], h, s, s_pad, d);
            padded
        };
        let pk = self.pool.acquire_typed(BufferTag::PaddedKey, DType::BF16, hkv * kv_len * d)?;
        let pv = self.pool.acquire_typed(BufferTag::PaddedValue, DType::BF16, hkv * kv_len * d)?;
        pad_kv_pair::<bf16>(cache, b, past, [(&k, &pk), (&v, &pv)], s, kv_len, overlap)?;

        let mask = self.masks.get_mask(MaskRequest {
            rows: s,
            padded_rows: s_pad,
            past,
            kv_len,
            causal: p.causal,
        })?;
        let mask = match mask {
            MaskRef::Lut { data, .. } => KernelMask::Shared(data),
            transient => {
                let lease = self.pool.acquire_typed(BufferTag::AttentionMask, DType::BF16, s_pad * kv_len)?;
                lease.lock::<bf16>()?.copy_from_slice(transient.as_slice());
                self.masks.free_if_transient(transient);
                KernelMask::Pooled(lease)
            }
        };

        let scores = self.pool.acquire_typed(BufferTag::Scores, DType::BF16, h * s_pad * kv_len)?;
        let probs = self.pool.acquire_typed(BufferTag::Probabilities, DType::BF16, h * s_pad * kv_len)?;
        let out = self.pool.acquire_typed(BufferTag::AttentionOutput, DType::BF16, h * s_pad * d)?;
        let shape = KernelShape::attention(h, hkv, s_pad, kv_len, d);
        let scale = g.scale;

        let attend = || -> Result<()> {
            let qg = q_in.lock::<bf16>()?;
            let kg = pk.lock::<bf16>()?;
            let mut sg = scores.lock::<bf16>()?;
            registry.invoke(
                KernelKind::MatMulQk,
                &shape,
                KernelArgs::new(&[&qg[..], &kg[..]], &mut sg[..]).with_scale(scale),
            )?;

            let pooled;
            let m: &[bf16] = match &mask {
                KernelMask::Shared(data) => &data[..],
                KernelMask::Pooled(lease) => {
                    pooled = lease.lock::<bf16>()?;
                    &pooled[..]
                }
            };
            let mut pg = probs.lock::<bf16>()?;
            registry.invoke(KernelKind::Softmax, &shape, KernelArgs::new(&[&sg[..], m], &mut pg[..]))?;

            let vg = pv.lock::<bf16>()?;
            let mut og = out.lock::<bf16>()?;
            registry.invoke(KernelKind::MatMulPv, &shape, KernelArgs::new(&[&pg[..], &vg[..]], &mut og[..]))
        };
        let mut store_cache = || write_back::<bf16>(cache, b, past, &k, &v, s, mode, p.total_len);
        let (ra, rw) = if overlap {
            rayon::join(attend, store_cache)
        } else {
            (attend(), store_cache())
        };
        ra?;
        rw?;
        for stage in [Stage::MatMul1, Stage::Softmax, Stage::MatMul2, Stage::WriteBackCache] {
            self.trace.enter(stage);
        }

        let og = out.lock::<bf16>()?;
        store_output(&og[..], s_pad, b, g, output)
    }

    /// One batch entry on the f32 CPU datapath.
    #[allow(clippy::too_many_arguments)]
    fn fallback(
        &mut self,
        p: &AttentionProblem<'_>,
        g: &Geometry<'_>,
        mode: KvMode,
        rope: Option<&FallbackRope>,
        b: usize,
        cache: &mut KvCacheTensors,
        output: &mut Tensor,
    ) -> Result<()> {
        let (h, hkv, s, d) = (g.heads, g.kv_heads, g.seq, g.head_dim);
        let past = p.past[b];
        let kv_len = past + s;
        let overlap = self.ctx.config().overlap_stages;

        let q = self.pool.acquire_typed(BufferTag::QueryScratch, DType::F32, h * s * d)?;
        let k = self.pool.acquire_typed(BufferTag::KeyScratch, DType::F32, hkv * s * d)?;
        let v = self.pool.acquire_typed(BufferTag::ValueScratch, DType::F32, hkv * s * d)?;
        g.q.gather(b, s, d, &mut q.lock::<f32>()?[..])?;
        g.k.gather(b, s, d, &mut k.lock::<f32>()?[..])?;
        g.v.gather(b, s, d, &mut v.lock::<f32>()?[..])?;
        if p.qkv.is_packed() {
            self.trace.enter(Stage::SplitQkv);
        }

        if let Some(r) = rope {
            self.trace.enter(Stage::Rope);
            let positions: Vec<usize> = (past..past + s).collect();
            for (lease, heads) in [(&q, h), (&k, hkv)] {
                let mut x = lease.lock::<f32>()?;
                fallback::apply_rotary(&mut x[..], heads, d, &r.cos, &r.sin, &positions, r.interleaved)?;
            }
        }

        self.trace.enter(Stage::PadConcatKv);
        let pk = self.pool.acquire_typed(BufferTag::PaddedKey, DType::F32, hkv * kv_len * d)?;
        let pv = self.pool.acquire_typed(BufferTag::PaddedValue, DType::F32, hkv * kv_len * d)?;
        pad_kv_pair::<f32>(cache, b, past, [(&k, &pk), (&v, &pv)], s, kv_len, overlap)?;

        let out = self.pool.acquire_typed(BufferTag::AttentionOutput, DType::F32, h * s * d)?;
        let dims = AttentionDims {
            heads: h,
            kv_heads: hkv,
            seq: s,
            kv_len,
            head_dim: d,
        };
        let visibility = if p.causal {
            Visibility::Causal { past }
        } else {
            Visibility::Full
        };
        let scale = g.scale;
        let attend = || -> Result<()> {
            let (qg, kg, vg) = (q.lock::<f32>()?, pk.lock::<f32>()?, pv.lock::<f32>()?);
            let mut og = out.lock::<f32>()?;
            fallback::gqa_attention(&qg[..], &kg[..], &vg[..], &mut og[..], dims, scale, visibility)
        };
        let mut store_cache = || write_back::<f32>(cache, b, past, &k, &v, s, mode, p.total_len);
        let (ra, rw) = if overlap {
            rayon::join(attend, store_cache)
        } else {
            (attend(), store_cache())
        };
        ra?;
        rw?;
        for stage in [Stage::MatMul1, Stage::Softmax, Stage::MatMul2, Stage::WriteBackCache] {
            self.trace.enter(stage);
        }

        let og = out.lock::<f32>()?;
        store_output(&og[..], s, b, g, output)
    }
}

/// Copy `rows` rows per head into `padded_rows`, zero-filling the rest.
fn pad_rows(src: &[bf16], dst: &mut [bf16], heads: usize, rows: usize, padded_rows: usize, d: usize) {
    for h in 0..heads {
        let (from, to) = (h * rows * d, h * padded_rows * d);
        dst[to..to + rows * d].copy_from_slice(&src[from..from + rows * d]);
        dst[to + rows * d..to + padded_rows * d].fill(bf16::ZERO);
    }
}

/// Padded K and V kernel inputs for batch entry `b`. `pairs` is
/// `[(key scratch, padded key), (value scratch, padded value)]`; with
/// `overlap` the two are built as a fork-join pair.
fn pad_kv_pair<E: Element>(
    cache: &KvCacheTensors,
    b: usize,
    past: usize,
    pairs: [(&PoolLease, &PoolLease); 2],
    s: usize,
    kv_len: usize,
    overlap: bool,
) -> Result<()> {
    let pad = |(src, dst): (&PoolLease, &PoolLease), tensor: &Tensor| -> Result<()> {
        let src = src.lock::<E>()?;
        let mut dst = dst.lock::<E>()?;
        kv_cache::concat_padded(tensor, b, past, &src[..], s, kv_len, &mut dst[..])
    };
    let [kp, vp] = pairs;
    let (rk, rv) = if overlap {
        rayon::join(|| pad(kp, &cache.key), || pad(vp, &cache.value))
    } else {
        (pad(kp, &cache.key), pad(vp, &cache.value))
    };
    rk?;
    rv
}

#[allow(clippy::too_many_arguments)]
fn write_back<E: Element>(
    cache: &mut KvCacheTensors,
    b: usize,
    past: usize,
    k: &PoolLease,
    v: &PoolLease,
    s: usize,
    mode: KvMode,
    total_len: usize,
) -> Result<()> {
    let kg = k.lock::<E>()?;
    kv_cache::update(&mut cache.key, b, past, &kg[..], s, mode, total_len)?;
    let vg = v.lock::<E>()?;
    kv_cache::update(&mut cache.value, b, past, &vg[..], s, mode, total_len)
}

/// Scatter head-major `[heads, rows, d]` (first `seq` rows) into batch entry
/// `b` of the `[batch, seq, heads * d]` output.
fn store_output<S: Element>(src: &[S], rows: usize, b: usize, g: &Geometry<'_>, output: &mut Tensor) -> Result<()> {
    match output.dtype() {
        DType::BF16 => merge_heads(src, rows, b, g, output.as_mut_slice::<bf16>()?),
        DType::F32 => merge_heads(src, rows, b, g, output.as_mut_slice::<f32>()?),
        other => return Err(VelaError::UnsupportedDType(other)),
    }
    Ok(())
}

fn merge_heads<S: Element, D: Element>(src: &[S], rows: usize, b: usize, g: &Geometry<'_>, out: &mut [D]) {
    let (d, width) = (g.head_dim, g.heads * g.head_dim);
    for h in 0..g.heads {
        for s in 0..g.seq {
            let from = (h * rows + s) * d;
            let to = (b * g.seq + s) * width + h * d;
            cast_slice_into(&src[from..from + d], &mut out[to..to + d]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use vela_core::PoolConfig;

    fn ramp(n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|i| ((i % 23) as f32 - 11.0) * scale).collect()
    }

    fn problem<'a>(qkv: QkvInput<'a>, heads: usize, kv_heads: usize, past: &'a [usize], total: usize) -> AttentionProblem<'a> {
        AttentionProblem {
            qkv,
            heads,
            kv_heads,
            past,
            total_len: total,
            scale: Some(0.5),
            causal: true,
            rotary: None,
        }
    }

    #[test]
    fn test_stage_trace_prefill() {
        let ctx = AttentionContext::new(EngineConfig::default()).unwrap();
        let mut pipe = AttentionPipeline::new(ctx).unwrap();
        let (h, hkv, d, s) = (2, 1, 4, 5);
        let packed = Tensor::from_f32(&ramp(s * (h + 2 * hkv) * d, 0.05), &[1, s, (h + 2 * hkv) * d], DType::BF16).unwrap();
        let mut cache = KvCacheTensors::empty(1, hkv, d, DType::BF16).unwrap();
        let out = pipe.run(&problem(QkvInput::Packed(&packed), h, hkv, &[0], s), &mut cache).unwrap();

        assert_eq!(out.dims(), &[1, s, h * d]);
        assert_eq!(
            pipe.last_trace().stages(),
            &[
                Stage::Init,
                Stage::SplitQkv,
                Stage::PadConcatKv,
                Stage::MatMul1,
                Stage::Softmax,
                Stage::MatMul2,
                Stage::WriteBackCache,
                Stage::Done
            ]
        );
        let decision = pipe.last_decision().unwrap();
        assert!(decision.is_accelerated());
        assert_eq!(decision.bucket_size, 128);
        assert_eq!(cache.capacity(), s);
    }

    #[test]
    fn test_separate_inputs_skip_split() {
        let ctx = AttentionContext::new(EngineConfig::fallback_only()).unwrap();
        let mut pipe = AttentionPipeline::new(ctx).unwrap();
        let (h, d, s) = (2, 4, 3);
        let q = Tensor::from_vec(ramp(s * h * d, 0.1), &[1, s, h * d]).unwrap();
        let k = Tensor::from_vec(ramp(s * h * d, 0.2), &[1, s, h * d]).unwrap();
        let v = Tensor::from_vec(ramp(s * h * d, 0.3), &[1, s, h * d]).unwrap();
        let mut cache = KvCacheTensors::empty(1, h, d, DType::F32).unwrap();
        let qkv = QkvInput::Separate { query: &q, key: &k, value: &v };
        pipe.run(&problem(qkv, h, h, &[0], s), &mut cache).unwrap();
        assert!(!pipe.last_trace().contains(Stage::SplitQkv));
        assert!(!pipe.last_decision().unwrap().is_accelerated());
        // The cache now holds the new keys.
        assert_eq!(&cache.key.as_slice::<f32>().unwrap()[..d], &k.as_slice::<f32>().unwrap()[..d]);
    }

    #[test]
    fn test_rejects_past_beyond_total() {
        let ctx = AttentionContext::new(EngineConfig::default()).unwrap();
        let mut pipe = AttentionPipeline::new(ctx).unwrap();
        let packed = Tensor::zeros(&[1, 2, 12], DType::BF16).unwrap();
        let mut cache = KvCacheTensors::empty(1, 1, 4, DType::BF16).unwrap();
        let err = pipe.run(&problem(QkvInput::Packed(&packed), 1, 1, &[3], 4), &mut cache);
        assert!(matches!(err, Err(VelaError::InvalidShape(_))));
    }

    #[test]
    fn test_rejects_cache_geometry() {
        let ctx = AttentionContext::new(EngineConfig::default()).unwrap();
        let mut pipe = AttentionPipeline::new(ctx).unwrap();
        let packed = Tensor::zeros(&[1, 2, 12], DType::BF16).unwrap();
        let mut cache = KvCacheTensors::empty(1, 2, 4, DType::BF16).unwrap();
        let err = pipe.run(&problem(QkvInput::Packed(&packed), 1, 1, &[0], 2), &mut cache);
        assert!(matches!(err, Err(VelaError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_kv_padding_same_with_and_without_overlap() {
        let (hkv, d, past, s, kv_len) = (2, 2, 3, 2, 8);
        let cached_k = ramp(hkv * 8 * d, 0.5);
        let cached_v = ramp(hkv * 8 * d, -0.25);
        let mut cache = KvCacheTensors::with_capacity(1, hkv, 8, d, DType::F32).unwrap();
        cache.key.as_mut_slice::<f32>().unwrap().copy_from_slice(&cached_k);
        cache.value.as_mut_slice::<f32>().unwrap().copy_from_slice(&cached_v);

        let pool = BufferPool::new(PoolConfig::default()).unwrap();
        let k = pool.acquire_typed(BufferTag::KeyScratch, DType::F32, hkv * s * d).unwrap();
        let v = pool.acquire_typed(BufferTag::ValueScratch, DType::F32, hkv * s * d).unwrap();
        k.lock::<f32>().unwrap().fill(9.0);
        v.lock::<f32>().unwrap().fill(-9.0);

        let run = |overlap: bool| -> (Vec<f32>, Vec<f32>) {
            let pk = pool.acquire_typed(BufferTag::PaddedKey, DType::F32, hkv * kv_len * d).unwrap();
            let pv = pool.acquire_typed(BufferTag::PaddedValue, DType::F32, hkv * kv_len * d).unwrap();
            pk.lock::<f32>().unwrap().fill(f32::NAN);
            pv.lock::<f32>().unwrap().fill(f32::NAN);
            pad_kv_pair::<f32>(&cache, 0, past, [(&k, &pk), (&v, &pv)], s, kv_len, overlap).unwrap();
            let padded = (pk.lock::<f32>().unwrap().to_vec(), pv.lock::<f32>().unwrap().to_vec());
            padded
        };
        let (seq_k, seq_v) = run(false);
        let (par_k, par_v) = run(true);
        assert_eq!(seq_k, par_k);
        assert_eq!(seq_v, par_v);

        // Head 0 of each: cached rows, new rows, zero padding.
        assert_eq!(&par_k[..past * d], &cached_k[..past * d]);
        assert_eq!(&par_k[past * d..(past + s) * d], &[9.0; 4]);
        assert!(par_k[(past + s) * d..kv_len * d].iter().all(|&x| x == 0.0));
        assert_eq!(&par_v[..past * d], &cached_v[..past * d]);
        assert_eq!(&par_v[past * d..(past + s) * d], &[-9.0; 4]);
    }

    #[test]
    fn test_fallback_overlap_matches_sequential() {
        let (h, hkv, d, s) = (4, 2, 4, 6);
        let width = (h + 2 * hkv) * d;
        let run = |overlap: bool| -> (Vec<f32>, Vec<f32>, Vec<f32>) {
            let config = EngineConfig {
                overlap_stages: overlap,
                ..EngineConfig::fallback_only()
            };
            let mut pipe = AttentionPipeline::new(AttentionContext::new(config).unwrap()).unwrap();
            let mut cache = KvCacheTensors::empty(1, hkv, d, DType::F32).unwrap();
            let prompt = Tensor::from_vec(ramp(s * width, 0.05), &[1, s, width]).unwrap();
            pipe.run(&problem(QkvInput::Packed(&prompt), h, hkv, &[0], s), &mut cache)
                .unwrap();
            let step = Tensor::from_vec(ramp(width, 0.07), &[1, 1, width]).unwrap();
            let out = pipe
                .run(&problem(QkvInput::Packed(&step), h, hkv, &[s], s + 1), &mut cache)
                .unwrap();
            assert!(!pipe.last_decision().unwrap().is_accelerated());
            assert!(pipe.last_trace().contains(Stage::PadConcatKv));
            (out.to_f32_vec(), cache.key.to_f32_vec(), cache.value.to_f32_vec())
        };
        assert_eq!(run(true), run(false));
    }

    #[test]
    fn test_pad_rows() {
        let src: Vec<bf16> = (0..6).map(|i| bf16::from_f32(i as f32 + 1.0)).collect();
        let mut dst = vec![bf16::ONE; 8];
        pad_rows(&src, &mut dst, 2, 3, 4, 1);
        let got: Vec<f32> = dst.iter().map(|v| v.to_f32()).collect();
        assert_eq!(got, vec![1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]);
    }
}
