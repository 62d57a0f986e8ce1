//! Host-side emulation of the NPU kernel library.
//!
//! Follows the device numerics contract: bf16 operands, f32 accumulation,
//! bf16 results. Reductions run in ascending index order so zero padding
//! never changes a result bit. Work is split across heads with rayon.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use half::bf16;
use rayon::prelude::*;

use crate::device::{NpuDevice, NpuKernel};
use crate::error::KernelError;
use crate::kernel::{KernelArgs, KernelKind, KernelShape};

/// Emulated NPU device.
///
/// Buffers never leave host memory, so syncs only count traffic. A kernel
/// kind can be made to fail on every execution to exercise error paths.
#[derive(Default)]
pub struct EmulatedNpu {
    fail_on: Option<KernelKind>,
    loads: AtomicU64,
    bytes_to_device: AtomicU64,
    bytes_from_device: AtomicU64,
}

impl EmulatedNpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose `kind` kernel fails every execution.
    pub fn failing(kind: KernelKind) -> Self {
        Self {
            fail_on: Some(kind),
            ..Self::default()
        }
    }

    pub fn kernel_loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn bytes_to_device(&self) -> u64 {
        self.bytes_to_device.load(Ordering::Relaxed)
    }

    pub fn bytes_from_device(&self) -> u64 {
        self.bytes_from_device.load(Ordering::Relaxed)
    }
}

impl NpuDevice for EmulatedNpu {
    fn name(&self) -> &str {
        "emulated-npu"
    }

    fn load_kernel(&self, kind: KernelKind) -> Result<Arc<dyn NpuKernel>, KernelError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(EmulatedKernel {
            kind,
            fail: self.fail_on == Some(kind),
        }))
    }

    fn sync_to_device(&self, bytes: &[u8]) -> Result<(), KernelError> {
        self.bytes_to_device
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn sync_from_device(&self, bytes: &mut [u8]) -> Result<(), KernelError> {
        self.bytes_from_device
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

struct EmulatedKernel {
    kind: KernelKind,
    fail: bool,
}

impl NpuKernel for EmulatedKernel {
    fn kind(&self) -> KernelKind {
        self.kind
    }

    fn execute(&self, shape: &KernelShape, args: &mut KernelArgs<'_>) -> Result<(), KernelError> {
        if self.fail {
            return Err(KernelError::execution(self.kind, "injected device fault"));
        }
        let (a, b) = (args.inputs[0], args.inputs[1]);
        let out = &mut *args.output;
        match self.kind {
            KernelKind::MatMulQk => matmul_qk(shape, a, b, out, args.scale),
            KernelKind::Softmax => masked_softmax(shape, a, b, out),
            KernelKind::MatMulPv => matmul_pv(shape, a, b, out),
            KernelKind::Rope => rope(shape, a, b, out, args.interleaved),
        }
        Ok(())
    }
}

// ============================================================================
// Numerics
// ============================================================================

fn matmul_qk(s: &KernelShape, q: &[bf16], k: &[bf16], out: &mut [bf16], scale: f32) {
    let group = s.heads / s.kv_heads;
    let (rows, cols, d) = (s.rows, s.cols, s.head_dim);

    out.par_chunks_mut(rows * cols)
        .enumerate()
        .for_each(|(h, scores)| {
            let q_h = &q[h * rows * d..(h + 1) * rows * d];
            let g = h / group;
            let k_g = &k[g * cols * d..(g + 1) * cols * d];
            for i in 0..rows {
                let q_row = &q_h[i * d..(i + 1) * d];
                for j in 0..cols {
                    let k_row = &k_g[j * d..(j + 1) * d];
                    let mut dot = 0.0f32;
                    for p in 0..d {
                        dot += q_row[p].to_f32() * k_row[p].to_f32();
                    }
                    scores[i * cols + j] = bf16::from_f32(dot * scale);
                }
            }
        });
}

fn masked_softmax(s: &KernelShape, scores: &[bf16], mask: &[bf16], out: &mut [bf16]) {
    let (rows, cols) = (s.rows, s.cols);

    out.par_chunks_mut(cols).enumerate().for_each(|(r, probs)| {
        let i = r % rows;
        let x = &scores[r * cols..(r + 1) * cols];
        let m = &mask[i * cols..(i + 1) * cols];

        let mut max = f32::NEG_INFINITY;
        for j in 0..cols {
            max = max.max(x[j].to_f32() + m[j].to_f32());
        }
        if max == f32::NEG_INFINITY {
            // Fully masked row.
            probs.fill(bf16::ZERO);
            return;
        }

        let mut sum = 0.0f32;
        let mut e = smallvec::SmallVec::<[f32; 512]>::with_capacity(cols);
        for j in 0..cols {
            let v = (x[j].to_f32() + m[j].to_f32() - max).exp();
            e.push(v);
            sum += v;
        }
        let inv = 1.0 / sum;
        for j in 0..cols {
            probs[j] = bf16::from_f32(e[j] * inv);
        }
    });
}

fn matmul_pv(s: &KernelShape, p: &[bf16], v: &[bf16], out: &mut [bf16]) {
    let group = s.heads / s.kv_heads;
    let (rows, cols, d) = (s.rows, s.cols, s.head_dim);

    out.par_chunks_mut(rows * d).enumerate().for_each(|(h, o)| {
        let p_h = &p[h * rows * cols..(h + 1) * rows * cols];
        let g = h / group;
        let v_g = &v[g * cols * d..(g + 1) * cols * d];
        let mut acc = smallvec::SmallVec::<[f32; 256]>::from_elem(0.0, d);
        for i in 0..rows {
            acc.fill(0.0);
            for j in 0..cols {
                let w = p_h[i * cols + j].to_f32();
                let v_row = &v_g[j * d..(j + 1) * d];
                for c in 0..d {
                    acc[c] += w * v_row[c].to_f32();
                }
            }
            for c in 0..d {
                o[i * d + c] = bf16::from_f32(acc[c]);
            }
        }
    });
}

fn rope(s: &KernelShape, cos: &[bf16], sin: &[bf16], x: &mut [bf16], interleaved: bool) {
    let (rows, d) = (s.rows, s.head_dim);
    let half = d / 2;

    x.par_chunks_mut(rows * d).for_each(|head| {
        for i in 0..rows {
            let row = &mut head[i * d..(i + 1) * d];
            let c = &cos[i * d..(i + 1) * d];
            let sn = &sin[i * d..(i + 1) * d];
            for k in 0..half {
                let (a, b) = if interleaved { (2 * k, 2 * k + 1) } else { (k, k + half) };
                let x0 = row[a].to_f32();
                let x1 = row[b].to_f32();
                row[a] = bf16::from_f32(x0 * c[a].to_f32() - x1 * sn[a].to_f32());
                row[b] = bf16::from_f32(x1 * c[b].to_f32() + x0 * sn[b].to_f32());
            }
        }
    });
}
