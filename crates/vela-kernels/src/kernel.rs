//! The kernel calling contract.
//!
//! Four primitives make up an attention step on the NPU. Every one of them
//! takes bf16 buffers of an exact logical size; nothing is broadcast.
//!
//! | kind        | inputs                                         | output (in/out)           |
//! |-------------|------------------------------------------------|---------------------------|
//! | `MatMulQk`  | q `[H, rows, D]`, k `[Hkv, cols, D]`           | scores `[H, rows, cols]`  |
//! | `Softmax`   | scores `[H, rows, cols]`, mask `[rows, cols]`  | probs `[H, rows, cols]`   |
//! | `MatMulPv`  | probs `[H, rows, cols]`, v `[Hkv, cols, D]`    | out `[H, rows, D]`        |
//! | `Rope`      | cos `[rows, D]`, sin `[rows, D]`               | x `[H, rows, D]` in place |

use std::fmt;

use half::bf16;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    MatMulQk,
    Softmax,
    MatMulPv,
    Rope,
}

impl KernelKind {
    pub const ALL: [KernelKind; 4] = [
        KernelKind::MatMulQk,
        KernelKind::Softmax,
        KernelKind::MatMulPv,
        KernelKind::Rope,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KernelKind::MatMulQk => "matmul_qk",
            KernelKind::Softmax => "softmax",
            KernelKind::MatMulPv => "matmul_pv",
            KernelKind::Rope => "rope",
        }
    }

    /// Whether the output buffer is also read by the kernel.
    pub fn is_in_place(&self) -> bool {
        matches!(self, KernelKind::Rope)
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical dimensions of one kernel invocation.
///
/// `cols` is the key length for the attention kernels and equals `rows` for
/// `Rope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelShape {
    pub heads: usize,
    pub kv_heads: usize,
    pub rows: usize,
    pub cols: usize,
    pub head_dim: usize,
}

impl KernelShape {
    pub fn attention(heads: usize, kv_heads: usize, rows: usize, cols: usize, head_dim: usize) -> Self {
        Self {
            heads,
            kv_heads,
            rows,
            cols,
            head_dim,
        }
    }

    pub fn rope(heads: usize, rows: usize, head_dim: usize) -> Self {
        Self {
            heads,
            kv_heads: heads,
            rows,
            cols: rows,
            head_dim,
        }
    }

    /// Element counts of each input buffer for `kind`.
    pub fn input_lens(&self, kind: KernelKind) -> SmallVec<[usize; 3]> {
        let Self {
            heads,
            kv_heads,
            rows,
            cols,
            head_dim,
        } = *self;
        match kind {
            KernelKind::MatMulQk => smallvec::smallvec![heads * rows * head_dim, kv_heads * cols * head_dim],
            KernelKind::Softmax => smallvec::smallvec![heads * rows * cols, rows * cols],
            KernelKind::MatMulPv => smallvec::smallvec![heads * rows * cols, kv_heads * cols * head_dim],
            KernelKind::Rope => smallvec::smallvec![rows * head_dim, rows * head_dim],
        }
    }

    /// Element count of the output buffer for `kind`.
    pub fn output_len(&self, kind: KernelKind) -> usize {
        match kind {
            KernelKind::MatMulQk | KernelKind::Softmax => self.heads * self.rows * self.cols,
            KernelKind::MatMulPv | KernelKind::Rope => self.heads * self.rows * self.head_dim,
        }
    }

    /// Check structural constraints and exact buffer lengths.
    pub fn validate(&self, kind: KernelKind, args: &KernelArgs<'_>) -> Result<(), KernelError> {
        if self.heads == 0 || self.kv_heads == 0 || self.head_dim == 0 || self.rows == 0 || self.cols == 0 {
            return Err(KernelError::bad_arguments(kind, format!("degenerate shape {self}")));
        }
        if self.heads % self.kv_heads != 0 {
            return Err(KernelError::bad_arguments(
                kind,
                format!("heads {} not a multiple of kv_heads {}", self.heads, self.kv_heads),
            ));
        }
        if kind == KernelKind::Rope && self.head_dim % 2 != 0 {
            return Err(KernelError::bad_arguments(kind, "rope needs an even head_dim"));
        }
        let want = self.input_lens(kind);
        if args.inputs.len() != want.len() {
            return Err(KernelError::bad_arguments(
                kind,
                format!("expected {} inputs, got {}", want.len(), args.inputs.len()),
            ));
        }
        for (i, (buf, &n)) in args.inputs.iter().zip(want.iter()).enumerate() {
            if buf.len() != n {
                return Err(KernelError::bad_arguments(
                    kind,
                    format!("input {i} has {} elements, expected {n}", buf.len()),
                ));
            }
        }
        let out = self.output_len(kind);
        if args.output.len() != out {
            return Err(KernelError::bad_arguments(
                kind,
                format!("output has {} elements, expected {out}", args.output.len()),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for KernelShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[h={} kv={} rows={} cols={} d={}]",
            self.heads, self.kv_heads, self.rows, self.cols, self.head_dim
        )
    }
}

/// Buffers and scalars for one invocation.
pub struct KernelArgs<'a> {
    pub inputs: SmallVec<[&'a [bf16]; 3]>,
    pub output: &'a mut [bf16],
    /// Score scale for `MatMulQk`.
    pub scale: f32,
    /// Pairwise rotation for `Rope`.
    pub interleaved: bool,
}

impl<'a> KernelArgs<'a> {
    pub fn new(inputs: &[&'a [bf16]], output: &'a mut [bf16]) -> Self {
        Self {
            inputs: inputs.iter().copied().collect(),
            output,
            scale: 1.0,
            interleaved: false,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_interleaved(mut self, interleaved: bool) -> Self {
        self.interleaved = interleaved;
        self
    }
}
