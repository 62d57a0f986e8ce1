//! f32 CPU kernels for the fallback datapath.
//!
//! Head-major layouts throughout: activations are `[heads, seq, head_dim]`,
//! keys and values `[kv_heads, kv_len, head_dim]`. Query heads are split
//! across rayon workers.

use rayon::prelude::*;
use vela_core::{Result, VelaError};

/// Dimensions of one batch entry of an attention call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub heads: usize,
    pub kv_heads: usize,
    pub seq: usize,
    pub kv_len: usize,
    pub head_dim: usize,
}

/// Which key positions a query row may attend to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Row `i` sees keys `[0, past + i]`.
    Causal { past: usize },
    /// Every row sees every key.
    Full,
}

/// Grouped-query scaled dot-product attention.
///
/// `q`: [heads, seq, d], `k`/`v`: [kv_heads, kv_len, d], `out`: [heads, seq, d].
/// `heads` must be a multiple of `kv_heads`; MHA is the `heads == kv_heads`
/// case.
pub fn gqa_attention(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    out: &mut [f32],
    dims: AttentionDims,
    scale: f32,
    visibility: Visibility,
) -> Result<()> {
    let AttentionDims {
        heads,
        kv_heads,
        seq,
        kv_len,
        head_dim: d,
    } = dims;
    if kv_heads == 0 || heads % kv_heads != 0 {
        return Err(VelaError::InvalidShape(format!(
            "{heads} query heads cannot be grouped over {kv_heads} kv heads"
        )));
    }
    let check = |name: &str, got: usize, want: usize| {
        if got == want {
            Ok(())
        } else {
            Err(VelaError::InvalidShape(format!(
                "fallback attention: {name} has {got} elements, expected {want}"
            )))
        }
    };
    check("query", q.len(), heads * seq * d)?;
    check("key", k.len(), kv_heads * kv_len * d)?;
    check("value", v.len(), kv_heads * kv_len * d)?;
    check("output", out.len(), heads * seq * d)?;
    if let Visibility::Causal { past } = visibility {
        if past + seq > kv_len {
            return Err(VelaError::InvalidShape(format!(
                "causal attention needs {} keys, got {kv_len}",
                past + seq
            )));
        }
    }
    if out.is_empty() {
        return Ok(());
    }

    let group = heads / kv_heads;
    out.par_chunks_mut(seq * d).enumerate().for_each(|(h, o)| {
        let g = h / group;
        let q_h = &q[h * seq * d..(h + 1) * seq * d];
        let k_g = &k[g * kv_len * d..(g + 1) * kv_len * d];
        let v_g = &v[g * kv_len * d..(g + 1) * kv_len * d];
        let mut scores = vec![0.0f32; kv_len];

        for i in 0..seq {
            let visible = match visibility {
                Visibility::Causal { past } => past + i + 1,
                Visibility::Full => kv_len,
            };
            let q_row = &q_h[i * d..(i + 1) * d];

            // scores = q · kᵀ · scale over the visible prefix
            let mut max = f32::NEG_INFINITY;
            for j in 0..visible {
                let k_row = &k_g[j * d..(j + 1) * d];
                let mut dot = 0.0f32;
                for p in 0..d {
                    dot += q_row[p] * k_row[p];
                }
                scores[j] = dot * scale;
                max = max.max(scores[j]);
            }

            let mut sum = 0.0f32;
            for s in scores[..visible].iter_mut() {
                *s = (*s - max).exp();
                sum += *s;
            }
            let inv = 1.0 / sum;

            let o_row = &mut o[i * d..(i + 1) * d];
            o_row.fill(0.0);
            for j in 0..visible {
                let w = scores[j] * inv;
                let v_row = &v_g[j * d..(j + 1) * d];
                for p in 0..d {
                    o_row[p] += w * v_row[p];
                }
            }
        }
    });
    Ok(())
}

/// Apply rotary position embedding in place.
///
/// `x`: [heads, seq, head_dim]. `cos`/`sin`: [max_len, head_dim / 2], indexed
/// by `positions[s]` for sequence step `s`. With `interleaved` the rotated
/// pairs are `(2k, 2k+1)`, otherwise `(k, k + head_dim/2)`.
pub fn apply_rotary(
    x: &mut [f32],
    heads: usize,
    head_dim: usize,
    cos: &[f32],
    sin: &[f32],
    positions: &[usize],
    interleaved: bool,
) -> Result<()> {
    let seq = positions.len();
    if head_dim == 0 || head_dim % 2 != 0 {
        return Err(VelaError::InvalidShape(format!(
            "rotary embedding needs an even head_dim, got {head_dim}"
        )));
    }
    if x.len() != heads * seq * head_dim {
        return Err(VelaError::InvalidShape(format!(
            "rotary input has {} elements, expected {}",
            x.len(),
            heads * seq * head_dim
        )));
    }
    let half = head_dim / 2;
    if cos.len() != sin.len() || cos.len() % half != 0 {
        return Err(VelaError::InvalidShape(format!(
            "cos/sin tables ({} / {} elements) are not [max_len, {half}]",
            cos.len(),
            sin.len()
        )));
    }
    let max_len = cos.len() / half;
    if let Some(&bad) = positions.iter().find(|&&p| p >= max_len) {
        return Err(VelaError::InvalidShape(format!(
            "position {bad} outside rotary table of {max_len} rows"
        )));
    }
    if x.is_empty() {
        return Ok(());
    }

    x.par_chunks_mut(seq * head_dim).for_each(|head| {
        for (s, &pos) in positions.iter().enumerate() {
            let row = &mut head[s * head_dim..(s + 1) * head_dim];
            let c = &cos[pos * half..(pos + 1) * half];
            let sn = &sin[pos * half..(pos + 1) * half];
            for k in 0..half {
                let (a, b) = if interleaved { (2 * k, 2 * k + 1) } else { (k, k + half) };
                let x0 = row[a];
                let x1 = row[b];
                row[a] = x0 * c[k] - x1 * sn[k];
                row[b] = x1 * c[k] + x0 * sn[k];
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() <= tol, "index {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_uniform_inputs_average_values() {
        let dims = AttentionDims {
            heads: 2,
            kv_heads: 2,
            seq: 3,
            kv_len: 3,
            head_dim: 2,
        };
        let q = vec![1.0f32; 12];
        let k = vec![1.0f32; 12];
        let v = vec![1.0f32; 12];
        let mut out = vec![0.0f32; 12];
        gqa_attention(&q, &k, &v, &mut out, dims, 0.5, Visibility::Full).unwrap();
        assert_close(&out, &[1.0; 12], 1e-6);
    }

    #[test]
    fn test_causal_first_row_sees_only_itself() {
        let dims = AttentionDims {
            heads: 1,
            kv_heads: 1,
            seq: 3,
            kv_len: 3,
            head_dim: 2,
        };
        let q = vec![1.0f32; 6];
        let k = vec![1.0f32; 6];
        let v: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let mut out = vec![0.0f32; 6];
        gqa_attention(&q, &k, &v, &mut out, dims, 1.0, Visibility::Causal { past: 0 }).unwrap();
        assert_close(&out[..2], &v[..2], 1e-6);
        // Row 2 averages all three value rows.
        assert_close(&out[4..], &[2.0, 3.0], 1e-5);
    }

    #[test]
    fn test_past_offset_extends_visibility() {
        let dims = AttentionDims {
            heads: 1,
            kv_heads: 1,
            seq: 1,
            kv_len: 4,
            head_dim: 1,
        };
        let v = [0.0f32, 4.0, 8.0, 100.0];
        let mut out = [0.0f32];
        // past=2: the single query row sees keys 0..=2.
        gqa_attention(&[0.0], &[0.0; 4], &v, &mut out, dims, 1.0, Visibility::Causal { past: 2 })
            .unwrap();
        assert_close(&out, &[4.0], 1e-5);
    }

    #[test]
    fn test_gqa_groups_share_kv() {
        let dims = AttentionDims {
            heads: 4,
            kv_heads: 2,
            seq: 1,
            kv_len: 1,
            head_dim: 1,
        };
        let mut out = [0.0f32; 4];
        gqa_attention(&[1.0; 4], &[1.0, 1.0], &[3.0, 7.0], &mut out, dims, 1.0, Visibility::Full)
            .unwrap();
        assert_eq!(out, [3.0, 3.0, 7.0, 7.0]);
    }

    #[test]
    fn test_bad_group_ratio() {
        let dims = AttentionDims {
            heads: 3,
            kv_heads: 2,
            seq: 1,
            kv_len: 1,
            head_dim: 1,
        };
        let mut out = [0.0f32; 3];
        assert!(gqa_attention(&[0.0; 3], &[0.0; 2], &[0.0; 2], &mut out, dims, 1.0, Visibility::Full).is_err());
    }

    #[test]
    fn test_rotary_position_zero_is_identity() {
        let mut x = vec![1.0f32, 2.0, 3.0, 4.0];
        let cos = [1.0f32, 1.0, 0.5, 0.5];
        let sin = [0.0f32, 0.0, 0.5, 0.5];
        apply_rotary(&mut x, 1, 4, &cos, &sin, &[0], false).unwrap();
        assert_eq!(x, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rotary_preserves_pair_norm() {
        let angle = 0.7f32;
        let cos = [1.0, 1.0, angle.cos(), angle.cos()];
        let sin = [0.0, 0.0, angle.sin(), angle.sin()];
        for interleaved in [false, true] {
            let mut x = vec![3.0f32, 4.0, 1.0, 2.0];
            let (a, b) = if interleaved { (0, 1) } else { (0, 2) };
            let before = (x[a] * x[a] + x[b] * x[b]).sqrt();
            apply_rotary(&mut x, 1, 4, &cos, &sin, &[1], interleaved).unwrap();
            let after = (x[a] * x[a] + x[b] * x[b]).sqrt();
            assert!((before - after).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rotary_position_out_of_range() {
        let mut x = vec![0.0f32; 4];
        let err = apply_rotary(&mut x, 1, 4, &[1.0; 4], &[0.0; 4], &[2], false).unwrap_err();
        assert!(matches!(err, VelaError::InvalidShape(_)));
    }
}
