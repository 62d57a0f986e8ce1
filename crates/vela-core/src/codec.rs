//! Bulk float32 ↔ bfloat16 conversion.
//!
//! A pure numeric codec: `f32 → bf16` rounds to nearest-even (NaN stays NaN),
//! `bf16 → f32` is exact. Large slices are split into chunks and converted in
//! parallel with rayon; results are identical to the scalar path.

use half::bf16;
use rayon::prelude::*;

/// Element count below which conversion stays on the calling thread.
const PAR_THRESHOLD: usize = 1 << 16;

/// Chunk size for parallel conversion.
const CHUNK: usize = 1 << 14;

/// Convert `src` into `dst` (`f32 → bf16`).
///
/// Panics if the slices differ in length.
pub fn f32_to_bf16(src: &[f32], dst: &mut [bf16]) {
    assert_eq!(src.len(), dst.len(), "f32_to_bf16: length mismatch");
    if src.len() >= PAR_THRESHOLD {
        dst.par_chunks_mut(CHUNK)
            .zip(src.par_chunks(CHUNK))
            .for_each(|(d, s)| encode_chunk(s, d));
    } else {
        encode_chunk(src, dst);
    }
}

/// Convert `src` into `dst` (`bf16 → f32`).
///
/// Panics if the slices differ in length.
pub fn bf16_to_f32(src: &[bf16], dst: &mut [f32]) {
    assert_eq!(src.len(), dst.len(), "bf16_to_f32: length mismatch");
    if src.len() >= PAR_THRESHOLD {
        dst.par_chunks_mut(CHUNK)
            .zip(src.par_chunks(CHUNK))
            .for_each(|(d, s)| decode_chunk(s, d));
    } else {
        decode_chunk(src, dst);
    }
}

/// Allocate and convert (`f32 → bf16`).
pub fn f32_to_bf16_vec(src: &[f32]) -> Vec<bf16> {
    let mut out = vec![bf16::ZERO; src.len()];
    f32_to_bf16(src, &mut out);
    out
}

/// Allocate and convert (`bf16 → f32`).
pub fn bf16_to_f32_vec(src: &[bf16]) -> Vec<f32> {
    let mut out = vec![0.0f32; src.len()];
    bf16_to_f32(src, &mut out);
    out
}

#[inline]
fn encode_chunk(src: &[f32], dst: &mut [bf16]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = bf16::from_f32(s);
    }
}

#[inline]
fn decode_chunk(src: &[bf16], dst: &mut [f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s.to_f32();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_values_roundtrip() {
        let src = [0.0f32, 1.0, -2.0, 0.5, 1024.0, f32::INFINITY, f32::NEG_INFINITY];
        let enc = f32_to_bf16_vec(&src);
        assert_eq!(bf16_to_f32_vec(&enc), src);
    }

    #[test]
    fn test_round_to_nearest_even() {
        // 1 + 2^-8 lies exactly between two bf16 values; ties go to even (1.0).
        let tie = 1.0f32 + 2f32.powi(-8);
        assert_eq!(f32_to_bf16_vec(&[tie])[0].to_f32(), 1.0);
        // Just above the tie rounds up.
        let above = f32::from_bits(tie.to_bits() + 1);
        assert!(f32_to_bf16_vec(&[above])[0].to_f32() > 1.0);
    }

    #[test]
    fn test_nan_preserved() {
        let enc = f32_to_bf16_vec(&[f32::NAN]);
        assert!(enc[0].is_nan());
    }

    #[test]
    fn test_parallel_matches_scalar() {
        let n = PAR_THRESHOLD + 1234;
        let src: Vec<f32> = (0..n).map(|i| (i as f32 * 0.37).sin() * 100.0).collect();
        let par = f32_to_bf16_vec(&src);
        let mut scalar = vec![bf16::ZERO; n];
        encode_chunk(&src, &mut scalar);
        assert_eq!(par, scalar);

        let back = bf16_to_f32_vec(&par);
        let mut back_scalar = vec![0.0f32; n];
        decode_chunk(&scalar, &mut back_scalar);
        assert_eq!(back, back_scalar);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_encode_within_half_ulp(x in -1.0e30f32..1.0e30f32) {
                prop_assume!(x.abs() > 1.0e-30);
                let back = f32_to_bf16_vec(&[x])[0].to_f32();
                prop_assert!((back - x).abs() <= x.abs() * 2f32.powi(-8));
            }

            #[test]
            fn test_decode_then_encode_is_identity(bits in any::<u16>()) {
                let v = bf16::from_bits(bits);
                prop_assume!(!v.is_nan());
                let back = f32_to_bf16_vec(&bf16_to_f32_vec(&[v]));
                prop_assert_eq!(back[0].to_bits(), bits);
            }
        }
    }
}
