//! Element types that can back a tensor or a pooled buffer.

use half::bf16;

use crate::dtype::DType;
use crate::tensor::TensorElement;

/// A plain-old-data scalar with a fixed [`DType`] tag.
///
/// Conversions go through `f32`, which is exact for `bf16` and is how both
/// datapaths accumulate.
pub trait Element:
    bytemuck::Pod + TensorElement + Send + Sync + Default + PartialEq + std::fmt::Debug
{
    const DTYPE: DType;

    fn to_f32(self) -> f32;

    fn from_f32(v: f32) -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for bf16 {
    const DTYPE: DType = DType::BF16;

    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v as i32
    }
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v as i64
    }
}

/// Convert between element types through `f32`.
///
/// Same-type copies are bit-exact; `f32 → bf16` rounds to nearest-even.
#[inline]
pub fn cast<S: Element, D: Element>(v: S) -> D {
    D::from_f32(v.to_f32())
}

/// Copy `src` into `dst`, converting element types.
///
/// Panics if the slices differ in length.
pub fn cast_slice_into<S: Element, D: Element>(src: &[S], dst: &mut [D]) {
    assert_eq!(src.len(), dst.len(), "cast_slice_into: length mismatch");
    if S::DTYPE == D::DTYPE {
        // Same tag means same type; copy the bytes.
        bytemuck::cast_slice_mut::<D, u8>(dst).copy_from_slice(bytemuck::cast_slice::<S, u8>(src));
        return;
    }
    for (d, s) in dst.iter_mut().zip(src) {
        *d = cast(*s);
    }
}
