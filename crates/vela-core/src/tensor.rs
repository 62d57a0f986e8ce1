use std::fmt;

use half::bf16;

use crate::dtype::DType;
use crate::element::{cast_slice_into, Element};
use crate::error::VelaError;
use crate::shape::Shape;
use crate::Result;

/// Typed backing storage for a [`Tensor`].
///
/// The variant is the element type; there is no way to view the data as
/// another type without going through an explicit conversion.
#[derive(Clone, PartialEq)]
pub enum TensorData {
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::BF16(_) => DType::BF16,
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::BF16(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn zeros(dtype: DType, numel: usize) -> Result<Self> {
        Ok(match dtype {
            DType::BF16 => TensorData::BF16(vec![bf16::ZERO; numel]),
            DType::F32 => TensorData::F32(vec![0.0; numel]),
            DType::I32 => TensorData::I32(vec![0; numel]),
            DType::I64 => TensorData::I64(vec![0; numel]),
            DType::F16 => return Err(VelaError::UnsupportedDType(dtype)),
        })
    }
}

/// A host tensor as handed over by the inference runtime.
///
/// Always contiguous, row-major. Views are plain slices obtained through
/// [`Tensor::as_slice`] after a dtype check.
///
/// ```
/// use vela_core::{DType, Tensor};
///
/// let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
/// assert_eq!(t.dtype(), DType::F32);
/// assert_eq!(t.as_slice::<f32>().unwrap()[3], 4.0);
/// assert!(t.as_slice::<half::bf16>().is_err());
/// ```
#[derive(Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
    shape: Shape,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Wrap an element vector with the given shape.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(VelaError::InvalidShape(format!(
                "shape {} requires {} elements, got {}",
                s,
                s.numel(),
                data.len()
            )));
        }
        Ok(Self {
            data: T::wrap(data),
            shape: s,
        })
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Result<Self> {
        let s = Shape::new(shape);
        Ok(Self {
            data: TensorData::zeros(dtype, s.numel())?,
            shape: s,
        })
    }

    /// Create a tensor from f32 values, converting to `dtype`.
    pub fn from_f32(values: &[f32], shape: &[usize], dtype: DType) -> Result<Self> {
        let mut t = Self::zeros(shape, dtype)?;
        if t.numel() != values.len() {
            return Err(VelaError::InvalidShape(format!(
                "shape {:?} requires {} elements, got {}",
                shape,
                t.numel(),
                values.len()
            )));
        }
        match &mut t.data {
            TensorData::BF16(v) => cast_slice_into(values, v),
            TensorData::F32(v) => v.copy_from_slice(values),
            TensorData::I32(v) => cast_slice_into(values, v),
            TensorData::I64(v) => cast_slice_into(values, v),
        }
        Ok(t)
    }

    /// Create a 0-d i64 scalar (e.g. `total_sequence_length`).
    pub fn scalar_i64(value: i64) -> Self {
        Self {
            data: TensorData::I64(vec![value]),
            shape: Shape::scalar(),
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Typed read-only view. Fails if `T` is not this tensor's element type.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        T::view(&self.data).ok_or(VelaError::DTypeMismatch {
            expected: T::DTYPE,
            got: self.dtype(),
        })
    }

    /// Typed mutable view. Fails if `T` is not this tensor's element type.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        let got = self.dtype();
        T::view_mut(&mut self.data).ok_or(VelaError::DTypeMismatch {
            expected: T::DTYPE,
            got,
        })
    }

    /// Copy the contents out as f32, converting as needed.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::BF16(v) => crate::codec::bf16_to_f32_vec(v),
            TensorData::F32(v) => v.clone(),
            TensorData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::I64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Read an integer tensor as `usize` values (sequence lengths, positions).
    pub fn to_index_vec(&self) -> Result<Vec<usize>> {
        let raw: Vec<i64> = match &self.data {
            TensorData::I32(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::I64(v) => v.clone(),
            _ => return Err(VelaError::UnsupportedDType(self.dtype())),
        };
        raw.into_iter()
            .map(|x| {
                usize::try_from(x).map_err(|_| {
                    VelaError::InvalidShape(format!("negative index value {x}"))
                })
            })
            .collect()
    }

    /// Reinterpret the shape without touching data.
    pub fn reshape(mut self, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != self.numel() {
            return Err(VelaError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: shape.to_vec(),
            });
        }
        self.shape = s;
        Ok(self)
    }

    /// Fail with `UnsupportedDType` unless this is an attention activation type.
    pub fn ensure_attention_dtype(&self) -> Result<DType> {
        let dtype = self.dtype();
        if dtype.is_attention_supported() {
            Ok(dtype)
        } else {
            Err(VelaError::UnsupportedDType(dtype))
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={}, dtype={})", self.shape, self.dtype())
    }
}

/// Maps an element type onto its [`TensorData`] variant.
pub trait TensorElement: Sized {
    fn wrap(data: Vec<Self>) -> TensorData;
    fn view(data: &TensorData) -> Option<&[Self]>;
    fn view_mut(data: &mut TensorData) -> Option<&mut [Self]>;
}

macro_rules! impl_tensor_element {
    ($ty:ty, $variant:ident) => {
        impl TensorElement for $ty {
            fn wrap(data: Vec<Self>) -> TensorData {
                TensorData::$variant(data)
            }

            fn view(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn view_mut(data: &mut TensorData) -> Option<&mut [Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_tensor_element!(bf16, BF16);
impl_tensor_element!(f32, F32);
impl_tensor_element!(i32, I32);
impl_tensor_element!(i64, I64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_validates_shape() {
        assert!(Tensor::from_vec(vec![1.0f32; 5], &[2, 3]).is_err());
        let t = Tensor::from_vec(vec![1.0f32; 6], &[2, 3]).unwrap();
        assert_eq!(t.numel(), 6);
    }

    #[test]
    fn test_typed_view_checks_dtype() {
        let t = Tensor::zeros(&[4], DType::BF16).unwrap();
        assert!(t.as_slice::<bf16>().is_ok());
        match t.as_slice::<f32>() {
            Err(VelaError::DTypeMismatch { expected, got }) => {
                assert_eq!(expected, DType::F32);
                assert_eq!(got, DType::BF16);
            }
            other => panic!("expected dtype mismatch, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_f16_unsupported() {
        assert!(matches!(
            Tensor::zeros(&[2], DType::F16),
            Err(VelaError::UnsupportedDType(DType::F16))
        ));
    }

    #[test]
    fn test_to_index_vec() {
        let t = Tensor::from_vec(vec![3i32, 0, 7], &[3]).unwrap();
        assert_eq!(t.to_index_vec().unwrap(), vec![3, 0, 7]);
        let neg = Tensor::from_vec(vec![-1i64], &[1]).unwrap();
        assert!(neg.to_index_vec().is_err());
        let f = Tensor::from_vec(vec![1.0f32], &[1]).unwrap();
        assert!(f.to_index_vec().is_err());
    }

    #[test]
    fn test_from_f32_converts() {
        let t = Tensor::from_f32(&[0.5, 1.5], &[2], DType::BF16).unwrap();
        assert_eq!(t.to_f32_vec(), vec![0.5, 1.5]);
    }

    #[test]
    fn test_reshape() {
        let t = Tensor::zeros(&[2, 6], DType::F32).unwrap();
        let r = t.clone().reshape(&[3, 4]).unwrap();
        assert_eq!(r.dims(), &[3, 4]);
        assert!(t.reshape(&[5]).is_err());
    }
}
