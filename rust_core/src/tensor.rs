use std::fmt;

use half::f16;
use ndarray::{Array1, ArrayD, ArrayViewD, IxDyn};

use crate::error::{DistMathError, DistMathResult};

pub type Shape = Vec<usize>;

/// Element type of a tensor. Values are always held as `f64` but are
/// rounded to the precision of their dtype when a tensor is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Float16,
    Float32,
    Float64,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn is_float(self) -> bool {
        !matches!(self, DType::Bool)
    }

    fn rank(self) -> u8 {
        match self {
            DType::Bool => 0,
            DType::Float16 => 1,
            DType::Float32 => 2,
            DType::Float64 => 3,
        }
    }

    /// Smallest dtype able to hold values of both `self` and `other`.
    /// Booleans promote to the other operand's float type.
    pub fn upcast(self, other: DType) -> DType {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    /// Nearest value representable at this precision.
    pub fn round(self, x: f64) -> f64 {
        match self {
            DType::Bool => {
                if x != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::Float16 => f16::from_f64(x).to_f64(),
            DType::Float32 => x as f32 as f64,
            DType::Float64 => x,
        }
    }

    /// The representable values closest to 0 and 1 from inside the open
    /// interval `(0, 1)`. `None` for `Bool`.
    pub fn clip_bounds(self) -> Option<(f64, f64)> {
        match self {
            DType::Bool => None,
            DType::Float16 => Some((
                f16::from_bits(0x0001).to_f64(),
                f16::from_bits(0x3BFF).to_f64(),
            )),
            DType::Float32 => Some((
                f32::from_bits(0x0000_0001) as f64,
                f32::from_bits(0x3F7F_FFFF) as f64,
            )),
            DType::Float64 => Some((
                f64::from_bits(0x0000_0000_0000_0001),
                f64::from_bits(0x3FEF_FFFF_FFFF_FFFF),
            )),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape and dtype of a value, known during graph construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorType {
    pub fn new(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
        }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(&[], dtype)
    }
}

/// An immutable n-dimensional array tagged with its dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: ArrayD<f64>,
    dtype: DType,
}

impl Tensor {
    pub fn new(data: ArrayD<f64>, dtype: DType) -> Self {
        let data = match dtype {
            DType::Float64 => data,
            _ => data.mapv_into(|x| dtype.round(x)),
        };
        Self { data, dtype }
    }

    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(&[]), value), dtype)
    }

    pub fn from_bool(value: bool) -> Self {
        Self::scalar(if value { 1.0 } else { 0.0 }, DType::Bool)
    }

    pub fn from_vec(values: Vec<f64>, dtype: DType) -> Self {
        Self::new(Array1::from_vec(values).into_dyn(), dtype)
    }

    pub fn from_shape_vec(shape: &[usize], values: Vec<f64>, dtype: DType) -> DistMathResult<Self> {
        let len = values.len();
        let data = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
            DistMathError::ShapeMismatch {
                op: "Tensor::from_shape_vec",
                left: shape.to_vec(),
                right: vec![len],
            }
        })?;
        Ok(Self::new(data, dtype))
    }

    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(shape), value), dtype)
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, 0.0, dtype)
    }

    pub fn ones(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, 1.0, dtype)
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape(), self.dtype)
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn tensor_type(&self) -> TensorType {
        TensorType::new(self.shape(), self.dtype)
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn into_data(self) -> ArrayD<f64> {
        self.data
    }

    /// The single value of a zero-dimensional tensor.
    pub fn to_scalar(&self) -> DistMathResult<f64> {
        if self.ndim() != 0 {
            return Err(DistMathError::NotScalar(self.shape().to_vec()));
        }
        Ok(self.data.iter().next().copied().unwrap_or(f64::NAN))
    }

    /// Elementwise map keeping the dtype.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        Tensor::new(self.data.mapv(f), self.dtype)
    }

    /// True iff every element is truthy (non-zero; NaN counts as truthy).
    pub fn all_truthy(&self) -> bool {
        self.data.iter().all(|&x| truthy(x))
    }

    /// View of the data broadcast to `shape` under NumPy rules.
    pub fn broadcast_to(&self, shape: &[usize], op: &'static str) -> DistMathResult<ArrayViewD<'_, f64>> {
        self.data
            .broadcast(IxDyn(shape))
            .ok_or_else(|| DistMathError::ShapeMismatch {
                op,
                left: shape.to_vec(),
                right: self.shape().to_vec(),
            })
    }
}

pub(crate) fn truthy(x: f64) -> bool {
    x != 0.0
}

/// NumPy broadcasting of two shapes: dimensions are right-aligned and must
/// be equal or 1.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let ndim = a.len().max(b.len());
    let mut out = vec![0; ndim];
    for i in 0..ndim {
        let da = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
        let db = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shapes(&[2, 1], &[1, 4]), Some(vec![2, 4]));
        assert_eq!(broadcast_shapes(&[], &[5]), Some(vec![5]));
        assert_eq!(broadcast_shapes(&[3], &[4]), None);
    }

    #[test]
    fn test_rounding_follows_dtype() {
        let t = Tensor::from_vec(vec![0.1, 1.0 / 3.0], DType::Float32);
        assert_eq!(t.data()[[0]], 0.1f32 as f64);
        let h = Tensor::scalar(1.0 / 3.0, DType::Float16);
        assert_eq!(h.to_scalar().unwrap(), f16::from_f64(1.0 / 3.0).to_f64());
        assert_eq!(Tensor::scalar(-2.5, DType::Bool).to_scalar().unwrap(), 1.0);
    }

    #[test]
    fn test_clip_bounds_are_strictly_inside_unit_interval() {
        for dtype in [DType::Float16, DType::Float32, DType::Float64] {
            let (lo, hi) = dtype.clip_bounds().unwrap();
            assert!(lo > 0.0 && hi < 1.0, "{dtype}");
            assert_eq!(dtype.round(lo), lo);
            assert_eq!(dtype.round(hi), hi);
            assert_eq!(dtype.round(hi + (1.0 - hi) * 0.75), 1.0);
        }
        assert!(DType::Bool.clip_bounds().is_none());
    }

    #[test]
    fn test_upcast() {
        assert_eq!(DType::Float16.upcast(DType::Float32), DType::Float32);
        assert_eq!(DType::Float64.upcast(DType::Bool), DType::Float64);
        assert_eq!(DType::Bool.upcast(DType::Bool), DType::Bool);
    }

    #[test]
    fn test_truthiness() {
        assert!(Tensor::from_vec(vec![1.0, -1.0, f64::NAN], DType::Float64).all_truthy());
        assert!(!Tensor::from_vec(vec![1.0, 0.0], DType::Float64).all_truthy());
        assert!(Tensor::from_vec(vec![], DType::Float64).all_truthy());
    }

    #[test]
    fn test_to_scalar_rejects_vectors() {
        let v = Tensor::ones(&[2], DType::Float64);
        assert_eq!(v.to_scalar(), Err(DistMathError::NotScalar(vec![2])));
    }
}
