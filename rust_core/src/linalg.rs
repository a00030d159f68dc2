//! Bridges between `ndarray` matrices and `nalgebra` factorizations.

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2};

/// Copy an `ndarray` matrix into a `DMatrix`.
pub fn to_dmatrix(a: ArrayView2<'_, f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

/// Copy a `DMatrix` back into an `ndarray` matrix.
pub fn to_array2(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Lower-triangular `L` with `L * L^T = a`, or `None` when `a` is not
/// positive definite.
///
/// Only the lower triangle of `a` is read. A factor with a zero or
/// non-finite diagonal entry counts as a failure.
pub fn cholesky_lower(a: ArrayView2<'_, f64>) -> Option<DMatrix<f64>> {
    let l = to_dmatrix(a).cholesky()?.unpack();
    l.diagonal()
        .iter()
        .all(|d| *d > 0.0 && d.is_finite())
        .then_some(l)
}
