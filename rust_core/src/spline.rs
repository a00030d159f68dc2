//! Univariate interpolants adapted into graph ops.
//!
//! The wrapped interpolant only exposes a value and a first derivative, so
//! the op supports exactly one level of differentiation.

use std::fmt;
use std::sync::Arc;

use ndarray::Zip;

use crate::error::{DistMathError, DistMathResult};
use crate::op::{check_arity, unsupported_order, Op};
use crate::tensor::{DType, Shape, Tensor};

/// A one-dimensional function with a first derivative.
pub trait Interpolant: fmt::Debug + Send + Sync {
    fn evaluate(&self, x: f64) -> f64;

    fn derivative(&self, x: f64) -> f64;
}

/// Piecewise-linear interpolant through `(knots[i], values[i])`,
/// extrapolated linearly from the end segments.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSpline {
    knots: Vec<f64>,
    values: Vec<f64>,
}

impl LinearSpline {
    pub fn new(knots: Vec<f64>, values: Vec<f64>) -> DistMathResult<Self> {
        if knots.len() != values.len() {
            return Err(DistMathError::InvalidSpline {
                reason: "knots and values differ in length",
            });
        }
        if knots.len() < 2 {
            return Err(DistMathError::InvalidSpline {
                reason: "at least two knots are required",
            });
        }
        if knots.iter().chain(&values).any(|v| !v.is_finite()) {
            return Err(DistMathError::InvalidSpline {
                reason: "knots and values must be finite",
            });
        }
        if knots.windows(2).any(|w| w[1] <= w[0]) {
            return Err(DistMathError::InvalidSpline {
                reason: "knots must be strictly increasing",
            });
        }
        Ok(Self { knots, values })
    }

    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Index `i` of the segment `[knots[i], knots[i + 1]]` used for `x`.
    fn segment(&self, x: f64) -> usize {
        let last = self.knots.len() - 2;
        self.knots
            .partition_point(|&k| k <= x)
            .saturating_sub(1)
            .min(last)
    }

    fn slope(&self, i: usize) -> f64 {
        (self.values[i + 1] - self.values[i]) / (self.knots[i + 1] - self.knots[i])
    }
}

impl Interpolant for LinearSpline {
    fn evaluate(&self, x: f64) -> f64 {
        let i = self.segment(x);
        self.values[i] + self.slope(i) * (x - self.knots[i])
    }

    fn derivative(&self, x: f64) -> f64 {
        self.slope(self.segment(x))
    }
}

fn check_float(op: &'static str, dtype: DType) -> DistMathResult<()> {
    if !dtype.is_float() {
        return Err(DistMathError::DTypeMismatch {
            op,
            found: dtype,
            reason: "spline input must be floating point",
        });
    }
    Ok(())
}

/// Applies an [`Interpolant`] elementwise.
#[derive(Clone)]
pub struct SplineWrapper {
    interpolant: Arc<dyn Interpolant>,
}

impl SplineWrapper {
    pub fn new(interpolant: Arc<dyn Interpolant>) -> Self {
        Self { interpolant }
    }
}

impl fmt::Debug for SplineWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplineWrapper")
            .field("interpolant", &self.interpolant)
            .finish()
    }
}

impl Op for SplineWrapper {
    fn name(&self) -> &'static str {
        "SplineWrapper"
    }

    fn infer_output_shape(&self, input_shapes: &[Shape]) -> DistMathResult<Vec<Shape>> {
        check_arity(self.name(), 1, input_shapes.len())?;
        Ok(vec![input_shapes[0].clone()])
    }

    fn infer_output_dtype(&self, input_dtypes: &[DType]) -> DistMathResult<Vec<DType>> {
        check_arity(self.name(), 1, input_dtypes.len())?;
        check_float(self.name(), input_dtypes[0])?;
        Ok(vec![input_dtypes[0]])
    }

    fn forward(&self, inputs: &[&Tensor]) -> DistMathResult<Vec<Tensor>> {
        check_arity(self.name(), 1, inputs.len())?;
        check_float(self.name(), inputs[0].dtype())?;
        Ok(vec![inputs[0].map(|x| self.interpolant.evaluate(x))])
    }

    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>> {
        Ok(Arc::new(SplineDerivative {
            interpolant: Arc::clone(&self.interpolant),
        }))
    }
}

/// `g * interpolant.derivative(x)`. Inputs: `[x, g]`.
#[derive(Clone)]
pub struct SplineDerivative {
    interpolant: Arc<dyn Interpolant>,
}

impl fmt::Debug for SplineDerivative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplineDerivative")
            .field("interpolant", &self.interpolant)
            .finish()
    }
}

impl Op for SplineDerivative {
    fn name(&self) -> &'static str {
        "SplineDerivative"
    }

    fn infer_output_shape(&self, input_shapes: &[Shape]) -> DistMathResult<Vec<Shape>> {
        check_arity(self.name(), 2, input_shapes.len())?;
        if input_shapes[0] != input_shapes[1] {
            return Err(DistMathError::ShapeMismatch {
                op: self.name(),
                left: input_shapes[0].clone(),
                right: input_shapes[1].clone(),
            });
        }
        Ok(vec![input_shapes[0].clone()])
    }

    fn infer_output_dtype(&self, input_dtypes: &[DType]) -> DistMathResult<Vec<DType>> {
        check_arity(self.name(), 2, input_dtypes.len())?;
        check_float(self.name(), input_dtypes[0])?;
        Ok(vec![input_dtypes[0]])
    }

    fn forward(&self, inputs: &[&Tensor]) -> DistMathResult<Vec<Tensor>> {
        check_arity(self.name(), 2, inputs.len())?;
        let (x, g) = (inputs[0], inputs[1]);
        let gv = g.broadcast_to(x.shape(), self.name())?;
        let dx = Zip::from(x.data())
            .and(&gv)
            .map_collect(|&xv, &gv| gv * self.interpolant.derivative(xv));
        Ok(vec![Tensor::new(dx, x.dtype())])
    }

    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>> {
        unsupported_order("SplineWrapper", 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{grad, Function};
    use crate::graph::Graph;
    use crate::testing::{tensor, verify_grad};
    use approx::assert_relative_eq;

    fn squares(n: usize) -> Arc<LinearSpline> {
        let knots: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
        let values = knots.iter().map(|x| x * x).collect();
        Arc::new(LinearSpline::new(knots, values).unwrap())
    }

    #[test]
    fn test_linear_spline_interpolates_and_extrapolates() {
        let s = LinearSpline::new(vec![0.0, 1.0, 3.0], vec![1.0, 3.0, 2.0]).unwrap();
        assert_eq!(s.evaluate(0.0), 1.0);
        assert_eq!(s.evaluate(0.5), 2.0);
        assert_eq!(s.evaluate(1.0), 3.0);
        assert_eq!(s.evaluate(2.0), 2.5);
        assert_eq!(s.evaluate(-1.0), -1.0);
        assert_eq!(s.evaluate(5.0), 1.0);
        assert_eq!(s.derivative(0.5), 2.0);
        assert_eq!(s.derivative(1.0), -0.5);
        assert_eq!(s.derivative(10.0), -0.5);
        assert_eq!(s.knots(), &[0.0, 1.0, 3.0]);
        assert_eq!(s.values(), &[1.0, 3.0, 2.0]);
    }

    #[test]
    fn test_linear_spline_validation() {
        assert!(matches!(
            LinearSpline::new(vec![0.0], vec![1.0]),
            Err(DistMathError::InvalidSpline { .. })
        ));
        assert!(matches!(
            LinearSpline::new(vec![0.0, 1.0], vec![1.0]),
            Err(DistMathError::InvalidSpline { .. })
        ));
        assert!(matches!(
            LinearSpline::new(vec![0.0, 0.0, 1.0], vec![1.0, 2.0, 3.0]),
            Err(DistMathError::InvalidSpline { .. })
        ));
        assert!(matches!(
            LinearSpline::new(vec![0.0, f64::NAN], vec![1.0, 2.0]),
            Err(DistMathError::InvalidSpline { .. })
        ));
    }

    #[test]
    fn test_grad_matches_finite_differences() {
        let op = SplineWrapper::new(squares(100));
        verify_grad(&op, &[Tensor::scalar(0.5, DType::Float64)], &[0], 1e-6);
        verify_grad(&op, &[tensor(&[3], &[0.1, 0.37, 0.91])], &[0], 1e-6);
    }

    #[test]
    fn test_graph_gradient_and_no_hessian() {
        let mut g = Graph::default();
        let x = g.input("x", &[], DType::Float64);
        let y = g.spline(squares(100), x).unwrap();
        let gx = grad(&mut g, y, &[x]).unwrap()[0];

        let f = Function::compile(&g, &[x], &[y, gx]).unwrap();
        let out = f.call(&[Tensor::scalar(0.5, DType::Float64)]).unwrap();
        // Knots 49/99 and 50/99 bracket 0.5; the chord slope of x^2 is their sum.
        assert_relative_eq!(out[1].to_scalar().unwrap(), 1.0, max_relative = 1e-12);
        assert_relative_eq!(out[0].to_scalar().unwrap(), 0.25, max_relative = 1e-3);

        assert_eq!(
            grad(&mut g, gx, &[x]),
            Err(DistMathError::UnsupportedDerivativeOrder { op: "SplineWrapper", order: 2 })
        );
    }

    #[test]
    fn test_rejects_bool_input() {
        let op = SplineWrapper::new(squares(3));
        assert!(op.forward(&[&Tensor::from_bool(true)]).is_err());
    }
}
