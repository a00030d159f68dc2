use std::fmt;
use std::sync::Arc;

use ndarray::{ArrayD, Axis, Zip};

use crate::error::{DistMathError, DistMathResult};
use crate::tensor::{broadcast_shapes, DType, Shape, Tensor, TensorType};

/// A differentiable primitive as seen by the graph engine.
///
/// Ops carry no per-evaluation state: `forward` and the gradient rule are
/// pure functions of their arguments, so one op value can be shared by many
/// graphs and called from many threads at once.
pub trait Op: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn infer_output_shape(&self, input_shapes: &[Shape]) -> DistMathResult<Vec<Shape>>;

    fn infer_output_dtype(&self, input_dtypes: &[DType]) -> DistMathResult<Vec<DType>>;

    fn forward(&self, inputs: &[&Tensor]) -> DistMathResult<Vec<Tensor>>;

    /// The gradient rule as an op of its own. It takes the forward inputs
    /// followed by one upstream gradient per output, and returns one
    /// gradient per forward input. Asking a gradient op for its `grad_op`
    /// is how second derivatives are requested.
    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>>;

    fn grad(&self, inputs: &[&Tensor], output_grads: &[&Tensor]) -> DistMathResult<Vec<Tensor>> {
        let rule = self.grad_op()?;
        let args: Vec<&Tensor> = inputs.iter().chain(output_grads).copied().collect();
        rule.forward(&args)
    }

    fn infer_output_types(&self, inputs: &[TensorType]) -> DistMathResult<Vec<TensorType>> {
        let shapes: Vec<Shape> = inputs.iter().map(|t| t.shape.clone()).collect();
        let dtypes: Vec<DType> = inputs.iter().map(|t| t.dtype).collect();
        let out_shapes = self.infer_output_shape(&shapes)?;
        let out_dtypes = self.infer_output_dtype(&dtypes)?;
        if out_shapes.len() != out_dtypes.len() {
            return Err(DistMathError::ArityMismatch {
                op: self.name(),
                expected: out_shapes.len(),
                found: out_dtypes.len(),
            });
        }
        Ok(out_shapes
            .into_iter()
            .zip(out_dtypes)
            .map(|(shape, dtype)| TensorType { shape, dtype })
            .collect())
    }
}

pub(crate) fn check_arity(op: &'static str, expected: usize, found: usize) -> DistMathResult<()> {
    if expected != found {
        return Err(DistMathError::ArityMismatch {
            op,
            expected,
            found,
        });
    }
    Ok(())
}

pub(crate) fn unsupported_order(op: &'static str, order: usize) -> DistMathResult<Arc<dyn Op>> {
    Err(DistMathError::UnsupportedDerivativeOrder { op, order })
}

/// Sum a broadcast gradient back down to the shape of the operand it came
/// from.
pub(crate) fn sum_to_shape(grad: &ArrayD<f64>, shape: &[usize]) -> ArrayD<f64> {
    let mut out = grad.clone();
    while out.ndim() > shape.len() {
        out = out.sum_axis(Axis(0));
    }
    for (axis, &dim) in shape.iter().enumerate() {
        if dim == 1 && out.shape()[axis] != 1 {
            out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    out
}

/// Elementwise `a + b` with NumPy broadcasting. The reverse pass uses it to
/// accumulate adjoints of nodes with several consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElemwiseAdd;

impl Op for ElemwiseAdd {
    fn name(&self) -> &'static str {
        "ElemwiseAdd"
    }

    fn infer_output_shape(&self, input_shapes: &[Shape]) -> DistMathResult<Vec<Shape>> {
        check_arity(self.name(), 2, input_shapes.len())?;
        let shape = broadcast_shapes(&input_shapes[0], &input_shapes[1]).ok_or_else(|| {
            DistMathError::ShapeMismatch {
                op: self.name(),
                left: input_shapes[0].clone(),
                right: input_shapes[1].clone(),
            }
        })?;
        Ok(vec![shape])
    }

    fn infer_output_dtype(&self, input_dtypes: &[DType]) -> DistMathResult<Vec<DType>> {
        check_arity(self.name(), 2, input_dtypes.len())?;
        Ok(vec![input_dtypes[0].upcast(input_dtypes[1])])
    }

    fn forward(&self, inputs: &[&Tensor]) -> DistMathResult<Vec<Tensor>> {
        check_arity(self.name(), 2, inputs.len())?;
        let (a, b) = (inputs[0], inputs[1]);
        let shape = &self.infer_output_shape(&[a.shape().to_vec(), b.shape().to_vec()])?[0];
        let av = a.broadcast_to(shape, self.name())?;
        let bv = b.broadcast_to(shape, self.name())?;
        let sum = Zip::from(&av).and(&bv).map_collect(|&x, &y| x + y);
        Ok(vec![Tensor::new(sum, a.dtype().upcast(b.dtype()))])
    }

    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>> {
        Ok(Arc::new(ElemwiseAddGrad))
    }
}

/// Routes the upstream gradient to both operands of [`ElemwiseAdd`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ElemwiseAddGrad;

impl Op for ElemwiseAddGrad {
    fn name(&self) -> &'static str {
        "ElemwiseAddGrad"
    }

    fn infer_output_shape(&self, input_shapes: &[Shape]) -> DistMathResult<Vec<Shape>> {
        check_arity(self.name(), 3, input_shapes.len())?;
        Ok(vec![input_shapes[0].clone(), input_shapes[1].clone()])
    }

    fn infer_output_dtype(&self, input_dtypes: &[DType]) -> DistMathResult<Vec<DType>> {
        check_arity(self.name(), 3, input_dtypes.len())?;
        Ok(vec![input_dtypes[0], input_dtypes[1]])
    }

    fn forward(&self, inputs: &[&Tensor]) -> DistMathResult<Vec<Tensor>> {
        check_arity(self.name(), 3, inputs.len())?;
        let (a, b, g) = (inputs[0], inputs[1], inputs[2]);
        Ok(vec![
            Tensor::new(sum_to_shape(g.data(), a.shape()), a.dtype()),
            Tensor::new(sum_to_shape(g.data(), b.shape()), b.dtype()),
        ])
    }

    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>> {
        unsupported_order(self.name(), 2)
    }
}
