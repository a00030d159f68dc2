use std::sync::Arc;

use ndarray::Zip;

use crate::error::{DistMathError, DistMathResult};
use crate::op::{check_arity, unsupported_order, Op};
use crate::special::{i0e, i0e_derivative};
use crate::tensor::{DType, Shape, Tensor};

fn check_float(op: &'static str, dtype: DType) -> DistMathResult<()> {
    if !dtype.is_float() {
        return Err(DistMathError::DTypeMismatch {
            op,
            found: dtype,
            reason: "expected a floating point input",
        });
    }
    Ok(())
}

/// Elementwise `exp(-|x|) * I0(x)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct I0e;

impl Op for I0e {
    fn name(&self) -> &'static str {
        "I0e"
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
        Ok(vec![inputs[0].map(i0e)])
    }

    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>> {
        Ok(Arc::new(I0eGrad))
    }
}

/// `g * (i1e(x) - sign(x) * i0e(x))`. Inputs: `[x, g]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct I0eGrad;

impl Op for I0eGrad {
    fn name(&self) -> &'static str {
        "I0eGrad"
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
            .map_collect(|&xv, &gv| gv * i0e_derivative(xv));
        Ok(vec![Tensor::new(dx, x.dtype())])
    }

    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>> {
        unsupported_order("I0e", 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{grad, Function};
    use crate::graph::Graph;
    use crate::testing::{tensor, verify_grad};

    #[test]
    fn test_grad_scalar_inputs() {
        verify_grad(&I0e, &[Tensor::scalar(0.5, DType::Float64)], &[0], 1e-6);
        verify_grad(&I0e, &[Tensor::scalar(-2.0, DType::Float64)], &[0], 1e-6);
    }

    #[test]
    fn test_grad_tensor_inputs() {
        verify_grad(&I0e, &[tensor(&[2], &[0.5, -2.0])], &[0], 1e-6);
        verify_grad(&I0e, &[tensor(&[1, 2], &[0.5, -2.0])], &[0], 1e-6);
        verify_grad(&I0e, &[tensor(&[4], &[3.0, 19.5, 21.0, -60.0])], &[0], 1e-6);
    }

    #[test]
    fn test_forward_keeps_shape_and_dtype() {
        let x = Tensor::from_shape_vec(&[1, 3], vec![0.0, 1.0, -1.0], DType::Float32).unwrap();
        let out = I0e.forward(&[&x]).unwrap().remove(0);
        assert_eq!(out.shape(), &[1, 3]);
        assert_eq!(out.dtype(), DType::Float32);
        assert_eq!(out.data()[[0, 1]], out.data()[[0, 2]]);
        assert_eq!(out.data()[[0, 1]], i0e(1.0) as f32 as f64);
    }

    #[test]
    fn test_rejects_bool_input() {
        assert!(matches!(
            I0e.infer_output_dtype(&[DType::Bool]),
            Err(DistMathError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_graph_gradient_and_second_order() {
        let mut g = Graph::default();
        let x = g.input("x", &[], DType::Float64);
        let y = g.i0e(x).unwrap();
        let gx = grad(&mut g, y, &[x]).unwrap()[0];
        let f = Function::compile(&g, &[x], &[gx]).unwrap();
        let out = f.call(&[Tensor::scalar(0.5, DType::Float64)]).unwrap();
        assert_eq!(out[0].to_scalar().unwrap(), i0e_derivative(0.5));

        assert_eq!(
            grad(&mut g, gx, &[x]),
            Err(DistMathError::UnsupportedDerivativeOrder { op: "I0e", order: 2 })
        );
    }
}
