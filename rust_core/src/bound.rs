//! Log-likelihood masking.
//!
//! `bound` replaces log-density values with `-inf` wherever a support
//! condition fails, which every bounded distribution relies on to report
//! zero probability outside its support. Two masking modes exist:
//!
//! - elementwise (`broadcast_conditions = true`): every condition is
//!   broadcast to the value's shape under NumPy rules and the value is kept
//!   only where all conditions hold;
//! - scalar (`broadcast_conditions = false`): every condition is reduced to
//!   one boolean with [`alltrue_scalar`] and the whole value is kept or
//!   replaced.
//!
//! A condition may never broadcast the value to a larger shape: the result
//! always has the value's shape, and a condition that would grow it is a
//! `ShapeMismatch`.

use std::borrow::Cow;
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn, Zip};
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::{DistMathError, DistMathResult};
use crate::op::{unsupported_order, Op};
use crate::tensor::{broadcast_shapes, truthy, DType, Shape, Tensor};

/// One support condition: a tensor tested elementwise for truthiness, or a
/// plain boolean.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Tensor(Tensor),
    Bool(bool),
}

impl Condition {
    fn as_tensor(&self) -> Cow<'_, Tensor> {
        match self {
            Condition::Tensor(t) => Cow::Borrowed(t),
            Condition::Bool(b) => Cow::Owned(Tensor::from_bool(*b)),
        }
    }
}

impl From<bool> for Condition {
    fn from(value: bool) -> Self {
        Condition::Bool(value)
    }
}

impl From<Tensor> for Condition {
    fn from(value: Tensor) -> Self {
        Condition::Tensor(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundOptions {
    pub broadcast_conditions: bool,
    /// When false the value is returned untouched.
    pub checks_enabled: bool,
}

impl Default for BoundOptions {
    fn default() -> Self {
        Self {
            broadcast_conditions: true,
            checks_enabled: true,
        }
    }
}

impl BoundOptions {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            broadcast_conditions: true,
            checks_enabled: config.check_bounds,
        }
    }

    pub fn scalar_conditions(mut self) -> Self {
        self.broadcast_conditions = false;
        self
    }
}

/// True iff every element of every condition is truthy. An empty list is
/// true. Always returns a zero-dimensional bool tensor.
pub fn alltrue_scalar(conditions: &[Condition]) -> Tensor {
    Tensor::from_bool(conditions.iter().all(|c| match c {
        Condition::Bool(b) => *b,
        Condition::Tensor(t) => t.all_truthy(),
    }))
}

/// Keep `value` where `conditions` hold and use `-inf` elsewhere.
pub fn bound(value: &Tensor, conditions: &[Condition], options: BoundOptions) -> DistMathResult<Tensor> {
    let tensors: Vec<Cow<'_, Tensor>> = conditions.iter().map(Condition::as_tensor).collect();
    let refs: Vec<&Tensor> = tensors.iter().map(|t| t.as_ref()).collect();
    mask_value(value, &refs, options)
}

fn mask_value(value: &Tensor, conditions: &[&Tensor], options: BoundOptions) -> DistMathResult<Tensor> {
    if !options.checks_enabled {
        return Ok(value.clone());
    }
    check_float_value(value.dtype())?;
    if !options.broadcast_conditions {
        if conditions.iter().all(|c| c.all_truthy()) {
            return Ok(value.clone());
        }
        return Ok(Tensor::full(value.shape(), f64::NEG_INFINITY, value.dtype()));
    }

    let mask = combined_mask(value.shape(), conditions)?;
    let masked = Zip::from(value.data())
        .and(&mask)
        .map_collect(|&v, &keep| if keep { v } else { f64::NEG_INFINITY });
    Ok(Tensor::new(masked, value.dtype()))
}

/// Elementwise AND of all conditions, broadcast to `shape`.
fn combined_mask(shape: &[usize], conditions: &[&Tensor]) -> DistMathResult<ArrayD<bool>> {
    let mut mask = ArrayD::from_elem(IxDyn(shape), true);
    for cond in conditions {
        let view = cond.broadcast_to(shape, "Bound")?;
        Zip::from(&mut mask).and(&view).for_each(|m, &c| *m &= truthy(c));
    }
    Ok(mask)
}

fn check_float_value(dtype: DType) -> DistMathResult<()> {
    if !dtype.is_float() {
        return Err(DistMathError::DTypeMismatch {
            op: "Bound",
            found: dtype,
            reason: "the masked value must be floating point",
        });
    }
    Ok(())
}

/// Graph form of [`bound`]. Inputs: `[value, condition...]`.
///
/// The `checks_enabled` flag is captured when the op is built, so it stays
/// constant for every evaluation of the compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound {
    options: BoundOptions,
}

impl Bound {
    pub fn new(broadcast_conditions: bool, checks_enabled: bool) -> Self {
        if !checks_enabled {
            debug!("bound constructed with checks disabled; conditions are ignored");
        }
        Self {
            options: BoundOptions {
                broadcast_conditions,
                checks_enabled,
            },
        }
    }
}

impl Op for Bound {
    fn name(&self) -> &'static str {
        "Bound"
    }

    fn infer_output_shape(&self, input_shapes: &[Shape]) -> DistMathResult<Vec<Shape>> {
        let (value, conditions) = input_shapes.split_first().ok_or(DistMathError::ArityMismatch {
            op: self.name(),
            expected: 1,
            found: 0,
        })?;
        if self.options.broadcast_conditions && self.options.checks_enabled {
            for cond in conditions {
                if broadcast_shapes(value, cond).as_ref() != Some(value) {
                    return Err(DistMathError::ShapeMismatch {
                        op: self.name(),
                        left: value.clone(),
                        right: cond.clone(),
                    });
                }
            }
        }
        Ok(vec![value.clone()])
    }

    fn infer_output_dtype(&self, input_dtypes: &[DType]) -> DistMathResult<Vec<DType>> {
        let value = *input_dtypes.first().ok_or(DistMathError::ArityMismatch {
            op: self.name(),
            expected: 1,
            found: 0,
        })?;
        if self.options.checks_enabled {
            check_float_value(value)?;
        }
        Ok(vec![value])
    }

    fn forward(&self, inputs: &[&Tensor]) -> DistMathResult<Vec<Tensor>> {
        let (value, conditions) = inputs.split_first().ok_or(DistMathError::ArityMismatch {
            op: self.name(),
            expected: 1,
            found: 0,
        })?;
        Ok(vec![mask_value(value, conditions, self.options)?])
    }

    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>> {
        Ok(Arc::new(BoundGrad {
            options: self.options,
        }))
    }
}

/// Gradient of [`Bound`]: the upstream gradient passes through where the
/// value was kept and is zero where it was masked. Conditions get zero.
/// Inputs: `[value, condition..., g]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundGrad {
    options: BoundOptions,
}

impl Op for BoundGrad {
    fn name(&self) -> &'static str {
        "BoundGrad"
    }

    fn infer_output_shape(&self, input_shapes: &[Shape]) -> DistMathResult<Vec<Shape>> {
        if input_shapes.len() < 2 {
            return Err(DistMathError::ArityMismatch {
                op: self.name(),
                expected: 2,
                found: input_shapes.len(),
            });
        }
        Ok(input_shapes[..input_shapes.len() - 1].to_vec())
    }

    fn infer_output_dtype(&self, input_dtypes: &[DType]) -> DistMathResult<Vec<DType>> {
        if input_dtypes.len() < 2 {
            return Err(DistMathError::ArityMismatch {
                op: self.name(),
                expected: 2,
                found: input_dtypes.len(),
            });
        }
        Ok(input_dtypes[..input_dtypes.len() - 1].to_vec())
    }

    fn forward(&self, inputs: &[&Tensor]) -> DistMathResult<Vec<Tensor>> {
        let (g, rest) = inputs.split_last().ok_or(DistMathError::ArityMismatch {
            op: self.name(),
            expected: 2,
            found: 0,
        })?;
        let (value, conditions) = rest.split_first().ok_or(DistMathError::ArityMismatch {
            op: self.name(),
            expected: 2,
            found: 1,
        })?;
        if g.shape() != value.shape() {
            return Err(DistMathError::ShapeMismatch {
                op: self.name(),
                left: value.shape().to_vec(),
                right: g.shape().to_vec(),
            });
        }

        let g_value = if !self.options.checks_enabled {
            Tensor::new(g.data().clone(), value.dtype())
        } else if !self.options.broadcast_conditions {
            if conditions.iter().all(|c| c.all_truthy()) {
                Tensor::new(g.data().clone(), value.dtype())
            } else {
                value.zeros_like()
            }
        } else {
            let mask = combined_mask(value.shape(), conditions)?;
            let masked = Zip::from(g.data())
                .and(&mask)
                .map_collect(|&gv, &keep| if keep { gv } else { 0.0 });
            Tensor::new(masked, value.dtype())
        };

        let mut grads = Vec::with_capacity(rest.len());
        grads.push(g_value);
        grads.extend(conditions.iter().map(|c| c.zeros_like()));
        Ok(grads)
    }

    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>> {
        unsupported_order(self.name(), 2)
    }
}

/// Graph form of [`alltrue_scalar`]. Accepts any number of inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllTrueScalar;

impl Op for AllTrueScalar {
    fn name(&self) -> &'static str {
        "AllTrueScalar"
    }

    fn infer_output_shape(&self, _input_shapes: &[Shape]) -> DistMathResult<Vec<Shape>> {
        Ok(vec![Vec::new()])
    }

    fn infer_output_dtype(&self, _input_dtypes: &[DType]) -> DistMathResult<Vec<DType>> {
        Ok(vec![DType::Bool])
    }

    fn forward(&self, inputs: &[&Tensor]) -> DistMathResult<Vec<Tensor>> {
        Ok(vec![Tensor::from_bool(inputs.iter().all(|t| t.all_truthy()))])
    }

    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>> {
        Ok(Arc::new(AllTrueScalarGrad))
    }
}

/// The reduction is piecewise constant, so every input gets a zero
/// gradient. Inputs: `[condition..., g]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllTrueScalarGrad;

impl Op for AllTrueScalarGrad {
    fn name(&self) -> &'static str {
        "AllTrueScalarGrad"
    }

    fn infer_output_shape(&self, input_shapes: &[Shape]) -> DistMathResult<Vec<Shape>> {
        let (_, conditions) = input_shapes.split_last().ok_or(DistMathError::ArityMismatch {
            op: self.name(),
            expected: 1,
            found: 0,
        })?;
        Ok(conditions.to_vec())
    }

    fn infer_output_dtype(&self, input_dtypes: &[DType]) -> DistMathResult<Vec<DType>> {
        let (_, conditions) = input_dtypes.split_last().ok_or(DistMathError::ArityMismatch {
            op: self.name(),
            expected: 1,
            found: 0,
        })?;
        Ok(conditions.to_vec())
    }

    fn forward(&self, inputs: &[&Tensor]) -> DistMathResult<Vec<Tensor>> {
        let (_, conditions) = inputs.split_last().ok_or(DistMathError::ArityMismatch {
            op: self.name(),
            expected: 1,
            found: 0,
        })?;
        Ok(conditions.iter().map(|c| c.zeros_like()).collect())
    }

    fn grad_op(&self) -> DistMathResult<Arc<dyn Op>> {
        unsupported_order(self.name(), 2)
    }
}
