use thiserror::Error;

use crate::tensor::{DType, Shape};

/// Crate-wide result alias.
pub type DistMathResult<T> = Result<T, DistMathError>;

/// Failures raised while building or evaluating log-likelihood primitives.
///
/// An invalid covariance matrix is deliberately absent: `MvNormalLogp`
/// reports it as a `-inf` log-density so samplers can reject the proposal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DistMathError {
    #[error("{op}: shapes {left:?} and {right:?} do not broadcast to {left:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Shape,
        right: Shape,
    },

    #[error("{op}: unsupported dtype {found} ({reason})")]
    DTypeMismatch {
        op: &'static str,
        found: DType,
        reason: &'static str,
    },

    #[error("{op}: expected {expected} inputs, got {found}")]
    ArityMismatch {
        op: &'static str,
        expected: usize,
        found: usize,
    },

    /// The op does not provide a gradient rule for this derivative order.
    #[error("{op} does not implement derivatives of order {order}")]
    UnsupportedDerivativeOrder { op: &'static str, order: usize },

    #[error("invalid parameter `{name}` = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: String,
    },

    #[error("invalid spline: {reason}")]
    InvalidSpline { reason: &'static str },

    #[error("invalid configuration value for {key}: {value:?}")]
    InvalidConfig { key: &'static str, value: String },

    #[error("node {0} does not belong to this graph")]
    UnknownNode(usize),

    #[error("input node {0} is needed but was not passed to compile")]
    MissingInput(usize),

    #[error("expected a scalar, got shape {0:?}")]
    NotScalar(Shape),
}
