pub mod autodiff;
pub mod bessel;
pub mod bound;
pub mod config;
pub mod error;
pub mod graph;
pub mod linalg;
pub mod mv_normal;
pub mod op;
pub mod sampling;
pub mod special;
pub mod spline;
pub mod tensor;

#[cfg(test)]
mod testing;

pub use autodiff::{grad, Function};
pub use config::ModelConfig;
pub use error::{DistMathError, DistMathResult};
pub use graph::{Graph, NodeId};
pub use op::Op;
pub use tensor::{DType, Shape, Tensor, TensorType};
