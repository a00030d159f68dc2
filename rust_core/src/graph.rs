use std::collections::HashMap;
use std::sync::Arc;

use crate::bessel::I0e;
use crate::bound::{AllTrueScalar, Bound};
use crate::config::ModelConfig;
use crate::error::{DistMathError, DistMathResult};
use crate::mv_normal::MvNormalLogp;
use crate::op::{ElemwiseAdd, Op};
use crate::spline::{Interpolant, SplineWrapper};
use crate::tensor::{DType, Tensor, TensorType};

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Where a node's value comes from.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A value supplied when the compiled function is called.
    Input,
    /// A value baked into the graph.
    Constant(Tensor),
    /// The `output`-th result of application `app`.
    Apply { app: usize, output: usize },
}

/// A single node in the computation graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub ty: TensorType,
    pub name: Option<String>,
}

/// One use of an op on a list of nodes.
#[derive(Debug, Clone)]
pub struct Application {
    pub op: Arc<dyn Op>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

/// Symbolic computation graph.
///
/// Nodes are stored in topological order (each application only references
/// earlier nodes). Building the graph only runs shape and dtype inference;
/// no numeric work happens until a [`Function`](crate::autodiff::Function)
/// compiled from it is called.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub applications: Vec<Application>,
    config: ModelConfig,
    name_to_node: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            nodes: Vec::new(),
            applications: Vec::new(),
            config,
            name_to_node: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn add_node(&mut self, kind: NodeKind, ty: TensorType, name: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(ref n) = name {
            self.name_to_node.insert(n.clone(), id);
        }
        self.nodes.push(Node { id, kind, ty, name });
        id
    }

    pub fn node(&self, id: NodeId) -> DistMathResult<&Node> {
        self.nodes.get(id.0).ok_or(DistMathError::UnknownNode(id.0))
    }

    pub fn tensor_type(&self, id: NodeId) -> DistMathResult<&TensorType> {
        Ok(&self.node(id)?.ty)
    }

    pub fn input(&mut self, name: &str, shape: &[usize], dtype: DType) -> NodeId {
        self.add_node(
            NodeKind::Input,
            TensorType::new(shape, dtype),
            Some(name.to_string()),
        )
    }

    pub fn constant(&mut self, value: Tensor) -> NodeId {
        let ty = value.tensor_type();
        self.add_node(NodeKind::Constant(value), ty, None)
    }

    /// Scalar constant in the configured `float_x` precision.
    pub fn scalar(&mut self, value: f64) -> NodeId {
        let dtype = self.config.float_x;
        self.constant(Tensor::scalar(value, dtype))
    }

    pub fn bool_constant(&mut self, value: bool) -> NodeId {
        self.constant(Tensor::from_bool(value))
    }

    /// Apply `op` to `inputs`, returning one node per op output.
    pub fn apply(&mut self, op: Arc<dyn Op>, inputs: &[NodeId]) -> DistMathResult<Vec<NodeId>> {
        let input_types = inputs
            .iter()
            .map(|&id| self.tensor_type(id).cloned())
            .collect::<DistMathResult<Vec<_>>>()?;
        let output_types = op.infer_output_types(&input_types)?;

        let app = self.applications.len();
        let outputs: Vec<NodeId> = output_types
            .into_iter()
            .enumerate()
            .map(|(output, ty)| self.add_node(NodeKind::Apply { app, output }, ty, None))
            .collect();
        self.applications.push(Application {
            op,
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
        });
        Ok(outputs)
    }

    /// Apply a single-output op.
    pub fn apply1(&mut self, op: Arc<dyn Op>, inputs: &[NodeId]) -> DistMathResult<NodeId> {
        let name = op.name();
        let outputs = self.apply(op, inputs)?;
        match outputs.as_slice() {
            [only] => Ok(*only),
            _ => Err(DistMathError::ArityMismatch {
                op: name,
                expected: 1,
                found: outputs.len(),
            }),
        }
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> DistMathResult<NodeId> {
        self.apply1(Arc::new(ElemwiseAdd), &[a, b])
    }

    /// Mask `value` with `-inf` wherever `conditions` fail. The model's
    /// `check_bounds` flag is captured here, at construction time.
    pub fn bound(
        &mut self,
        value: NodeId,
        conditions: &[NodeId],
        broadcast_conditions: bool,
    ) -> DistMathResult<NodeId> {
        let op = Bound::new(broadcast_conditions, self.config.check_bounds);
        let mut inputs = Vec::with_capacity(conditions.len() + 1);
        inputs.push(value);
        inputs.extend_from_slice(conditions);
        self.apply1(Arc::new(op), &inputs)
    }

    pub fn alltrue_scalar(&mut self, conditions: &[NodeId]) -> DistMathResult<NodeId> {
        self.apply1(Arc::new(AllTrueScalar), conditions)
    }

    pub fn i0e(&mut self, x: NodeId) -> DistMathResult<NodeId> {
        self.apply1(Arc::new(I0e), &[x])
    }

    pub fn spline(&mut self, interpolant: Arc<dyn Interpolant>, x: NodeId) -> DistMathResult<NodeId> {
        self.apply1(Arc::new(SplineWrapper::new(interpolant)), &[x])
    }

    pub fn mv_normal_logp(&mut self, cov: NodeId, delta: NodeId) -> DistMathResult<NodeId> {
        self.apply1(Arc::new(MvNormalLogp), &[cov, delta])
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(ModelConfig::default())
    }
}
