use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DistMathError, DistMathResult};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::tensor::Tensor;

/// Reverse-mode autodiff: add nodes computing `d cost / d wrt` to the graph.
///
/// Works symbolically: every application on a path from `wrt` to `cost`
/// contributes the output of its op's gradient rule, which is itself an op
/// application. Differentiating the returned nodes again therefore asks
/// each gradient op for its own rule, and ops that do not support the
/// higher order fail here, while the graph is built.
pub fn grad(graph: &mut Graph, cost: NodeId, wrt: &[NodeId]) -> DistMathResult<Vec<NodeId>> {
    let cost_ty = graph.tensor_type(cost)?.clone();
    if !cost_ty.shape.is_empty() {
        return Err(DistMathError::NotScalar(cost_ty.shape));
    }
    for &w in wrt {
        graph.node(w)?;
    }

    let n_nodes = graph.nodes.len();
    let n_apps = graph.applications.len();

    // Which nodes are influenced by any of `wrt`.
    let mut depends = vec![false; n_nodes];
    for &w in wrt {
        depends[w.0] = true;
    }
    for app in &graph.applications {
        if app.inputs.iter().any(|i| depends[i.0]) {
            for o in &app.outputs {
                depends[o.0] = true;
            }
        }
    }

    // Adjoint for each node. Seed: d(cost)/d(cost) = 1.
    let mut adjoints: HashMap<NodeId, NodeId> = HashMap::new();
    let seed = graph.constant(Tensor::ones(&[], cost_ty.dtype));
    adjoints.insert(cost, seed);

    // Reverse pass
    for app_idx in (0..n_apps).rev() {
        let app = graph.applications[app_idx].clone();
        let reaches_cost = app.outputs.iter().any(|o| adjoints.contains_key(o));
        let on_path = app.inputs.iter().any(|i| depends[i.0]);
        if !reaches_cost || !on_path {
            continue;
        }

        let mut output_grads = Vec::with_capacity(app.outputs.len());
        for o in &app.outputs {
            let g = match adjoints.get(o) {
                Some(&g) => g,
                None => {
                    let ty = graph.tensor_type(*o)?.clone();
                    graph.constant(Tensor::zeros(&ty.shape, ty.dtype))
                }
            };
            output_grads.push(g);
        }

        let rule = app.op.grad_op()?;
        let mut rule_inputs = app.inputs.clone();
        rule_inputs.extend_from_slice(&output_grads);
        let input_grads = graph.apply(rule, &rule_inputs)?;
        if input_grads.len() != app.inputs.len() {
            return Err(DistMathError::ArityMismatch {
                op: app.op.name(),
                expected: app.inputs.len(),
                found: input_grads.len(),
            });
        }

        for (&input, &g) in app.inputs.iter().zip(&input_grads) {
            if !depends[input.0] {
                continue;
            }
            let total = match adjoints.get(&input) {
                Some(&existing) => graph.add(existing, g)?,
                None => g,
            };
            adjoints.insert(input, total);
        }
    }

    wrt.iter()
        .map(|w| match adjoints.get(w) {
            Some(&g) => Ok(g),
            None => {
                let ty = graph.tensor_type(*w)?.clone();
                Ok(graph.constant(Tensor::zeros(&ty.shape, ty.dtype)))
            }
        })
        .collect()
}

/// A graph compiled for repeated numeric evaluation.
///
/// The graph is snapshotted into an `Arc` and only read afterwards, so a
/// `Function` can be shared across threads and called concurrently.
#[derive(Debug, Clone)]
pub struct Function {
    graph: Arc<Graph>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    schedule: Vec<usize>,
}

impl Function {
    pub fn compile(graph: &Graph, inputs: &[NodeId], outputs: &[NodeId]) -> DistMathResult<Self> {
        for &id in inputs.iter().chain(outputs) {
            graph.node(id)?;
        }

        let mut needed = vec![false; graph.nodes.len()];
        for o in outputs {
            needed[o.0] = true;
        }
        let mut schedule = Vec::new();
        for (idx, app) in graph.applications.iter().enumerate().rev() {
            if app.outputs.iter().any(|o| needed[o.0]) {
                for i in &app.inputs {
                    needed[i.0] = true;
                }
                schedule.push(idx);
            }
        }
        schedule.reverse();

        for node in &graph.nodes {
            if needed[node.id.0] && matches!(node.kind, NodeKind::Input) && !inputs.contains(&node.id) {
                return Err(DistMathError::MissingInput(node.id.0));
            }
        }

        Ok(Self {
            graph: Arc::new(graph.clone()),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            schedule,
        })
    }

    /// Evaluate the compiled outputs for concrete `args`, given in the
    /// order of the `inputs` passed to [`Function::compile`].
    pub fn call(&self, args: &[Tensor]) -> DistMathResult<Vec<Tensor>> {
        if args.len() != self.inputs.len() {
            return Err(DistMathError::ArityMismatch {
                op: "Function::call",
                expected: self.inputs.len(),
                found: args.len(),
            });
        }

        let mut values: Vec<Option<Tensor>> = vec![None; self.graph.nodes.len()];
        for (&id, arg) in self.inputs.iter().zip(args) {
            let ty = &self.graph.nodes[id.0].ty;
            if arg.shape() != ty.shape.as_slice() {
                return Err(DistMathError::ShapeMismatch {
                    op: "Function::call",
                    left: ty.shape.clone(),
                    right: arg.shape().to_vec(),
                });
            }
            if arg.dtype() != ty.dtype {
                return Err(DistMathError::DTypeMismatch {
                    op: "Function::call",
                    found: arg.dtype(),
                    reason: "argument dtype differs from the declared input",
                });
            }
            values[id.0] = Some(arg.clone());
        }
        for node in &self.graph.nodes {
            if let NodeKind::Constant(t) = &node.kind {
                values[node.id.0] = Some(t.clone());
            }
        }

        for &app_idx in &self.schedule {
            let app = &self.graph.applications[app_idx];
            let args = app
                .inputs
                .iter()
                .map(|i| values[i.0].as_ref().ok_or(DistMathError::MissingInput(i.0)))
                .collect::<DistMathResult<Vec<&Tensor>>>()?;
            let results = app.op.forward(&args)?;
            if results.len() != app.outputs.len() {
                return Err(DistMathError::ArityMismatch {
                    op: app.op.name(),
                    expected: app.outputs.len(),
                    found: results.len(),
                });
            }
            for (o, t) in app.outputs.iter().zip(results) {
                values[o.0] = Some(t);
            }
        }

        self.outputs
            .iter()
            .map(|o| values[o.0].clone().ok_or(DistMathError::MissingInput(o.0)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;
    use approx::assert_relative_eq;

    #[test]
    fn test_compile_and_call_i0e() {
        let mut g = Graph::default();
        let x = g.input("x", &[2], DType::Float64);
        let y = g.i0e(x).unwrap();
        let f = Function::compile(&g, &[x], &[y]).unwrap();

        let out = f.call(&[Tensor::from_vec(vec![0.0, 1.0], DType::Float64)]).unwrap();
        assert_relative_eq!(out[0].data()[[0]], 1.0, epsilon = 1e-15);
        assert_relative_eq!(out[0].data()[[1]], 0.465_759_607_593_640_9, epsilon = 1e-14);
    }

    #[test]
    fn test_gradient_accumulates_over_shared_inputs() {
        // cost = mvn(cov, delta) + mvn(cov, delta): gradient doubles.
        let mut g = Graph::default();
        let cov = g.input("cov", &[2, 2], DType::Float64);
        let delta = g.input("delta", &[3, 2], DType::Float64);
        let a = g.mv_normal_logp(cov, delta).unwrap();
        let b = g.mv_normal_logp(cov, delta).unwrap();
        let cost = g.add(a, b).unwrap();
        let single = grad(&mut g, a, &[delta]).unwrap()[0];
        let double = grad(&mut g, cost, &[delta]).unwrap()[0];

        let f = Function::compile(&g, &[cov, delta], &[single, double]).unwrap();
        let cov_val = Tensor::from_shape_vec(&[2, 2], vec![2.0, 0.3, 0.3, 1.0], DType::Float64).unwrap();
        let delta_val =
            Tensor::from_shape_vec(&[3, 2], vec![0.1, -0.4, 1.2, 0.5, -0.7, 0.0], DType::Float64).unwrap();
        let out = f.call(&[cov_val, delta_val]).unwrap();
        for (s, d) in out[0].data().iter().zip(out[1].data().iter()) {
            assert_relative_eq!(2.0 * s, *d, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_unconnected_wrt_gets_zero_gradient() {
        let mut g = Graph::default();
        let x = g.input("x", &[], DType::Float64);
        let unused = g.input("unused", &[3], DType::Float64);
        let y = g.i0e(x).unwrap();
        let gu = grad(&mut g, y, &[unused]).unwrap()[0];
        let f = Function::compile(&g, &[], &[gu]).unwrap();
        assert_eq!(f.call(&[]).unwrap()[0], Tensor::zeros(&[3], DType::Float64));
    }

    #[test]
    fn test_grad_requires_scalar_cost() {
        let mut g = Graph::default();
        let x = g.input("x", &[2], DType::Float64);
        let y = g.i0e(x).unwrap();
        assert_eq!(grad(&mut g, y, &[x]), Err(DistMathError::NotScalar(vec![2])));
    }

    #[test]
    fn test_missing_input_is_reported() {
        let mut g = Graph::default();
        let x = g.input("x", &[], DType::Float64);
        let y = g.i0e(x).unwrap();
        assert_eq!(
            Function::compile(&g, &[], &[y]).unwrap_err(),
            DistMathError::MissingInput(x.0)
        );
    }

    #[test]
    fn test_call_checks_argument_types() {
        let mut g = Graph::default();
        let x = g.input("x", &[2], DType::Float64);
        let y = g.i0e(x).unwrap();
        let f = Function::compile(&g, &[x], &[y]).unwrap();
        assert!(matches!(
            f.call(&[Tensor::zeros(&[3], DType::Float64)]),
            Err(DistMathError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            f.call(&[Tensor::zeros(&[2], DType::Float32)]),
            Err(DistMathError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_compiled_function_is_shareable_across_threads() {
        let mut g = Graph::default();
        let x = g.input("x", &[], DType::Float64);
        let y = g.i0e(x).unwrap();
        let f = Arc::new(Function::compile(&g, &[x], &[y]).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || {
                    f.call(&[Tensor::scalar(i as f64, DType::Float64)]).unwrap()[0]
                        .to_scalar()
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], 1.0);
        assert!(results.windows(2).all(|w| w[1] < w[0]));
    }
}
