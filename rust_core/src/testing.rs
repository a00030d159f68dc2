//! Finite-difference gradient checks shared by the op tests.

use finitediff::FiniteDiff;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::op::Op;
use crate::tensor::{DType, Tensor};

pub(crate) fn tensor(shape: &[usize], values: &[f64]) -> Tensor {
    Tensor::from_shape_vec(shape, values.to_vec(), DType::Float64).unwrap()
}

/// Check `op.grad` against central differences of `op.forward`.
///
/// The op's single output is projected onto a random tensor `r`, so the
/// scalar being differentiated is `sum(r * op(inputs))` and the analytic
/// gradient is `op.grad(inputs, [r])`. Only the inputs listed in `wrt` are
/// perturbed.
pub(crate) fn verify_grad(op: &dyn Op, inputs: &[Tensor], wrt: &[usize], tol: f64) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let refs: Vec<&Tensor> = inputs.iter().collect();
    let out = op.forward(&refs).unwrap().remove(0);
    let projection = Tensor::new(out.data().mapv(|_| rng.gen_range(0.5..1.5)), out.dtype());

    let analytic = op.grad(&refs, &[&projection]).unwrap();
    assert_eq!(analytic.len(), inputs.len(), "{} returned the wrong number of gradients", op.name());

    for &idx in wrt {
        let shape = inputs[idx].shape().to_vec();
        let point: Vec<f64> = inputs[idx].data().iter().copied().collect();
        let cost = |v: &Vec<f64>| {
            let mut perturbed = inputs.to_vec();
            perturbed[idx] = Tensor::from_shape_vec(&shape, v.clone(), DType::Float64).unwrap();
            let perturbed_refs: Vec<&Tensor> = perturbed.iter().collect();
            let out = op.forward(&perturbed_refs).unwrap().remove(0);
            out.data()
                .iter()
                .zip(projection.data().iter())
                .map(|(o, r)| o * r)
                .sum::<f64>()
        };
        let numeric = point.central_diff(&cost);

        assert_eq!(analytic[idx].shape(), shape.as_slice());
        for (i, (a, n)) in analytic[idx].data().iter().zip(&numeric).enumerate() {
            assert!(
                (a - n).abs() <= tol * (1.0 + n.abs()),
                "{} input {} element {}: analytic={}, numerical={}",
                op.name(),
                idx,
                i,
                a,
                n
            );
        }
    }
}
