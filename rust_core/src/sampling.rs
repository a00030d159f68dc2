//! Beta draws kept strictly inside the open unit interval.
//!
//! Small shape parameters push Beta samples so close to 0 or 1 that they
//! round onto the boundary at the requested precision, where the Beta
//! log-density is infinite. Every sample is rounded to its dtype first and
//! then clamped to the closest representable values inside `(0, 1)`.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution};
use rayon::prelude::*;
use tracing::trace;

use crate::error::{DistMathError, DistMathResult};
use crate::tensor::{DType, Tensor};

/// Samples drawn per RNG stream by [`par_clipped_beta_rvs`].
pub const CHUNK_SIZE: usize = 65_536;

fn beta_distribution(alpha: f64, beta: f64) -> DistMathResult<Beta<f64>> {
    for (name, value) in [("alpha", alpha), ("beta", beta)] {
        if !(value > 0.0) || !value.is_finite() {
            return Err(DistMathError::InvalidParameter {
                name,
                value,
                reason: "must be positive and finite".to_string(),
            });
        }
    }
    Beta::new(alpha, beta).map_err(|e| DistMathError::InvalidParameter {
        name: "alpha",
        value: alpha,
        reason: e.to_string(),
    })
}

fn bounds(dtype: DType) -> DistMathResult<(f64, f64)> {
    dtype.clip_bounds().ok_or(DistMathError::DTypeMismatch {
        op: "clipped_beta_rvs",
        found: dtype,
        reason: "Beta samples need a floating point dtype",
    })
}

/// Append `n` clipped draws to `out`, returning how many were moved off a
/// boundary.
fn fill_clipped<R: Rng + ?Sized>(
    dist: &Beta<f64>,
    rng: &mut R,
    n: usize,
    dtype: DType,
    (lo, hi): (f64, f64),
    out: &mut Vec<f64>,
) -> usize {
    let mut clipped = 0;
    for _ in 0..n {
        let rounded = dtype.round(dist.sample(rng));
        let value = rounded.clamp(lo, hi);
        if value != rounded {
            clipped += 1;
        }
        out.push(value);
    }
    clipped
}

/// Draw `Beta(alpha, beta)` samples of the given shape and dtype, with no
/// sample equal to 0 or 1 at that dtype's precision.
pub fn clipped_beta_rvs<R: Rng + ?Sized>(
    alpha: f64,
    beta: f64,
    shape: &[usize],
    dtype: DType,
    rng: &mut R,
) -> DistMathResult<Tensor> {
    let dist = beta_distribution(alpha, beta)?;
    let limits = bounds(dtype)?;
    let n: usize = shape.iter().product();

    let mut values = Vec::with_capacity(n);
    let clipped = fill_clipped(&dist, rng, n, dtype, limits, &mut values);
    trace!(alpha, beta, n, clipped, dtype = dtype.name(), "drew clipped beta samples");

    Tensor::from_shape_vec(shape, values, dtype)
}

/// Parallel [`clipped_beta_rvs`]. Samples are generated in chunks of
/// [`CHUNK_SIZE`], chunk `i` using its own `ChaCha8Rng` seeded with
/// `seed + i`, so the result depends only on `seed` and not on thread
/// scheduling.
pub fn par_clipped_beta_rvs(
    alpha: f64,
    beta: f64,
    shape: &[usize],
    dtype: DType,
    seed: u64,
) -> DistMathResult<Tensor> {
    let dist = beta_distribution(alpha, beta)?;
    let limits = bounds(dtype)?;
    let n: usize = shape.iter().product();
    let n_chunks = n.div_ceil(CHUNK_SIZE);

    let chunks: Vec<(Vec<f64>, usize)> = (0..n_chunks)
        .into_par_iter()
        .map(|chunk| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(chunk as u64));
            let len = CHUNK_SIZE.min(n - chunk * CHUNK_SIZE);
            let mut values = Vec::with_capacity(len);
            let clipped = fill_clipped(&dist, &mut rng, len, dtype, limits, &mut values);
            (values, clipped)
        })
        .collect();

    let clipped: usize = chunks.iter().map(|(_, c)| c).sum();
    trace!(alpha, beta, n, clipped, chunks = n_chunks, dtype = dtype.name(), "drew clipped beta samples");

    let values = chunks.into_iter().flat_map(|(v, _)| v).collect();
    Tensor::from_shape_vec(shape, values, dtype)
}
