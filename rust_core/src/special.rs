//! Scalar special functions used by the log-likelihood primitives.
//!
//! The exponentially scaled Bessel functions are evaluated in two regimes:
//! - `|x| <= SERIES_CUTOFF`: the ascending power series, with the
//!   `exp(-|x|)` factor folded into the first term. All terms are positive,
//!   so there is no cancellation;
//! - beyond it: the Hankel asymptotic expansion of `I_nu(x) exp(-x)`, which
//!   never forms `I_nu(x)` itself and therefore cannot overflow.

use std::f64::consts::PI;

use statrs::function::gamma::ln_gamma;

const SERIES_CUTOFF: f64 = 20.0;
const MAX_TERMS: usize = 500;
const REL_TOL: f64 = 1e-17;

/// Exponentially scaled modified Bessel function of the first kind, order 0:
/// `exp(-|x|) * I0(x)`.
pub fn i0e(x: f64) -> f64 {
    let a = x.abs();
    if a <= SERIES_CUTOFF {
        let q = 0.25 * a * a;
        let mut term = (-a).exp();
        let mut sum = term;
        for k in 1..MAX_TERMS {
            let kf = k as f64;
            term *= q / (kf * kf);
            sum += term;
            if term < REL_TOL * sum {
                break;
            }
        }
        sum
    } else {
        asymptotic_scaled(0.0, a)
    }
}

/// Exponentially scaled modified Bessel function of the first kind, order 1:
/// `exp(-|x|) * I1(x)`. Odd in `x`.
pub fn i1e(x: f64) -> f64 {
    let a = x.abs();
    let magnitude = if a <= SERIES_CUTOFF {
        let q = 0.25 * a * a;
        let mut term = 0.5 * a * (-a).exp();
        let mut sum = term;
        for k in 1..MAX_TERMS {
            let kf = k as f64;
            term *= q / (kf * (kf + 1.0));
            sum += term;
            if term <= REL_TOL * sum {
                break;
            }
        }
        sum
    } else {
        asymptotic_scaled(1.0, a)
    };
    if x < 0.0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Derivative of [`i0e`]: `i1e(x) - sign(x) * i0e(x)`, with `sign(0) = 0`.
pub fn i0e_derivative(x: f64) -> f64 {
    i1e(x) - sign(x) * i0e(x)
}

/// `ln(n!)`, extended to real `n` through the log-gamma function.
pub fn factln(n: f64) -> f64 {
    ln_gamma(n + 1.0)
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// `I_nu(a) exp(-a)` for large positive `a`.
fn asymptotic_scaled(nu: f64, a: f64) -> f64 {
    let mu = 4.0 * nu * nu;
    let mut term = 1.0_f64;
    let mut sum = 1.0_f64;
    for k in 1..MAX_TERMS {
        let kf = k as f64;
        let odd = 2.0 * kf - 1.0;
        let next = -term * (mu - odd * odd) / (8.0 * kf * a);
        // The series is asymptotic: stop once terms start growing.
        if next.abs() >= term.abs() {
            break;
        }
        term = next;
        sum += term;
        if term.abs() < REL_TOL * sum.abs() {
            break;
        }
    }
    sum / ((2.0 * PI).sqrt() * a.sqrt())
}
