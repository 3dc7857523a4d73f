//! # Point-Estimate Minimization
//!
//! All joint fits in this crate are expressed as an explicit objective over a
//! flattened parameter vector and handed to the `wolfe_bfgs` solver. This
//! module adds the pieces the solver does not provide itself:
//!
//! - tracking of the best point seen, so that a run which stops without
//!   meeting its tolerance still yields a usable (if unchecked) estimate;
//! - guarding against non-finite objective values, which would otherwise
//!   derail the line search;
//! - central finite-difference gradients for small objectives without an
//!   analytic gradient, and finite-difference Hessians for parameter
//!   covariances.

use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;
use std::cell::RefCell;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Value returned to the line search in place of a non-finite objective.
const NON_FINITE_PENALTY: f64 = 1e10;

/// Options shared by every minimization.
#[derive(Debug, Clone, Copy)]
pub struct MinimizeOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
}

/// Outcome of a minimization. `converged` is false when the solver stopped
/// early; the point is then the best one evaluated.
#[derive(Debug, Clone)]
pub struct MinimizeResult {
    pub x: Array1<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

struct BestPoint {
    x: Array1<f64>,
    value: f64,
}

/// Minimizes an objective with an analytic gradient.
///
/// `cost_and_grad` must return the objective and its gradient at `x`.
pub fn minimize<F>(x0: Array1<f64>, cost_and_grad: F, options: MinimizeOptions) -> MinimizeResult
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    let best = RefCell::new(BestPoint {
        x: x0.clone(),
        value: f64::INFINITY,
    });

    let guarded = |x: &Array1<f64>| -> (f64, Array1<f64>) {
        let (cost, grad) = cost_and_grad(x);
        if !cost.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            log::debug!("Non-finite objective encountered ({cost}); returning penalty value");
            return (NON_FINITE_PENALTY, Array1::zeros(x.len()));
        }
        let mut best = best.borrow_mut();
        if cost < best.value {
            best.value = cost;
            best.x.assign(x);
        }
        (cost, grad)
    };

    let outcome = Bfgs::new(x0, guarded)
        .with_tolerance(options.tolerance)
        .with_max_iterations(options.max_iterations)
        .run();

    match outcome {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => MinimizeResult {
            x: final_point,
            value: final_value,
            iterations,
            converged: true,
        },
        Err(err) => {
            let best = best.into_inner();
            log::warn!(
                "BFGS stopped without converging ({err:?}); using best point with objective {:.6}",
                best.value
            );
            MinimizeResult {
                x: best.x,
                value: best.value,
                iterations: options.max_iterations,
                converged: false,
            }
        }
    }
}

/// Minimizes an objective without an analytic gradient, using central
/// finite differences. Intended for objectives with a handful of parameters.
pub fn minimize_numerical<F>(x0: Array1<f64>, cost: F, options: MinimizeOptions) -> MinimizeResult
where
    F: Fn(&Array1<f64>) -> f64,
{
    minimize(
        x0,
        |x: &Array1<f64>| (cost(x), numerical_gradient(&cost, x)),
        options,
    )
}

fn step_size(value: f64) -> f64 {
    1e-6 * value.abs().max(1e-2)
}

/// Central-difference gradient.
pub fn numerical_gradient<F>(cost: &F, x: &Array1<f64>) -> Array1<f64>
where
    F: Fn(&Array1<f64>) -> f64,
{
    let mut grad = Array1::zeros(x.len());
    let mut probe = x.clone();
    for i in 0..x.len() {
        let h = step_size(x[i]);
        probe[i] = x[i] + h;
        let plus = cost(&probe);
        probe[i] = x[i] - h;
        let minus = cost(&probe);
        probe[i] = x[i];
        grad[i] = (plus - minus) / (2.0 * h);
    }
    grad
}

/// Central-difference Hessian of `cost` at `x`.
pub fn numerical_hessian<F>(cost: &F, x: &Array1<f64>) -> Array2<f64>
where
    F: Fn(&Array1<f64>) -> f64,
{
    let n = x.len();
    let mut hessian = Array2::zeros((n, n));
    let steps: Vec<f64> = x.iter().map(|&v| 1e-4 * v.abs().max(1e-2)).collect();
    let f0 = cost(x);
    let mut probe = x.clone();

    for i in 0..n {
        let hi = steps[i];
        probe[i] = x[i] + hi;
        let plus = cost(&probe);
        probe[i] = x[i] - hi;
        let minus = cost(&probe);
        probe[i] = x[i];
        hessian[[i, i]] = (plus - 2.0 * f0 + minus) / (hi * hi);

        for j in (i + 1)..n {
            let hj = steps[j];
            let mut corner = |si: f64, sj: f64| {
                probe[i] = x[i] + si * hi;
                probe[j] = x[j] + sj * hj;
                let value = cost(&probe);
                probe[i] = x[i];
                probe[j] = x[j];
                value
            };
            let value = (corner(1.0, 1.0) - corner(1.0, -1.0) - corner(-1.0, 1.0)
                + corner(-1.0, -1.0))
                / (4.0 * hi * hj);
            hessian[[i, j]] = value;
            hessian[[j, i]] = value;
        }
    }
    hessian
}

/// Parameter covariance from the curvature of a negative log-likelihood.
///
/// Returns `None` when the Hessian cannot be inverted or the inverse has a
/// non-positive variance, i.e. the point is not a well-defined minimum.
pub fn covariance_from_nll<F>(nll: &F, x: &Array1<f64>) -> Option<Array2<f64>>
where
    F: Fn(&Array1<f64>) -> f64,
{
    let hessian = numerical_hessian(nll, x);
    let covariance = hessian.inv().ok()?;
    if covariance.diag().iter().all(|&v| v.is_finite() && v > 0.0) {
        Some(covariance)
    } else {
        None
    }
}
