//! # Maximum-Light Interpolation
//!
//! Joint fit of the spectral time series of every target to recover each
//! target's spectrum at maximum light (phase 0) and its uncertainty.
//!
//! For spectrum `s` of target `t` at phase `p` with stretch `x1`, the model
//! brightness evolution in magnitudes at wavelength `w` is
//!
//! ```text
//! m[s,w] = a[w]·p + b[w]·p² + c[w]·x1·p + d[w]·x1·p² + g[s]
//! ```
//!
//! and the observed flux is modeled as `μ[t,w]·10^(−0.4·m[s,w])`, where `μ` is
//! the flux at maximum. Residual phase-dependent scatter enters as a
//! fractional dispersion `D[s,w] = Σ_k φ[s,k]·exp(η[k,w])` built on the
//! piecewise-linear phase basis, so the per-point variance is
//! `fluxerr² + (D·flux)²`.
//!
//! `μ` is not a free parameter: for fixed evolution parameters the likelihood
//! is quadratic in it, so it is profiled out as the inverse-variance weighted
//! mean of the de-evolved fluxes. Its gradient contribution vanishes at the
//! profile, so the analytic gradient only needs partials at fixed `μ`.
//!
//! The center spectrum of every target anchors phase 0 and carries no gray
//! offset. The remaining gray offsets share a Normal prior whose width is a
//! fit parameter floored at [`GRAY_DISPERSION_FLOOR`]. Targets with a single
//! spectrum carry no information on the evolution and are left out of the
//! likelihood; their flux at maximum is still reconstructed afterwards.

use super::optimize::{MinimizeOptions, minimize};
use super::phase::{PhaseBasisError, phase_coefficient_matrix};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Changing the model below requires changing this identity, which
/// invalidates every cached result.
pub const MODEL_IDENTITY: &str = "maximum-light/quadratic-stretch/phase-dispersion/gray-v1";

/// Lower bound on the gray dispersion, in magnitudes.
pub const GRAY_DISPERSION_FLOOR: f64 = 0.002;

/// `0.4·ln(10)`: `10^(−0.4·m) = exp(−K_MAG·m)`.
const K_MAG: f64 = 0.4 * std::f64::consts::LN_10;

const INITIAL_PHASE_DISPERSION: f64 = 0.01;
const INITIAL_GRAY_DISPERSION: f64 = 0.02;

#[derive(Error, Debug)]
pub enum MaximumError {
    #[error(transparent)]
    PhaseBasis(#[from] PhaseBasisError),

    #[error("Input arrays disagree in shape: {0}")]
    ShapeMismatch(String),

    #[error("Target {0} has no center spectrum to anchor maximum light.")]
    MissingCenter(usize),

    #[error("Target {0} has no spectra.")]
    EmptyTarget(usize),
}

/// Spectra fed to the maximum-light fit, one row per spectrum.
#[derive(Debug, Clone)]
pub struct MaximumData {
    pub flux: Array2<f64>,
    pub fluxerr: Array2<f64>,
    pub phases: Array1<f64>,
    /// Index of the owning target of each spectrum.
    pub targets: Vec<usize>,
    pub centers: Vec<bool>,
    /// SALT2 stretch per target.
    pub stretches: Array1<f64>,
}

/// Fitted model, with the per-target spectra at maximum light.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaximumResult {
    pub maximum_flux: Array2<f64>,
    pub maximum_fluxerr: Array2<f64>,
    pub phase_slope: Array1<f64>,
    pub phase_quadratic: Array1<f64>,
    pub phase_slope_x1: Array1<f64>,
    pub phase_quadratic_x1: Array1<f64>,
    /// `exp(η)`, shape `(num_phase_coefficients, num_wave)`.
    pub phase_dispersion_coefficients: Array2<f64>,
    /// Gray offset of every spectrum, zero for center spectra.
    pub gray_offsets: Array1<f64>,
    pub gray_dispersion_scale: f64,
    pub objective: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Runs the joint fit.
pub fn fit_maximum(
    data: &MaximumData,
    phase_range: f64,
    num_phase_coefficients: usize,
    options: MinimizeOptions,
) -> Result<MaximumResult, MaximumError> {
    let phases = data.phases.to_vec();
    let phase_basis = phase_coefficient_matrix(&phases, phase_range, num_phase_coefficients)?;
    let model = internal::MaximumModel::new(data, phase_basis)?;

    log::info!(
        "Fitting maximum light: {} targets, {} spectra, {} wavelengths, {} parameters",
        model.members.len(),
        data.phases.len(),
        model.num_wave,
        model.layout.len()
    );

    let result = minimize(
        model.initial_parameters(),
        |x: &Array1<f64>| model.evaluate(x),
        options,
    );
    log::info!(
        "Maximum-light fit finished after {} iterations, objective {:.4}, converged: {}",
        result.iterations,
        result.value,
        result.converged
    );

    Ok(model.unpack(&result.x, result.value, result.iterations, result.converged))
}

pub(crate) mod internal {
    use super::*;

    /// Offsets of each parameter block in the flattened vector
    /// `[a(W), b(W), c(W), d(W), η(K×W), g(gray), ln σ_gray]`.
    pub struct Layout {
        pub num_wave: usize,
        pub num_coefficients: usize,
        pub num_gray: usize,
    }

    impl Layout {
        pub fn a(&self) -> usize {
            0
        }
        pub fn b(&self) -> usize {
            self.num_wave
        }
        pub fn c(&self) -> usize {
            2 * self.num_wave
        }
        pub fn d(&self) -> usize {
            3 * self.num_wave
        }
        pub fn eta(&self, k: usize, w: usize) -> usize {
            4 * self.num_wave + k * self.num_wave + w
        }
        pub fn gray(&self, index: usize) -> usize {
            (4 + self.num_coefficients) * self.num_wave + index
        }
        pub fn log_gray_scale(&self) -> usize {
            self.gray(self.num_gray)
        }
        pub fn len(&self) -> usize {
            self.log_gray_scale() + 1
        }
    }

    pub struct MaximumModel<'a> {
        data: &'a MaximumData,
        phase_basis: Array2<f64>,
        pub layout: Layout,
        pub num_wave: usize,
        /// Spectrum indices of each target.
        pub members: Vec<Vec<usize>>,
        /// Gray-offset parameter of each spectrum, `None` for centers.
        gray_index: Vec<Option<usize>>,
    }

    /// Per-point quantities shared by the objective and its gradient.
    struct Point {
        spectrum: usize,
        scale: f64,
        dispersion: f64,
        variance: f64,
    }

    impl<'a> MaximumModel<'a> {
        pub fn new(data: &'a MaximumData, phase_basis: Array2<f64>) -> Result<Self, MaximumError> {
            let num_spectra = data.flux.nrows();
            let num_wave = data.flux.ncols();
            if data.fluxerr.dim() != data.flux.dim()
                || data.phases.len() != num_spectra
                || data.targets.len() != num_spectra
                || data.centers.len() != num_spectra
            {
                return Err(MaximumError::ShapeMismatch(format!(
                    "{num_spectra} flux rows, {} uncertainty rows, {} phases, {} target labels, {} center flags",
                    data.fluxerr.nrows(),
                    data.phases.len(),
                    data.targets.len(),
                    data.centers.len()
                )));
            }

            let num_targets = data.stretches.len();
            let mut members = vec![Vec::new(); num_targets];
            for (spectrum, &target) in data.targets.iter().enumerate() {
                if target >= num_targets {
                    return Err(MaximumError::ShapeMismatch(format!(
                        "spectrum {spectrum} belongs to target {target} but only {num_targets} stretches were given"
                    )));
                }
                members[target].push(spectrum);
            }
            for (target, spectra) in members.iter().enumerate() {
                if spectra.is_empty() {
                    return Err(MaximumError::EmptyTarget(target));
                }
                if !spectra.iter().any(|&s| data.centers[s]) {
                    return Err(MaximumError::MissingCenter(target));
                }
            }

            let mut gray_index = vec![None; num_spectra];
            let mut num_gray = 0;
            for (spectrum, slot) in gray_index.iter_mut().enumerate() {
                if !data.centers[spectrum] {
                    *slot = Some(num_gray);
                    num_gray += 1;
                }
            }

            Ok(Self {
                data,
                layout: Layout {
                    num_wave,
                    num_coefficients: phase_basis.ncols(),
                    num_gray,
                },
                phase_basis,
                num_wave,
                members,
                gray_index,
            })
        }

        pub fn initial_parameters(&self) -> Array1<f64> {
            let mut x = Array1::zeros(self.layout.len());
            for k in 0..self.layout.num_coefficients {
                for w in 0..self.num_wave {
                    x[self.layout.eta(k, w)] = INITIAL_PHASE_DISPERSION.ln();
                }
            }
            x[self.layout.log_gray_scale()] = INITIAL_GRAY_DISPERSION.ln();
            x
        }

        fn gray_variance(&self, x: &Array1<f64>) -> f64 {
            GRAY_DISPERSION_FLOOR.powi(2) + (2.0 * x[self.layout.log_gray_scale()]).exp()
        }

        fn magnitude(&self, x: &Array1<f64>, spectrum: usize, w: usize) -> f64 {
            let l = &self.layout;
            let p = self.data.phases[spectrum];
            let x1 = self.data.stretches[self.data.targets[spectrum]];
            let gray = self.gray_index[spectrum].map_or(0.0, |g| x[l.gray(g)]);
            x[l.a() + w] * p
                + x[l.b() + w] * p * p
                + x[l.c() + w] * x1 * p
                + x[l.d() + w] * x1 * p * p
                + gray
        }

        fn points(
            &self,
            x: &Array1<f64>,
            dispersion_scale: &Array2<f64>,
            spectra: &[usize],
            w: usize,
        ) -> Vec<Point> {
            spectra
                .iter()
                .map(|&s| {
                    let scale = (-K_MAG * self.magnitude(x, s, w)).exp();
                    let dispersion: f64 = (0..self.layout.num_coefficients)
                        .map(|k| self.phase_basis[[s, k]] * dispersion_scale[[k, w]])
                        .sum();
                    let flux = self.data.flux[[s, w]];
                    let err = self.data.fluxerr[[s, w]];
                    let variance = err * err + (dispersion * flux).powi(2);
                    Point {
                        spectrum: s,
                        scale,
                        dispersion,
                        variance,
                    }
                })
                .collect()
        }

        /// Profiled flux at maximum and its uncertainty.
        fn profile(&self, points: &[Point], w: usize) -> (f64, f64) {
            let mut numerator = 0.0;
            let mut precision = 0.0;
            for point in points {
                let flux = self.data.flux[[point.spectrum, w]];
                numerator += flux * point.scale / point.variance;
                precision += point.scale * point.scale / point.variance;
            }
            (numerator / precision, precision.sqrt().recip())
        }

        fn dispersion_scale(&self, x: &Array1<f64>) -> Array2<f64> {
            Array2::from_shape_fn((self.layout.num_coefficients, self.num_wave), |(k, w)| {
                x[self.layout.eta(k, w)].exp()
            })
        }

        /// Negative log-likelihood and its gradient.
        pub fn evaluate(&self, x: &Array1<f64>) -> (f64, Array1<f64>) {
            let l = &self.layout;
            let mut grad = Array1::zeros(l.len());
            let mut nll = 0.0;
            let dispersion_scale = self.dispersion_scale(x);

            for spectra in self.members.iter().filter(|m| m.len() >= 2) {
                for w in 0..self.num_wave {
                    let points = self.points(x, &dispersion_scale, spectra, w);
                    let (mu, _) = self.profile(&points, w);

                    for point in &points {
                        let s = point.spectrum;
                        let flux = self.data.flux[[s, w]];
                        let residual = flux - mu * point.scale;
                        let v = point.variance;
                        nll += 0.5 * (residual * residual / v + v.ln());

                        let d_mag = K_MAG * mu * point.scale * residual / v;
                        let p = self.data.phases[s];
                        let x1 = self.data.stretches[self.data.targets[s]];
                        grad[l.a() + w] += d_mag * p;
                        grad[l.b() + w] += d_mag * p * p;
                        grad[l.c() + w] += d_mag * x1 * p;
                        grad[l.d() + w] += d_mag * x1 * p * p;
                        if let Some(g) = self.gray_index[s] {
                            grad[l.gray(g)] += d_mag;
                        }

                        let d_dispersion = point.dispersion
                            * flux
                            * flux
                            * (1.0 / v - residual * residual / (v * v));
                        for k in 0..l.num_coefficients {
                            let basis = self.phase_basis[[s, k]];
                            if basis != 0.0 {
                                grad[l.eta(k, w)] +=
                                    d_dispersion * basis * dispersion_scale[[k, w]];
                            }
                        }
                    }
                }
            }

            // Gray offsets share a Normal(0, σ) prior.
            let sigma2 = self.gray_variance(x);
            let mut d_sigma2 = 0.0;
            for g in 0..l.num_gray {
                let offset = x[l.gray(g)];
                nll += 0.5 * (offset * offset / sigma2 + sigma2.ln());
                grad[l.gray(g)] += offset / sigma2;
                d_sigma2 += 0.5 * (1.0 / sigma2 - offset * offset / (sigma2 * sigma2));
            }
            let log_scale = l.log_gray_scale();
            grad[log_scale] += d_sigma2 * 2.0 * (2.0 * x[log_scale]).exp();

            (nll, grad)
        }

        /// Reconstructs every target's spectrum at maximum from the fitted
        /// parameters, including targets left out of the likelihood.
        pub fn maximum_flux(&self, x: &Array1<f64>) -> (Array2<f64>, Array2<f64>) {
            let num_targets = self.members.len();
            let mut flux = Array2::zeros((num_targets, self.num_wave));
            let mut fluxerr = Array2::zeros((num_targets, self.num_wave));
            let dispersion_scale = self.dispersion_scale(x);
            for (t, spectra) in self.members.iter().enumerate() {
                for w in 0..self.num_wave {
                    let points = self.points(x, &dispersion_scale, spectra, w);
                    let (mu, err) = self.profile(&points, w);
                    flux[[t, w]] = mu;
                    fluxerr[[t, w]] = err;
                }
            }
            (flux, fluxerr)
        }

        pub fn unpack(
            &self,
            x: &Array1<f64>,
            objective: f64,
            iterations: usize,
            converged: bool,
        ) -> MaximumResult {
            let l = &self.layout;
            let w = self.num_wave;
            let block = |start: usize| x.slice(ndarray::s![start..start + w]).to_owned();
            let (maximum_flux, maximum_fluxerr) = self.maximum_flux(x);
            let gray_offsets = self
                .gray_index
                .iter()
                .map(|g| g.map_or(0.0, |g| x[l.gray(g)]))
                .collect();

            MaximumResult {
                maximum_flux,
                maximum_fluxerr,
                phase_slope: block(l.a()),
                phase_quadratic: block(l.b()),
                phase_slope_x1: block(l.c()),
                phase_quadratic_x1: block(l.d()),
                phase_dispersion_coefficients: self.dispersion_scale(x),
                gray_offsets,
                gray_dispersion_scale: x[l.log_gray_scale()].exp(),
                objective,
                iterations,
                converged,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::internal::MaximumModel;
    use super::*;
    use crate::estimate::optimize::numerical_gradient;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Three targets with known spectra at maximum evolving with a common
    /// linear color term.
    fn synthetic() -> (MaximumData, Array2<f64>) {
        let truth = array![
            [1.0, 2.0, 1.5, 0.8],
            [1.2, 1.8, 1.4, 0.9],
            [0.9, 2.2, 1.6, 0.7]
        ];
        let slope = array![0.05, -0.02, 0.0, 0.03];
        let phases_per_target: [[f64; 4]; 3] = [[-4.0, -1.5, 0.0, 2.5], [-3.0, 0.5, 1.5, 4.0], [-2.0, -0.2, 3.0, 4.5]];

        let mut rows = Vec::new();
        let mut phases = Vec::new();
        let mut targets = Vec::new();
        let mut centers = Vec::new();
        for (t, target_phases) in phases_per_target.iter().enumerate() {
            let center = target_phases
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
                .map(|(i, _)| i)
                .unwrap();
            for (i, &p) in target_phases.iter().enumerate() {
                let row: Vec<f64> = (0..4)
                    .map(|w| truth[[t, w]] * 10f64.powf(-0.4 * slope[w] * p))
                    .collect();
                rows.extend(row);
                phases.push(p);
                targets.push(t);
                centers.push(i == center);
            }
        }
        let flux = Array2::from_shape_vec((phases.len(), 4), rows).unwrap();
        let fluxerr = Array2::from_elem(flux.dim(), 1e-3);
        (
            MaximumData {
                flux,
                fluxerr,
                phases: Array1::from(phases),
                targets,
                centers,
                stretches: array![0.5, -1.0, 0.0],
            },
            truth,
        )
    }

    #[test]
    fn analytic_gradient_matches_finite_differences() {
        let (data, _) = synthetic();
        let basis = phase_coefficient_matrix(&data.phases.to_vec(), 5.0, 4).unwrap();
        let model = MaximumModel::new(&data, basis).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut x = model.initial_parameters();
        for value in x.iter_mut() {
            *value += rng.gen_range(-0.05..0.05);
        }

        let (_, analytic) = model.evaluate(&x);
        let numeric = numerical_gradient(&|p: &Array1<f64>| model.evaluate(p).0, &x);
        for (i, (a, n)) in analytic.iter().zip(numeric.iter()).enumerate() {
            let tolerance = 1e-4 * a.abs().max(n.abs()).max(1.0);
            assert!(
                (a - n).abs() < tolerance,
                "parameter {i}: analytic {a} vs numeric {n}"
            );
        }
    }

    #[test]
    fn recovers_spectra_at_maximum() {
        let (data, truth) = synthetic();
        let result = fit_maximum(
            &data,
            5.0,
            4,
            MinimizeOptions {
                tolerance: 1e-7,
                max_iterations: 5000,
            },
        )
        .unwrap();

        assert_eq!(result.maximum_flux.dim(), (3, 4));
        for ((t, w), &value) in result.maximum_flux.indexed_iter() {
            let relative = (value - truth[[t, w]]).abs() / truth[[t, w]];
            assert!(relative < 0.02, "target {t} wave {w}: {value} vs {}", truth[[t, w]]);
        }
        assert!(result.maximum_fluxerr.iter().all(|&e| e > 0.0 && e.is_finite()));
        // Center spectra never carry a gray offset.
        for (offset, &center) in result.gray_offsets.iter().zip(data.centers.iter()) {
            if center {
                assert_eq!(*offset, 0.0);
            }
        }
    }

    #[test]
    fn target_without_center_is_rejected() {
        let (mut data, _) = synthetic();
        for (center, &target) in data.centers.iter_mut().zip(data.targets.iter()) {
            if target == 1 {
                *center = false;
            }
        }
        let err = fit_maximum(
            &data,
            5.0,
            4,
            MinimizeOptions {
                tolerance: 1e-6,
                max_iterations: 10,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MaximumError::MissingCenter(1)));
    }

    #[test]
    fn odd_coefficient_count_fails_before_fitting() {
        let (data, _) = synthetic();
        let err = fit_maximum(
            &data,
            5.0,
            3,
            MinimizeOptions {
                tolerance: 1e-6,
                max_iterations: 10,
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MaximumError::PhaseBasis(PhaseBasisError::OddCoefficientCount(3))
        ));
    }
}
