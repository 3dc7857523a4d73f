//! # Read-Between-The-Lines Dereddening
//!
//! Second joint fit: every target's spectrum at maximum is modeled as a
//! common mean spectrum, dimmed by a gray magnitude offset and reddened by a
//! color offset along a fixed extinction law:
//!
//! ```text
//! model[i,w] = mean_flux[w] · 10^(−0.4·(M_i + c_i·CL_w))
//! ```
//!
//! with a fractional intrinsic dispersion `δ[w]` absorbing everything the
//! model does not describe. A common shift of all magnitudes (or colors) is
//! indistinguishable from a change of the mean spectrum, so the first target
//! is the reference: its magnitude and color are fixed at zero and only the
//! other `N − 1` are free parameters.

use super::optimize::{MinimizeOptions, minimize};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MODEL_IDENTITY: &str = "rbtl/mean-spectrum/gray-plus-color/fractional-dispersion-v1";

const K_MAG: f64 = 0.4 * std::f64::consts::LN_10;
const INITIAL_FRACTIONAL_DISPERSION: f64 = 0.1;

#[derive(Error, Debug)]
pub enum RbtlError {
    #[error("Input arrays disagree in shape: {0}")]
    ShapeMismatch(String),

    #[error("At least two targets are needed to separate magnitudes from the mean spectrum.")]
    TooFewTargets,

    #[error("The mean spectrum must be positive, but wavelength bin {0} averages to {1}.")]
    NonPositiveMeanFlux(usize, f64),
}

/// Raw fit output. Magnitudes are unblinded here; blinding is applied when
/// the result is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbtlResult {
    pub magnitudes: Array1<f64>,
    pub colors: Array1<f64>,
    pub mean_flux: Array1<f64>,
    pub fractional_dispersion: Array1<f64>,
    /// `10^(−0.4·(M_i + c_i·CL_w))`, shape `(targets, wave)`.
    pub model_scales: Array2<f64>,
    pub color_law: Array1<f64>,
    pub objective: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Fits the dereddening model to spectra at maximum light.
pub fn fit_rbtl(
    maximum_flux: &Array2<f64>,
    maximum_fluxerr: &Array2<f64>,
    color_law: &Array1<f64>,
    options: MinimizeOptions,
) -> Result<RbtlResult, RbtlError> {
    let model = internal::RbtlModel::new(maximum_flux, maximum_fluxerr, color_law)?;
    log::info!(
        "Fitting dereddening model: {} targets, {} wavelengths, {} parameters",
        model.num_targets,
        model.num_wave,
        model.num_parameters()
    );

    let result = minimize(
        model.initial_parameters(),
        |x: &Array1<f64>| model.evaluate(x),
        options,
    );
    log::info!(
        "Dereddening fit finished after {} iterations, objective {:.4}, converged: {}",
        result.iterations,
        result.value,
        result.converged
    );

    let (magnitudes, colors) = model.offsets(&result.x);
    let mean_flux = model.mean_flux(&result.x);
    let fractional_dispersion = model.fractional_dispersion(&result.x);
    let model_scales = model.scales(&magnitudes, &colors);

    Ok(RbtlResult {
        magnitudes,
        colors,
        mean_flux,
        fractional_dispersion,
        model_scales,
        color_law: color_law.clone(),
        objective: result.value,
        iterations: result.iterations,
        converged: result.converged,
    })
}

pub(crate) mod internal {
    use super::*;

    /// Flattened layout `[u(W), ln δ(W), M(N−1), c(N−1)]` where
    /// `mean_flux = initial_mean · exp(u)`.
    pub struct RbtlModel<'a> {
        flux: &'a Array2<f64>,
        fluxerr: &'a Array2<f64>,
        color_law: &'a Array1<f64>,
        initial_mean: Array1<f64>,
        pub num_targets: usize,
        pub num_wave: usize,
    }

    impl<'a> RbtlModel<'a> {
        pub fn new(
            flux: &'a Array2<f64>,
            fluxerr: &'a Array2<f64>,
            color_law: &'a Array1<f64>,
        ) -> Result<Self, RbtlError> {
            let (num_targets, num_wave) = flux.dim();
            if fluxerr.dim() != flux.dim() || color_law.len() != num_wave {
                return Err(RbtlError::ShapeMismatch(format!(
                    "flux {:?}, uncertainty {:?}, color law {}",
                    flux.dim(),
                    fluxerr.dim(),
                    color_law.len()
                )));
            }
            if num_targets < 2 {
                return Err(RbtlError::TooFewTargets);
            }
            let initial_mean = flux
                .mean_axis(Axis(0))
                .ok_or(RbtlError::TooFewTargets)?;
            if let Some((w, &value)) = initial_mean
                .iter()
                .enumerate()
                .find(|&(_, &value)| !(value > 0.0))
            {
                return Err(RbtlError::NonPositiveMeanFlux(w, value));
            }
            Ok(Self {
                flux,
                fluxerr,
                color_law,
                initial_mean,
                num_targets,
                num_wave,
            })
        }

        pub fn num_parameters(&self) -> usize {
            2 * self.num_wave + 2 * (self.num_targets - 1)
        }

        fn magnitude_index(&self, target: usize) -> Option<usize> {
            (target > 0).then(|| 2 * self.num_wave + target - 1)
        }

        fn color_index(&self, target: usize) -> Option<usize> {
            (target > 0).then(|| 2 * self.num_wave + self.num_targets - 1 + target - 1)
        }

        pub fn initial_parameters(&self) -> Array1<f64> {
            let mut x = Array1::zeros(self.num_parameters());
            for w in 0..self.num_wave {
                x[self.num_wave + w] = INITIAL_FRACTIONAL_DISPERSION.ln();
            }
            x
        }

        pub fn mean_flux(&self, x: &Array1<f64>) -> Array1<f64> {
            Array1::from_shape_fn(self.num_wave, |w| self.initial_mean[w] * x[w].exp())
        }

        pub fn fractional_dispersion(&self, x: &Array1<f64>) -> Array1<f64> {
            Array1::from_shape_fn(self.num_wave, |w| x[self.num_wave + w].exp())
        }

        /// Magnitudes and colors of every target, the reference included.
        pub fn offsets(&self, x: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
            let magnitudes = Array1::from_shape_fn(self.num_targets, |i| {
                self.magnitude_index(i).map_or(0.0, |j| x[j])
            });
            let colors = Array1::from_shape_fn(self.num_targets, |i| {
                self.color_index(i).map_or(0.0, |j| x[j])
            });
            (magnitudes, colors)
        }

        pub fn scales(&self, magnitudes: &Array1<f64>, colors: &Array1<f64>) -> Array2<f64> {
            Array2::from_shape_fn((self.num_targets, self.num_wave), |(i, w)| {
                (-K_MAG * (magnitudes[i] + colors[i] * self.color_law[w])).exp()
            })
        }

        pub fn evaluate(&self, x: &Array1<f64>) -> (f64, Array1<f64>) {
            let mut grad = Array1::zeros(self.num_parameters());
            let mean_flux = self.mean_flux(x);
            let dispersion = self.fractional_dispersion(x);
            let (magnitudes, colors) = self.offsets(x);
            let scales = self.scales(&magnitudes, &colors);

            let mut nll = 0.0;
            for i in 0..self.num_targets {
                let magnitude_index = self.magnitude_index(i);
                let color_index = self.color_index(i);
                for w in 0..self.num_wave {
                    let model = mean_flux[w] * scales[[i, w]];
                    let err = self.fluxerr[[i, w]];
                    let d2 = dispersion[w] * dispersion[w];
                    let variance = err * err + d2 * model * model;
                    let residual = self.flux[[i, w]] - model;
                    nll += 0.5 * (residual * residual / variance + variance.ln());

                    let d_variance = 0.5 * (1.0 / variance - residual * residual / (variance * variance));
                    // Derivative with respect to the model flux, through both
                    // the residual and the dispersion term of the variance.
                    let d_model = -residual / variance + d_variance * 2.0 * d2 * model;

                    grad[w] += d_model * model;
                    grad[self.num_wave + w] += d_variance * 2.0 * d2 * model * model;
                    if let Some(j) = magnitude_index {
                        grad[j] += d_model * -K_MAG * model;
                    }
                    if let Some(j) = color_index {
                        grad[j] += d_model * -K_MAG * self.color_law[w] * model;
                    }
                }
            }
            (nll, grad)
        }
    }
}
