//! # Gaussian-Process Standardization
//!
//! A target's magnitude is modeled as
//!
//! ```text
//! magnitude = color_slope · color + GP(embedding[, phase]) + noise
//! ```
//!
//! with a Matérn-3/2 kernel sharing one length scale over all embedding axes,
//! optionally summed with a second Matérn-3/2 kernel along phase. The noise is
//! heteroskedastic: measurement uncertainty, the peculiar-velocity term and an
//! intrinsic dispersion hyperparameter add in quadrature.
//!
//! Two rules govern every prediction on sample members:
//!
//! - A row is never used to predict itself. [`predict_out_of_sample`]
//!   refits the GP without the row (or without every row of its group) for
//!   each conditioning row. This is an explicit O(n) loop of refits.
//! - [`predict_with_full_conditioning`] conditions on the whole sample and is
//!   only meant for query points that are not part of it.

use super::optimize::{MinimizeOptions, covariance_from_nll, minimize_numerical};
use crate::stats;
use indicatif::ProgressBar;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{CholeskyFactorized, DeterminantC, FactorizeC, SolveC, UPLO};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum squared length scale, so a collapsing length never divides by zero.
const MIN_LENGTH_SCALE_SQUARED: f64 = 1e-12;

/// Starting point of the likelihood fit.
pub const DEFAULT_LIKELIHOOD_START: [f64; 4] = [0.0, 0.05, 0.2, 5.0];
/// Starting point of the dispersion fit.
pub const DEFAULT_DISPERSION_START: [f64; 4] = [0.0, 0.1, 0.3, 5.0];
/// Starting amplitude and length of the phase kernel when one is requested.
pub const DEFAULT_PHASE_START: [f64; 2] = [0.1, 5.0];

#[derive(Error, Debug)]
pub enum GpError {
    #[error("Linear algebra failure while conditioning the GP: {0}")]
    LinearAlgebra(#[from] ndarray_linalg::error::LinalgError),

    #[error("Expected 4 or 6 hyperparameters, got {0}.")]
    InvalidHyperparameterCount(usize),

    #[error("Input arrays disagree in shape: {0}")]
    ShapeMismatch(String),

    #[error("No rows are available to condition the GP on.")]
    EmptyConditioningSet,

    #[error("A phase kernel was requested but the data carry no phases.")]
    PhaseRequired,
}

/// Extra kernel term along the phase axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseKernel {
    pub amplitude: f64,
    pub length_scale: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpHyperparameters {
    pub color_slope: f64,
    pub intrinsic_dispersion: f64,
    pub amplitude: f64,
    pub length_scale: f64,
    pub phase_kernel: Option<PhaseKernel>,
}

impl GpHyperparameters {
    /// `[color_slope, intrinsic_dispersion, amplitude, length_scale]`,
    /// optionally followed by `[phase_amplitude, phase_length_scale]`.
    pub fn from_slice(values: &[f64]) -> Result<Self, GpError> {
        let phase_kernel = match values.len() {
            4 => None,
            6 => Some(PhaseKernel {
                amplitude: values[4],
                length_scale: values[5],
            }),
            other => return Err(GpError::InvalidHyperparameterCount(other)),
        };
        Ok(Self {
            color_slope: values[0],
            intrinsic_dispersion: values[1],
            amplitude: values[2],
            length_scale: values[3],
            phase_kernel,
        })
    }

    pub fn to_vec(&self) -> Vec<f64> {
        let mut values = vec![
            self.color_slope,
            self.intrinsic_dispersion,
            self.amplitude,
            self.length_scale,
        ];
        if let Some(phase) = self.phase_kernel {
            values.extend([phase.amplitude, phase.length_scale]);
        }
        values
    }

    /// Default starting point, with a phase kernel when `phase` is set.
    pub fn starting_point(base: [f64; 4], phase: bool) -> Self {
        let mut values = base.to_vec();
        if phase {
            values.extend(DEFAULT_PHASE_START);
        }
        Self {
            color_slope: values[0],
            intrinsic_dispersion: values[1],
            amplitude: values[2],
            length_scale: values[3],
            phase_kernel: phase.then(|| PhaseKernel {
                amplitude: values[4],
                length_scale: values[5],
            }),
        }
    }
}

/// Rows fed to the GP.
#[derive(Debug, Clone)]
pub struct GpData {
    /// Embedding coordinates, one row per sample member.
    pub coordinates: Array2<f64>,
    /// Phase of each row, required by a phase kernel.
    pub phases: Option<Array1<f64>>,
    pub magnitudes: Array1<f64>,
    pub colors: Array1<f64>,
    pub measurement_uncertainties: Array1<f64>,
    pub peculiar_velocity_uncertainties: Array1<f64>,
}

impl GpData {
    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }

    fn check(&self, hyperparameters: &GpHyperparameters) -> Result<(), GpError> {
        let n = self.len();
        let phases_ok = self.phases.as_ref().is_none_or(|p| p.len() == n);
        if self.coordinates.nrows() != n
            || self.colors.len() != n
            || self.measurement_uncertainties.len() != n
            || self.peculiar_velocity_uncertainties.len() != n
            || !phases_ok
        {
            return Err(GpError::ShapeMismatch(format!(
                "{n} magnitudes, {} coordinate rows, {} colors, {} measurement and {} peculiar velocity uncertainties",
                self.coordinates.nrows(),
                self.colors.len(),
                self.measurement_uncertainties.len(),
                self.peculiar_velocity_uncertainties.len()
            )));
        }
        if hyperparameters.phase_kernel.is_some() && self.phases.is_none() {
            return Err(GpError::PhaseRequired);
        }
        Ok(())
    }

    fn phase(&self, row: usize) -> Option<f64> {
        self.phases.as_ref().map(|p| p[row])
    }

    /// Diagonal noise variance of a row.
    fn noise_variance(&self, row: usize, hyperparameters: &GpHyperparameters) -> f64 {
        self.measurement_uncertainties[row].powi(2)
            + self.peculiar_velocity_uncertainties[row].powi(2)
            + hyperparameters.intrinsic_dispersion.powi(2)
    }

    /// Magnitude with the color term removed: the quantity the GP models.
    fn target_value(&self, row: usize, hyperparameters: &GpHyperparameters) -> f64 {
        self.magnitudes[row] - hyperparameters.color_slope * self.colors[row]
    }
}

/// Mean (and optionally variance) of GP predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct GpPrediction {
    pub mean: Array1<f64>,
    pub variance: Option<Array1<f64>>,
}

fn matern32(r: f64) -> f64 {
    let scaled = 3f64.sqrt() * r;
    (1.0 + scaled) * (-scaled).exp()
}

fn kernel(
    hyperparameters: &GpHyperparameters,
    a: ArrayView1<f64>,
    b: ArrayView1<f64>,
    phase_a: Option<f64>,
    phase_b: Option<f64>,
) -> f64 {
    let length2 = (hyperparameters.length_scale * hyperparameters.length_scale)
        .max(MIN_LENGTH_SCALE_SQUARED);
    let r2: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        / length2;
    let mut value = hyperparameters.amplitude.powi(2) * matern32(r2.sqrt());

    if let (Some(phase), Some(pa), Some(pb)) = (hyperparameters.phase_kernel, phase_a, phase_b) {
        let phase_length2 = (phase.length_scale * phase.length_scale).max(MIN_LENGTH_SCALE_SQUARED);
        let r = ((pa - pb).powi(2) / phase_length2).sqrt();
        value += phase.amplitude.powi(2) * matern32(r);
    }
    value
}

/// A GP conditioned on a set of rows.
struct Conditioned<'a> {
    data: &'a GpData,
    hyperparameters: GpHyperparameters,
    rows: Vec<usize>,
    factor: CholeskyFactorized<ndarray::OwnedRepr<f64>>,
    alpha: Array1<f64>,
    residuals: Array1<f64>,
}

impl<'a> Conditioned<'a> {
    fn new(
        data: &'a GpData,
        hyperparameters: GpHyperparameters,
        rows: Vec<usize>,
    ) -> Result<Self, GpError> {
        if rows.is_empty() {
            return Err(GpError::EmptyConditioningSet);
        }
        let n = rows.len();
        let mut covariance = Array2::zeros((n, n));
        for (i, &ri) in rows.iter().enumerate() {
            for (j, &rj) in rows.iter().enumerate().take(i + 1) {
                let value = kernel(
                    &hyperparameters,
                    data.coordinates.row(ri),
                    data.coordinates.row(rj),
                    data.phase(ri),
                    data.phase(rj),
                );
                covariance[[i, j]] = value;
                covariance[[j, i]] = value;
            }
            covariance[[i, i]] += data.noise_variance(ri, &hyperparameters);
        }
        let residuals: Array1<f64> = rows
            .iter()
            .map(|&r| data.target_value(r, &hyperparameters))
            .collect();
        let factor = covariance.factorizec(UPLO::Lower)?;
        let alpha = factor.solvec(&residuals)?;
        Ok(Self {
            data,
            hyperparameters,
            rows,
            factor,
            alpha,
            residuals,
        })
    }

    fn negative_log_likelihood(&self) -> f64 {
        let n = self.rows.len() as f64;
        0.5 * self.residuals.dot(&self.alpha)
            + 0.5 * self.factor.ln_detc()
            + 0.5 * n * (2.0 * std::f64::consts::PI).ln()
    }

    /// Prediction at a point with the given coordinates, phase and color.
    fn predict(
        &self,
        coordinates: ArrayView1<f64>,
        phase: Option<f64>,
        color: f64,
        with_variance: bool,
    ) -> Result<(f64, Option<f64>), GpError> {
        let cross: Array1<f64> = self
            .rows
            .iter()
            .map(|&r| {
                kernel(
                    &self.hyperparameters,
                    coordinates,
                    self.data.coordinates.row(r),
                    phase,
                    self.data.phase(r),
                )
            })
            .collect();
        let mean = cross.dot(&self.alpha) + self.hyperparameters.color_slope * color;
        let variance = if with_variance {
            let prior = kernel(&self.hyperparameters, coordinates, coordinates, phase, phase);
            let projected = self.factor.solvec(&cross)?;
            Some(prior - cross.dot(&projected))
        } else {
            None
        };
        Ok((mean, variance))
    }

    fn predict_row(&self, row: usize, with_variance: bool) -> Result<(f64, Option<f64>), GpError> {
        self.predict(
            self.data.coordinates.row(row),
            self.data.phase(row),
            self.data.colors[row],
            with_variance,
        )
    }
}

/// Negative log-likelihood of one joint GP over `rows`.
pub fn negative_log_likelihood(
    data: &GpData,
    hyperparameters: &GpHyperparameters,
    rows: &[usize],
) -> Result<f64, GpError> {
    data.check(hyperparameters)?;
    Ok(Conditioned::new(data, *hyperparameters, rows.to_vec())?.negative_log_likelihood())
}

/// Out-of-sample predictions for every row of `data`.
///
/// Rows in `condition_mask` are predicted from a GP conditioned on all other
/// conditioning rows; with `groups`, every row sharing the predicted row's
/// label is left out as well. Rows outside the mask are predicted once from
/// the full conditioning set.
pub fn predict_out_of_sample(
    data: &GpData,
    hyperparameters: &GpHyperparameters,
    condition_mask: &[bool],
    groups: Option<&[usize]>,
    with_variance: bool,
    progress: Option<&ProgressBar>,
) -> Result<GpPrediction, GpError> {
    data.check(hyperparameters)?;
    let n = data.len();
    if condition_mask.len() != n || groups.is_some_and(|g| g.len() != n) {
        return Err(GpError::ShapeMismatch(format!(
            "{n} rows, condition mask of {}, {} group labels",
            condition_mask.len(),
            groups.map_or(0, <[usize]>::len)
        )));
    }

    let condition_rows: Vec<usize> = (0..n).filter(|&i| condition_mask[i]).collect();
    let mut mean = Array1::zeros(n);
    let mut variance = Array1::zeros(n);

    for &row in &condition_rows {
        let others: Vec<usize> = condition_rows
            .iter()
            .copied()
            .filter(|&other| match groups {
                Some(labels) => labels[other] != labels[row],
                None => other != row,
            })
            .collect();
        let gp = Conditioned::new(data, *hyperparameters, others)?;
        let (m, v) = gp.predict_row(row, with_variance)?;
        mean[row] = m;
        variance[row] = v.unwrap_or(0.0);
        if let Some(pb) = progress {
            pb.inc(1);
        }
    }

    if condition_rows.len() < n {
        let gp = Conditioned::new(data, *hyperparameters, condition_rows)?;
        for row in (0..n).filter(|&i| !condition_mask[i]) {
            let (m, v) = gp.predict_row(row, with_variance)?;
            mean[row] = m;
            variance[row] = v.unwrap_or(0.0);
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }
    }

    Ok(GpPrediction {
        mean,
        variance: with_variance.then_some(variance),
    })
}

/// Predictions at new query points, conditioning on every row in
/// `condition_mask`. Not for rows of the conditioning sample itself.
pub fn predict_with_full_conditioning(
    data: &GpData,
    hyperparameters: &GpHyperparameters,
    condition_mask: &[bool],
    query_coordinates: &Array2<f64>,
    query_phases: Option<&Array1<f64>>,
    query_colors: Option<&Array1<f64>>,
    with_variance: bool,
) -> Result<GpPrediction, GpError> {
    data.check(hyperparameters)?;
    let n_query = query_coordinates.nrows();
    if query_coordinates.ncols() != data.coordinates.ncols()
        || query_phases.is_some_and(|p| p.len() != n_query)
        || query_colors.is_some_and(|c| c.len() != n_query)
        || condition_mask.len() != data.len()
    {
        return Err(GpError::ShapeMismatch(format!(
            "{n_query} query points of dimension {} against {} data dimensions",
            query_coordinates.ncols(),
            data.coordinates.ncols()
        )));
    }
    if hyperparameters.phase_kernel.is_some() && query_phases.is_none() {
        return Err(GpError::PhaseRequired);
    }

    let rows: Vec<usize> = (0..data.len()).filter(|&i| condition_mask[i]).collect();
    let gp = Conditioned::new(data, *hyperparameters, rows)?;
    let mut mean = Array1::zeros(n_query);
    let mut variance = Array1::zeros(n_query);
    for q in 0..n_query {
        let (m, v) = gp.predict(
            query_coordinates.row(q),
            query_phases.map(|p| p[q]),
            query_colors.map_or(0.0, |c| c[q]),
            with_variance,
        )?;
        mean[q] = m;
        variance[q] = v.unwrap_or(0.0);
    }
    Ok(GpPrediction {
        mean,
        variance: with_variance.then_some(variance),
    })
}

/// Outcome of a GP standardization.
#[derive(Debug, Clone)]
pub struct GpStandardization {
    pub hyperparameters: GpHyperparameters,
    /// Value of the minimized objective, if hyperparameters were fit.
    pub objective: Option<f64>,
    /// Magnitude minus out-of-sample prediction, one per row.
    pub corrected_magnitudes: Array1<f64>,
    /// Predictive variance plus the peculiar-velocity variance.
    pub corrected_variances: Option<Array1<f64>>,
    pub hyperparameter_covariance: Option<Array2<f64>>,
    /// Dispersion of the corrected magnitudes of the good rows.
    pub nmad: f64,
    pub std: f64,
}

fn good_rows(good_mask: &[bool]) -> Vec<usize> {
    (0..good_mask.len()).filter(|&i| good_mask[i]).collect()
}

fn summarize(
    data: &GpData,
    hyperparameters: GpHyperparameters,
    objective: Option<f64>,
    prediction: GpPrediction,
    good_mask: &[bool],
    hyperparameter_covariance: Option<Array2<f64>>,
) -> GpStandardization {
    let corrected_magnitudes = &data.magnitudes - &prediction.mean;
    let corrected_variances = prediction
        .variance
        .map(|v| v + &data.peculiar_velocity_uncertainties.mapv(|p| p * p));
    let good: Vec<f64> = good_rows(good_mask)
        .into_iter()
        .map(|i| corrected_magnitudes[i])
        .collect();
    let nmad = stats::nmad(&good);
    let std = stats::std(&good);
    log::info!("GP standardization: NMAD {nmad:.4} mag, std {std:.4} mag");

    GpStandardization {
        hyperparameters,
        objective,
        corrected_magnitudes,
        corrected_variances,
        hyperparameter_covariance,
        nmad,
        std,
    }
}

/// Fits the hyperparameters by maximum likelihood of one joint GP over the
/// good rows, then predicts every row out of sample, conditioning on the good
/// rows. With `estimate_covariance`, the hyperparameter covariance is taken
/// from the curvature of the likelihood; failure only logs a warning.
pub fn fit_gp_likelihood(
    data: &GpData,
    good_mask: &[bool],
    start: &GpHyperparameters,
    groups: Option<&[usize]>,
    options: MinimizeOptions,
    estimate_covariance: bool,
    progress: Option<&ProgressBar>,
) -> Result<GpStandardization, GpError> {
    data.check(start)?;
    if good_mask.len() != data.len() {
        return Err(GpError::ShapeMismatch(format!(
            "good mask of {} for {} rows",
            good_mask.len(),
            data.len()
        )));
    }
    let rows = good_rows(good_mask);
    if rows.is_empty() {
        return Err(GpError::EmptyConditioningSet);
    }

    let nll = |x: &Array1<f64>| -> f64 {
        let Ok(hyperparameters) = GpHyperparameters::from_slice(x.as_slice().unwrap_or(&[])) else {
            return f64::INFINITY;
        };
        match Conditioned::new(data, hyperparameters, rows.clone()) {
            Ok(gp) => gp.negative_log_likelihood(),
            Err(err) => {
                log::debug!("GP likelihood undefined at {:?}: {err}", x.to_vec());
                f64::INFINITY
            }
        }
    };

    log::info!("Fitting GP hyperparameters by maximum likelihood on {} rows", rows.len());
    let result = minimize_numerical(Array1::from(start.to_vec()), &nll, options);
    let hyperparameters = GpHyperparameters::from_slice(&result.x.to_vec())?;
    log::info!(
        "GP likelihood fit: {:?} (negative log-likelihood {:.4})",
        hyperparameters.to_vec(),
        result.value
    );

    let covariance = if estimate_covariance {
        let covariance = covariance_from_nll(&nll, &result.x);
        match &covariance {
            Some(cov) => log::info!(
                "GP hyperparameter uncertainties: {:?}",
                cov.diag().mapv(f64::sqrt).to_vec()
            ),
            None => log::warn!(
                "Couldn't estimate the GP hyperparameter covariance: the likelihood Hessian is not positive definite."
            ),
        }
        covariance
    } else {
        None
    };

    let prediction =
        predict_out_of_sample(data, &hyperparameters, good_mask, groups, true, progress)?;
    Ok(summarize(
        data,
        hyperparameters,
        Some(result.value),
        prediction,
        good_mask,
        covariance,
    ))
}

/// Standard deviation of the out-of-sample residuals of `data`, conditioning
/// on every row.
pub fn out_of_sample_dispersion(
    data: &GpData,
    hyperparameters: &GpHyperparameters,
    groups: Option<&[usize]>,
) -> Result<f64, GpError> {
    let mask = vec![true; data.len()];
    let prediction = predict_out_of_sample(data, hyperparameters, &mask, groups, false, None)?;
    let residuals = &data.magnitudes - &prediction.mean;
    Ok(stats::std(&residuals.to_vec()))
}

/// Standardizes with fixed hyperparameters, or, when none are given, with
/// hyperparameters minimizing the out-of-sample dispersion of the good rows.
pub fn apply_gp_standardization(
    data: &GpData,
    good_mask: &[bool],
    hyperparameters: Option<GpHyperparameters>,
    start: &GpHyperparameters,
    groups: Option<&[usize]>,
    options: MinimizeOptions,
    progress: Option<&ProgressBar>,
) -> Result<GpStandardization, GpError> {
    data.check(start)?;
    if good_mask.len() != data.len() {
        return Err(GpError::ShapeMismatch(format!(
            "good mask of {} for {} rows",
            good_mask.len(),
            data.len()
        )));
    }

    let (hyperparameters, objective) = match hyperparameters {
        Some(fixed) => {
            log::info!("Using fixed GP hyperparameters {:?}", fixed.to_vec());
            (fixed, None)
        }
        None => {
            let rows = good_rows(good_mask);
            if rows.is_empty() {
                return Err(GpError::EmptyConditioningSet);
            }
            let good = subset(data, &rows);
            let good_groups: Option<Vec<usize>> =
                groups.map(|labels| rows.iter().map(|&i| labels[i]).collect());

            let dispersion = |x: &Array1<f64>| -> f64 {
                GpHyperparameters::from_slice(x.as_slice().unwrap_or(&[]))
                    .and_then(|h| out_of_sample_dispersion(&good, &h, good_groups.as_deref()))
                    .unwrap_or(f64::INFINITY)
            };
            log::info!(
                "Fitting GP hyperparameters by out-of-sample dispersion on {} rows",
                rows.len()
            );
            let result = minimize_numerical(Array1::from(start.to_vec()), &dispersion, options);
            let fitted = GpHyperparameters::from_slice(&result.x.to_vec())?;
            log::info!(
                "GP dispersion fit: {:?} (dispersion {:.4})",
                fitted.to_vec(),
                result.value
            );
            (fitted, Some(result.value))
        }
    };

    let prediction =
        predict_out_of_sample(data, &hyperparameters, good_mask, groups, false, progress)?;
    Ok(summarize(
        data,
        hyperparameters,
        objective,
        prediction,
        good_mask,
        None,
    ))
}

/// Restriction of the data to some rows.
fn subset(data: &GpData, rows: &[usize]) -> GpData {
    use ndarray::Axis;
    GpData {
        coordinates: data.coordinates.select(Axis(0), rows),
        phases: data.phases.as_ref().map(|p| p.select(Axis(0), rows)),
        magnitudes: data.magnitudes.select(Axis(0), rows),
        colors: data.colors.select(Axis(0), rows),
        measurement_uncertainties: data.measurement_uncertainties.select(Axis(0), rows),
        peculiar_velocity_uncertainties: data
            .peculiar_velocity_uncertainties
            .select(Axis(0), rows),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn hyperparameters() -> GpHyperparameters {
        GpHyperparameters {
            color_slope: 0.5,
            intrinsic_dispersion: 0.05,
            amplitude: 0.2,
            length_scale: 1.0,
            phase_kernel: None,
        }
    }

    fn data(coordinates: Array2<f64>, magnitudes: Array1<f64>) -> GpData {
        let n = magnitudes.len();
        GpData {
            coordinates,
            phases: None,
            magnitudes,
            colors: Array1::zeros(n),
            measurement_uncertainties: Array1::zeros(n),
            peculiar_velocity_uncertainties: Array1::from_elem(n, 0.01),
        }
    }

    #[test]
    fn out_of_sample_prediction_ignores_the_predicted_row() {
        let base = data(
            array![[0.0], [0.5], [1.0], [1.5], [2.0]],
            array![0.1, -0.05, 0.2, 0.0, -0.1],
        );
        let mask = vec![true; 5];
        let reference =
            predict_out_of_sample(&base, &hyperparameters(), &mask, None, false, None).unwrap();

        // Changing a row's own magnitude must not change its prediction.
        let mut perturbed = base.clone();
        perturbed.magnitudes[2] += 10.0;
        let prediction =
            predict_out_of_sample(&perturbed, &hyperparameters(), &mask, None, false, None)
                .unwrap();
        assert_abs_diff_eq!(prediction.mean[2], reference.mean[2], epsilon = 1e-12);
        assert!((prediction.mean[1] - reference.mean[1]).abs() > 1e-3);
    }

    #[test]
    fn groups_are_left_out_together() {
        // Two groups of duplicated points: leaving one row out still lets its
        // duplicate predict it, leaving the group out does not.
        let d = data(
            array![[0.0], [0.0], [3.0], [3.0]],
            array![0.3, 0.3, -0.3, -0.3],
        );
        let mask = vec![true; 4];
        let single = predict_out_of_sample(&d, &hyperparameters(), &mask, None, false, None)
            .unwrap();
        let grouped = predict_out_of_sample(
            &d,
            &hyperparameters(),
            &mask,
            Some(&[0, 0, 1, 1]),
            false,
            None,
        )
        .unwrap();
        assert!(single.mean[0] > 0.1);
        assert!(grouped.mean[0].abs() < single.mean[0].abs());
        assert!((single.mean[0] - grouped.mean[0]).abs() > 1e-3);
    }

    #[test]
    fn rows_outside_the_mask_use_the_full_conditioning_set() {
        let d = data(array![[0.0], [0.4], [0.8], [0.6]], array![0.2, 0.1, 0.0, 0.5]);
        let mask = [true, true, true, false];
        let oos = predict_out_of_sample(&d, &hyperparameters(), &mask, None, true, None).unwrap();
        let full = predict_with_full_conditioning(
            &d,
            &hyperparameters(),
            &mask,
            &array![[0.6]],
            None,
            Some(&array![0.0]),
            true,
        )
        .unwrap();
        assert_abs_diff_eq!(oos.mean[3], full.mean[0], epsilon = 1e-12);
        let oos_var = oos.variance.unwrap();
        let full_var = full.variance.unwrap();
        assert_abs_diff_eq!(oos_var[3], full_var[0], epsilon = 1e-12);
        assert!(oos_var.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn color_slope_enters_the_prediction() {
        let mut d = data(array![[0.0], [5.0]], array![0.0, 0.0]);
        d.colors = array![0.2, -0.4];
        let prediction = predict_with_full_conditioning(
            &d,
            &hyperparameters(),
            &[true, true],
            &array![[100.0]],
            None,
            Some(&array![1.0]),
            false,
        )
        .unwrap();
        // Far from every conditioning point only the color term survives.
        assert_abs_diff_eq!(prediction.mean[0], 0.5, epsilon = 1e-8);
        assert!(prediction.variance.is_none());
    }

    #[test]
    fn likelihood_matches_closed_form_for_one_point() {
        let d = data(array![[0.0]], array![0.3]);
        let h = hyperparameters();
        let variance = h.amplitude.powi(2) + 0.01f64.powi(2) + h.intrinsic_dispersion.powi(2);
        let expected = 0.5 * 0.09 / variance
            + 0.5 * variance.ln()
            + 0.5 * (2.0 * std::f64::consts::PI).ln();
        let nll = negative_log_likelihood(&d, &h, &[0]).unwrap();
        assert_abs_diff_eq!(nll, expected, epsilon = 1e-12);
    }

    #[test]
    fn phase_kernel_needs_phases() {
        let d = data(array![[0.0], [1.0]], array![0.0, 0.1]);
        let h = GpHyperparameters::from_slice(&[0.0, 0.05, 0.2, 1.0, 0.1, 3.0]).unwrap();
        assert!(matches!(
            predict_out_of_sample(&d, &h, &[true, true], None, false, None),
            Err(GpError::PhaseRequired)
        ));
        assert!(matches!(
            GpHyperparameters::from_slice(&[0.0, 1.0]),
            Err(GpError::InvalidHyperparameterCount(2))
        ));
    }

    #[test]
    fn likelihood_fit_recovers_a_color_slope() {
        let colors = array![-0.1, 0.0, 0.05, 0.1, 0.2, -0.05, 0.15, 0.3];
        let n = colors.len();
        let mut d = data(
            Array2::from_shape_fn((n, 1), |(i, _)| i as f64),
            colors.mapv(|c| 3.0 * c),
        );
        d.colors = colors;
        let pb = ProgressBar::hidden();
        pb.set_length(n as u64);
        let result = fit_gp_likelihood(
            &d,
            &vec![true; n],
            &GpHyperparameters::starting_point(DEFAULT_LIKELIHOOD_START, false),
            None,
            MinimizeOptions {
                tolerance: 1e-6,
                max_iterations: 200,
            },
            false,
            Some(&pb),
        )
        .unwrap();
        assert_eq!(pb.position(), n as u64);
        assert_abs_diff_eq!(result.hyperparameters.color_slope, 3.0, epsilon = 0.05);
        assert!(result.corrected_magnitudes.iter().all(|v| v.abs() < 0.05));
        assert!(result.corrected_variances.unwrap().iter().all(|&v| v > 0.0));
    }
}
