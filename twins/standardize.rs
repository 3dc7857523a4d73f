//! # Brightness Standardization
//!
//! Two families of standardization live here:
//!
//! - the SALT2 baseline, a linear Tripp correction `mb − MB + α·x1 − β·c`
//!   fit by weighted RMS with an intrinsic dispersion tuned to `χ²/dof = 1`;
//! - the manifold GP, which corrects a chosen set of magnitudes with a GP over
//!   the twins embedding. The magnitudes come from one of the sources named by
//!   [`StandardizationKind`].

use crate::config::GpFit;
use crate::dataset::SaltFit;
use crate::estimate::gp::{
    DEFAULT_DISPERSION_START, DEFAULT_LIKELIHOOD_START, GpData, GpError, GpHyperparameters,
    apply_gp_standardization, fit_gp_likelihood,
};
use crate::estimate::optimize::{MinimizeOptions, minimize_numerical};
use crate::masks::{Masks, count};
use crate::progress::create_progress_bar;
use crate::stats::{self, FRAC_TO_MAG};
use ndarray::{Array1, Array2, Axis, array};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Speed of light, km/s.
const SPEED_OF_LIGHT: f64 = 299_792.458;
const SALT_PASSES: usize = 5;
const SALT_START: [f64; 3] = [-10.0, 0.13, 3.0];
const SALT_INITIAL_INTRINSIC_DISPERSION: f64 = 0.1;
/// `MB`, `α`, `β` and `σ_int` are all fit to the same targets.
const SALT_NUM_PARAMETERS: usize = 4;

#[derive(Error, Debug)]
pub enum StandardizationError {
    #[error("Unknown standardization '{0}'; expected rbtl, salt or salt_raw.")]
    UnknownKind(String),

    #[error("SALT2 residuals were requested but the SALT2 standardization has not been fit.")]
    SaltResidualsUnavailable,

    #[error("The SALT2 standardization needs more than 4 good targets, found {0}.")]
    TooFewSaltTargets(usize),

    #[error(transparent)]
    Gp(#[from] GpError),
}

/// Source of the magnitudes handed to the GP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardizationKind {
    /// Dereddened RBTL magnitudes.
    Rbtl,
    /// SALT2 Hubble residuals after the Tripp correction.
    Salt,
    /// SALT2 Hubble residuals without stretch or color correction.
    SaltRaw,
}

impl FromStr for StandardizationKind {
    type Err = StandardizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "rbtl" => Ok(Self::Rbtl),
            "salt" => Ok(Self::Salt),
            "salt_raw" => Ok(Self::SaltRaw),
            other => Err(StandardizationError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for StandardizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rbtl => "rbtl",
            Self::Salt => "salt",
            Self::SaltRaw => "salt_raw",
        })
    }
}

/// `(5/ln 10)·(v/c)/z_cmb` per target, in magnitudes.
pub fn peculiar_velocity_uncertainty(z_cmb: &Array1<f64>, velocity: f64) -> Array1<f64> {
    z_cmb.mapv(|z| 2.0 * FRAC_TO_MAG * (velocity / SPEED_OF_LIGHT) / z)
}

/// Per-target SALT2 quantities entering the Tripp residual. Targets without
/// a light-curve fit carry NaN.
#[derive(Debug, Clone)]
pub struct SaltTerms {
    pub mb: Array1<f64>,
    pub mb_err: Array1<f64>,
    pub x1: Array1<f64>,
    pub x1_err: Array1<f64>,
    pub color: Array1<f64>,
    pub color_err: Array1<f64>,
    pub cov_mb_x1: Array1<f64>,
    pub cov_color_mb: Array1<f64>,
    pub cov_color_x1: Array1<f64>,
}

impl SaltTerms {
    pub fn from_fits(fits: &[Option<&SaltFit>]) -> Self {
        // d(mb)/d(x0) = −(2.5/ln 10)/x0
        let jacobian = |fit: &SaltFit| -FRAC_TO_MAG / fit.x0;
        Self {
            mb: column(fits, |fit| -2.5 * fit.x0.log10()),
            mb_err: column(fits, |fit| stats::frac_to_mag(fit.x0_err / fit.x0)),
            x1: column(fits, |fit| fit.x1),
            x1_err: column(fits, |fit| fit.x1_err),
            color: column(fits, |fit| fit.c),
            color_err: column(fits, |fit| fit.c_err),
            cov_mb_x1: column(fits, |fit| fit.covariance[1][2] * jacobian(fit)),
            cov_color_mb: column(fits, |fit| fit.covariance[1][3] * jacobian(fit)),
            cov_color_x1: column(fits, |fit| fit.covariance[2][3]),
        }
    }

    pub fn len(&self) -> usize {
        self.mb.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mb.is_empty()
    }

    /// Tripp residuals and their uncertainties for every target.
    pub fn residuals(
        &self,
        absolute_magnitude: f64,
        alpha: f64,
        beta: f64,
        intrinsic_dispersion: f64,
        peculiar_velocity: &Array1<f64>,
    ) -> (Array1<f64>, Array1<f64>) {
        let n = self.len();
        let residuals = Array1::from_shape_fn(n, |i| {
            self.mb[i] - absolute_magnitude + alpha * self.x1[i] - beta * self.color[i]
        });
        let uncertainties = Array1::from_shape_fn(n, |i| {
            (intrinsic_dispersion.powi(2)
                + peculiar_velocity[i].powi(2)
                + self.mb_err[i].powi(2)
                + alpha.powi(2) * self.x1_err[i].powi(2)
                + beta.powi(2) * self.color_err[i].powi(2)
                + 2.0 * alpha * self.cov_mb_x1[i]
                - 2.0 * beta * self.cov_color_mb[i]
                - 2.0 * alpha * beta * self.cov_color_x1[i])
                .sqrt()
        });
        (residuals, uncertainties)
    }
}

fn column(fits: &[Option<&SaltFit>], value: impl Fn(&SaltFit) -> f64) -> Array1<f64> {
    fits.iter()
        .map(|fit| fit.map_or(f64::NAN, |fit| value(fit)))
        .collect()
}

/// Fitted SALT2 standardization.
#[derive(Debug, Clone)]
pub struct SaltStandardization {
    pub absolute_magnitude: f64,
    pub alpha: f64,
    pub beta: f64,
    pub intrinsic_dispersion: f64,
    pub wrms: f64,
    /// Standard deviation of the residuals of the fit targets.
    pub rms: f64,
    pub nmad: f64,
    pub residuals: Array1<f64>,
    pub uncertainties: Array1<f64>,
    /// Residuals with `α = β = 0`, mean-subtracted.
    pub raw_residuals: Array1<f64>,
    /// Uncertainties without the intrinsic dispersion.
    pub raw_uncertainties: Array1<f64>,
    pub colors: Array1<f64>,
}

fn weighted_rms(residuals: &Array1<f64>, uncertainties: &Array1<f64>, rows: &[usize]) -> f64 {
    let (numerator, denominator) = rows.iter().fold((0.0, 0.0), |(num, den), &i| {
        let weight = 1.0 / uncertainties[i].powi(2);
        (num + weight * residuals[i].powi(2), den + weight)
    });
    (numerator / denominator).sqrt()
}

fn reduced_chi2(residuals: &Array1<f64>, uncertainties: &Array1<f64>, rows: &[usize]) -> f64 {
    let chi2: f64 = rows
        .iter()
        .map(|&i| (residuals[i] / uncertainties[i]).powi(2))
        .sum();
    chi2 / (rows.len() - SALT_NUM_PARAMETERS) as f64
}

/// Minimizes the weighted RMS of `rows` over `(MB, α, β)` at a fixed
/// intrinsic dispersion. Every call starts from `SALT_START`.
fn fit_tripp(
    terms: &SaltTerms,
    peculiar_velocity: &Array1<f64>,
    rows: &[usize],
    intrinsic_dispersion: f64,
    options: MinimizeOptions,
) -> Array1<f64> {
    let dispersion = |x: &Array1<f64>| {
        let (residuals, uncertainties) =
            terms.residuals(x[0], x[1], x[2], intrinsic_dispersion, peculiar_velocity);
        weighted_rms(&residuals, &uncertainties, rows)
    };
    minimize_numerical(Array1::from(SALT_START.to_vec()), dispersion, options).x
}

/// Fits `MB`, `α`, `β` and `σ_int` on the targets in `good_mask`.
///
/// Raw residuals are centered on the mean over every target with a
/// light-curve fit, not only the fit targets.
pub fn fit_salt(
    terms: &SaltTerms,
    peculiar_velocity: &Array1<f64>,
    good_mask: &[bool],
    options: MinimizeOptions,
) -> Result<SaltStandardization, StandardizationError> {
    let rows: Vec<usize> = (0..good_mask.len())
        .filter(|&i| good_mask[i] && terms.mb[i].is_finite())
        .collect();
    if rows.len() <= SALT_NUM_PARAMETERS {
        return Err(StandardizationError::TooFewSaltTargets(rows.len()));
    }

    // One pass: refit (MB, α, β) from the fixed start, then retune σ_int.
    let salt_pass = |pass: usize, intrinsic_dispersion: f64| {
        let tripp = fit_tripp(terms, peculiar_velocity, &rows, intrinsic_dispersion, options);
        log::info!(
            "SALT2 pass {pass}: MB={:.3}, alpha={:.3}, beta={:.3}",
            tripp[0],
            tripp[1],
            tripp[2]
        );

        let chi2_target = |x: &Array1<f64>| {
            let (residuals, uncertainties) =
                terms.residuals(tripp[0], tripp[1], tripp[2], x[0], peculiar_velocity);
            (reduced_chi2(&residuals, &uncertainties, &rows) - 1.0).powi(2)
        };
        let result = minimize_numerical(array![intrinsic_dispersion], chi2_target, options);
        let retuned = result.x[0].abs();
        log::debug!("  intrinsic dispersion now {retuned:.3}");
        (tripp, retuned)
    };

    let (mut tripp, mut intrinsic_dispersion) = salt_pass(0, SALT_INITIAL_INTRINSIC_DISPERSION);
    for pass in 1..SALT_PASSES {
        (tripp, intrinsic_dispersion) = salt_pass(pass, intrinsic_dispersion);
    }

    let (absolute_magnitude, alpha, beta) = (tripp[0], tripp[1], tripp[2]);
    let (residuals, uncertainties) = terms.residuals(
        absolute_magnitude,
        alpha,
        beta,
        intrinsic_dispersion,
        peculiar_velocity,
    );
    let wrms = weighted_rms(&residuals, &uncertainties, &rows);
    let raw_uncertainties =
        uncertainties.mapv(|u| (u * u - intrinsic_dispersion * intrinsic_dispersion).sqrt());
    let (raw, _) = terms.residuals(
        absolute_magnitude,
        0.0,
        0.0,
        intrinsic_dispersion,
        peculiar_velocity,
    );
    let finite_raw: Vec<f64> = raw.iter().copied().filter(|r| r.is_finite()).collect();
    let raw_mean = stats::mean(&finite_raw);
    let raw_residuals = raw - raw_mean;

    let good: Vec<f64> = rows.iter().map(|&i| residuals[i]).collect();
    let rms = stats::std(&good);
    let nmad = stats::nmad(&good);
    log::info!(
        "SALT2 Hubble fit: MB {absolute_magnitude:.3}, alpha {alpha:.3}, beta {beta:.3}, sigma_int {intrinsic_dispersion:.3}, RMS {rms:.3}, NMAD {nmad:.3}, WRMS {wrms:.3}"
    );

    Ok(SaltStandardization {
        absolute_magnitude,
        alpha,
        beta,
        intrinsic_dispersion,
        wrms,
        rms,
        nmad,
        residuals,
        uncertainties,
        raw_residuals,
        raw_uncertainties,
        colors: terms.color.clone(),
    })
}

/// Magnitudes handed to the GP, with the targets they are reported for
/// (`full_mask`) and fit on (`good_mask`).
#[derive(Debug, Clone)]
pub struct MagnitudeSet {
    pub kind: StandardizationKind,
    pub magnitudes: Array1<f64>,
    pub colors: Array1<f64>,
    pub measurement_uncertainties: Array1<f64>,
    pub full_mask: Vec<bool>,
    pub good_mask: Vec<bool>,
}

impl MagnitudeSet {
    /// Resolves a standardization source into its magnitudes.
    ///
    /// SALT2 measurement uncertainties exclude the intrinsic dispersion and
    /// the peculiar-velocity term, both of which the GP adds back itself.
    pub fn select(
        kind: StandardizationKind,
        rbtl_magnitudes: &Array1<f64>,
        rbtl_colors: &Array1<f64>,
        salt: Option<&SaltStandardization>,
        peculiar_velocity: &Array1<f64>,
        masks: &Masks,
    ) -> Result<Self, StandardizationError> {
        let set = match kind {
            StandardizationKind::Rbtl => Self {
                kind,
                magnitudes: rbtl_magnitudes.clone(),
                colors: rbtl_colors.clone(),
                measurement_uncertainties: Array1::zeros(rbtl_magnitudes.len()),
                full_mask: masks.rbtl_full(),
                good_mask: masks.rbtl_good(),
            },
            StandardizationKind::Salt | StandardizationKind::SaltRaw => {
                let salt = salt.ok_or(StandardizationError::SaltResidualsUnavailable)?;
                let magnitudes = match kind {
                    StandardizationKind::Salt => salt.residuals.clone(),
                    _ => salt.raw_residuals.clone(),
                };
                let measurement_uncertainties = Array1::from_shape_fn(magnitudes.len(), |i| {
                    (salt.raw_uncertainties[i].powi(2) - peculiar_velocity[i].powi(2))
                        .max(0.0)
                        .sqrt()
                });
                Self {
                    kind,
                    magnitudes,
                    colors: salt.colors.clone(),
                    measurement_uncertainties,
                    full_mask: masks.salt_full(),
                    good_mask: masks.salt_good(),
                }
            }
        };
        log::info!(
            "Standardizing {} magnitudes: {} targets reported, {} used for the fit",
            set.kind,
            count(&set.full_mask),
            count(&set.good_mask)
        );
        Ok(set)
    }

    /// Indices of the reported targets, in table order.
    pub fn full_rows(&self) -> Vec<usize> {
        (0..self.full_mask.len())
            .filter(|&i| self.full_mask[i])
            .collect()
    }

    /// GP input over the reported targets and the good mask within them.
    pub fn gp_data(
        &self,
        embedding: &Array2<f64>,
        phases: Option<&Array1<f64>>,
        peculiar_velocity: &Array1<f64>,
    ) -> (GpData, Vec<bool>) {
        let rows = self.full_rows();
        let data = GpData {
            coordinates: embedding.select(Axis(0), &rows),
            phases: phases.map(|p| p.select(Axis(0), &rows)),
            magnitudes: self.magnitudes.select(Axis(0), &rows),
            colors: self.colors.select(Axis(0), &rows),
            measurement_uncertainties: self.measurement_uncertainties.select(Axis(0), &rows),
            peculiar_velocity_uncertainties: peculiar_velocity.select(Axis(0), &rows),
        };
        let good = rows.iter().map(|&i| self.good_mask[i]).collect();
        (data, good)
    }
}

/// GP-standardized magnitudes, aligned with the table. Targets outside the
/// full mask are NaN.
#[derive(Debug, Clone)]
pub struct ManifoldStandardization {
    pub kind: StandardizationKind,
    pub hyperparameters: GpHyperparameters,
    pub objective: Option<f64>,
    pub corrected_magnitudes: Array1<f64>,
    pub corrected_variances: Option<Array1<f64>>,
    pub hyperparameter_covariance: Option<Array2<f64>>,
    pub nmad: f64,
    pub std: f64,
}

/// Options of [`standardize_on_manifold`].
#[derive(Debug, Clone, Copy)]
pub struct ManifoldOptions<'a> {
    pub fit: GpFit,
    pub phase_kernel: bool,
    pub estimate_covariance: bool,
    /// Group label of each table target for leave-group-out prediction.
    pub groups: Option<&'a [usize]>,
    pub minimize: MinimizeOptions,
    pub verbosity: u8,
}

pub fn standardize_on_manifold(
    set: &MagnitudeSet,
    embedding: &Array2<f64>,
    phases: Option<&Array1<f64>>,
    peculiar_velocity: &Array1<f64>,
    options: ManifoldOptions<'_>,
) -> Result<ManifoldStandardization, StandardizationError> {
    let (data, good) = set.gp_data(embedding, phases, peculiar_velocity);
    let rows = set.full_rows();
    let groups: Option<Vec<usize>> = options
        .groups
        .map(|labels| rows.iter().map(|&i| labels[i]).collect());

    let pb = create_progress_bar(
        data.len() as u64,
        "Out-of-sample GP predictions",
        options.verbosity,
    );
    let result = match options.fit {
        GpFit::Likelihood => fit_gp_likelihood(
            &data,
            &good,
            &GpHyperparameters::starting_point(DEFAULT_LIKELIHOOD_START, options.phase_kernel),
            groups.as_deref(),
            options.minimize,
            options.estimate_covariance,
            Some(&pb),
        )?,
        GpFit::Dispersion => apply_gp_standardization(
            &data,
            &good,
            None,
            &GpHyperparameters::starting_point(DEFAULT_DISPERSION_START, options.phase_kernel),
            groups.as_deref(),
            options.minimize,
            Some(&pb),
        )?,
    };
    pb.finish_and_clear();

    let n = set.magnitudes.len();
    let mut corrected_magnitudes = Array1::from_elem(n, f64::NAN);
    let mut corrected_variances = result
        .corrected_variances
        .as_ref()
        .map(|_| Array1::from_elem(n, f64::NAN));
    for (row, &target) in rows.iter().enumerate() {
        corrected_magnitudes[target] = result.corrected_magnitudes[row];
        if let (Some(out), Some(variances)) =
            (corrected_variances.as_mut(), result.corrected_variances.as_ref())
        {
            out[target] = variances[row];
        }
    }

    Ok(ManifoldStandardization {
        kind: set.kind,
        hyperparameters: result.hyperparameters,
        objective: result.objective,
        corrected_magnitudes,
        corrected_variances,
        hyperparameter_covariance: result.hyperparameter_covariance,
        nmad: result.nmad,
        std: result.std,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn options() -> MinimizeOptions {
        MinimizeOptions {
            tolerance: 1e-8,
            max_iterations: 500,
        }
    }

    /// Targets following `mb = MB − α·x1 + β·c` exactly, with a small scatter.
    fn tripp_sample(n: usize) -> (Vec<SaltFit>, Array1<f64>) {
        let (mb0, alpha, beta) = (-19.1, 0.14, 3.1);
        let fits = (0..n)
            .map(|i| {
                let t = i as f64;
                let x1 = 2.0 * (0.7 * t).sin();
                let c = 0.1 * (1.3 * t).cos();
                let scatter = 0.08 * (2.1 * t + 0.4).sin();
                let mb = mb0 - alpha * x1 + beta * c + scatter;
                let x0 = 10f64.powf(-0.4 * mb);
                SaltFit {
                    t0: 0.0,
                    t0_err: 0.1,
                    x0,
                    x0_err: 0.01 * x0,
                    x1,
                    x1_err: 0.1,
                    c,
                    c_err: 0.005,
                    covariance: [[0.0; 4]; 4],
                }
            })
            .collect();
        (fits, Array1::from_elem(n, 0.01))
    }

    #[test]
    fn kinds_parse_and_unknown_names_fail() {
        assert_eq!("salt_raw".parse::<StandardizationKind>().unwrap(), StandardizationKind::SaltRaw);
        assert_eq!(StandardizationKind::Rbtl.to_string(), "rbtl");
        assert!(matches!(
            "nearest".parse::<StandardizationKind>(),
            Err(StandardizationError::UnknownKind(name)) if name == "nearest"
        ));
    }

    #[test]
    fn peculiar_velocity_term_falls_with_redshift() {
        let pec = peculiar_velocity_uncertainty(&array![0.01, 0.05], 300.0);
        assert_abs_diff_eq!(pec[0], 5.0 / std::f64::consts::LN_10 * 300.0 / SPEED_OF_LIGHT / 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(pec[0] / pec[1], 5.0, epsilon = 1e-12);
    }

    #[test]
    fn magnitude_covariances_follow_the_x0_jacobian() {
        let mut fit = tripp_sample(1).0.remove(0);
        fit.covariance[1][2] = 2e-3 * fit.x0;
        fit.covariance[1][3] = -1e-3 * fit.x0;
        fit.covariance[2][3] = 5e-4;
        let terms = SaltTerms::from_fits(&[Some(&fit), None]);
        assert_abs_diff_eq!(terms.cov_mb_x1[0], -2e-3 * FRAC_TO_MAG, epsilon = 1e-12);
        assert_abs_diff_eq!(terms.cov_color_mb[0], 1e-3 * FRAC_TO_MAG, epsilon = 1e-12);
        assert_abs_diff_eq!(terms.mb_err[0], 0.01 * FRAC_TO_MAG, epsilon = 1e-12);
        assert!(terms.mb[1].is_nan());
    }

    #[test]
    fn salt_fit_recovers_the_tripp_coefficients() {
        let (fits, pec) = tripp_sample(40);
        let refs: Vec<Option<&SaltFit>> = fits.iter().map(Some).collect();
        let terms = SaltTerms::from_fits(&refs);
        let result = fit_salt(&terms, &pec, &vec![true; 40], options()).unwrap();

        assert_abs_diff_eq!(result.alpha, 0.14, epsilon = 0.03);
        assert_abs_diff_eq!(result.beta, 3.1, epsilon = 0.3);
        assert_abs_diff_eq!(result.absolute_magnitude, -19.1, epsilon = 0.03);
        assert!(result.intrinsic_dispersion > 0.02 && result.intrinsic_dispersion < 0.12);
        assert!(result.rms < 0.1);
        assert_abs_diff_eq!(stats::mean(&result.raw_residuals.to_vec()), 0.0, epsilon = 1e-12);
        for (raw, full) in result.raw_uncertainties.iter().zip(result.uncertainties.iter()) {
            assert!(raw < full);
        }
    }

    #[test]
    fn raw_residuals_are_centered_on_every_fitted_target() {
        let (fits, _) = tripp_sample(30);
        let mut refs: Vec<Option<&SaltFit>> = fits.iter().map(Some).collect();
        refs.push(None);
        let pec = Array1::from_elem(31, 0.01);
        let terms = SaltTerms::from_fits(&refs);
        // The first ten targets have light-curve fits but are not fit targets.
        let good: Vec<bool> = (0..31).map(|i| (10..30).contains(&i)).collect();
        let result = fit_salt(&terms, &pec, &good, options()).unwrap();

        let finite: Vec<f64> =
            result.raw_residuals.iter().copied().filter(|r| r.is_finite()).collect();
        assert_eq!(finite.len(), 30);
        assert!(result.raw_residuals[30].is_nan());
        assert_abs_diff_eq!(stats::mean(&finite), 0.0, epsilon = 1e-12);

        // Centering on the fit targets alone would leave the full mean offset.
        let (raw, _) = terms.residuals(result.absolute_magnitude, 0.0, 0.0, 0.0, &pec);
        let all_mean = stats::mean(&raw.iter().copied().take(30).collect::<Vec<_>>());
        assert_abs_diff_eq!(result.raw_residuals[0], raw[0] - all_mean, epsilon = 1e-12);
    }

    #[test]
    fn every_tripp_pass_starts_from_the_fiducial_point() {
        let (fits, pec) = tripp_sample(25);
        let refs: Vec<Option<&SaltFit>> = fits.iter().map(Some).collect();
        let terms = SaltTerms::from_fits(&refs);
        let rows: Vec<usize> = (0..25).collect();
        let fiducial = fit_tripp(&terms, &pec, &rows, 0.08, options());
        let direct = minimize_numerical(
            Array1::from(SALT_START.to_vec()),
            |x: &Array1<f64>| {
                let (r, u) = terms.residuals(x[0], x[1], x[2], 0.08, &pec);
                weighted_rms(&r, &u, &rows)
            },
            options(),
        );
        assert_eq!(fiducial, direct.x);
    }

    #[test]
    fn salt_fit_needs_more_targets_than_parameters() {
        let (fits, pec) = tripp_sample(4);
        let refs: Vec<Option<&SaltFit>> = fits.iter().map(Some).collect();
        let terms = SaltTerms::from_fits(&refs);
        assert!(matches!(
            fit_salt(&terms, &pec, &[true; 4], options()),
            Err(StandardizationError::TooFewSaltTargets(4))
        ));
    }

    fn masks(n: usize) -> Masks {
        Masks {
            uncertainty: vec![true; n],
            redshift_color: (0..n).map(|i| i != 1).collect(),
            salt: vec![true; n],
            finite_magnitude: (0..n).map(|i| i != 2).collect(),
            uncertainty_fraction: Array1::zeros(n),
        }
    }

    #[test]
    fn salt_sources_require_a_salt_fit() {
        let zeros = Array1::zeros(4);
        assert!(matches!(
            MagnitudeSet::select(StandardizationKind::Salt, &zeros, &zeros, None, &zeros, &masks(4)),
            Err(StandardizationError::SaltResidualsUnavailable)
        ));
    }

    #[test]
    fn gp_rows_follow_the_full_mask() {
        let magnitudes = array![0.1, 0.2, f64::NAN, 0.4];
        let colors = array![0.0, 0.1, 0.2, 0.3];
        let pec = Array1::from_elem(4, 0.02);
        let set = MagnitudeSet::select(
            StandardizationKind::Rbtl,
            &magnitudes,
            &colors,
            None,
            &pec,
            &masks(4),
        )
        .unwrap();
        assert_eq!(set.full_rows(), vec![0, 1, 3]);

        let embedding = Array2::from_shape_fn((4, 2), |(i, j)| (i * 2 + j) as f64);
        let (data, good) = set.gp_data(&embedding, None, &pec);
        assert_eq!(data.len(), 3);
        assert_eq!(good, vec![true, false, true]);
        assert_eq!(data.coordinates.row(2), embedding.row(3));
        assert_eq!(data.magnitudes, array![0.1, 0.2, 0.4]);
    }
}
