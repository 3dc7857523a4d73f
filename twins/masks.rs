//! Target selection masks.
//!
//! Every mask is derived from upstream results and recomputed on demand;
//! none is ever edited by hand. "Full" masks select the targets whose
//! residuals are reported, "good" masks the subset trusted to fit
//! standardization parameters.

use crate::dataset::Subset;
use crate::stats::{frac_to_mag, median};
use ndarray::{Array1, Array2, Axis};

/// Largest tolerated heliocentric redshift uncertainty.
const MAX_REDSHIFT_ERROR: f64 = 0.004;
/// Targets closer than this are dominated by peculiar velocities.
const MIN_HELIO_REDSHIFT: f64 = 0.02;
/// Largest tolerated color excess over the sample median.
const MAX_COLOR_EXCESS: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct Masks {
    /// Interpolation uncertainty small compared to the intrinsic variation.
    pub uncertainty: Vec<bool>,
    pub redshift_color: Vec<bool>,
    /// Training or validation target with a SALT2 fit.
    pub salt: Vec<bool>,
    /// RBTL magnitude is available (not blinded).
    pub finite_magnitude: Vec<bool>,
    /// Ratio of interpolation uncertainty power to intrinsic power.
    pub uncertainty_fraction: Array1<f64>,
}

impl Masks {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        maximum_flux: &Array2<f64>,
        maximum_fluxerr: &Array2<f64>,
        fractional_dispersion: &Array1<f64>,
        magnitudes: &Array1<f64>,
        colors: &Array1<f64>,
        helio_redshifts: &Array1<f64>,
        redshift_errors: &Array1<f64>,
        subsets: &[Subset],
        salt_available: &[bool],
        mask_uncertainty_fraction: f64,
    ) -> Self {
        let uncertainty_fraction =
            uncertainty_fraction(maximum_flux, maximum_fluxerr, fractional_dispersion);
        let uncertainty: Vec<bool> = uncertainty_fraction
            .iter()
            .map(|&fraction| fraction < mask_uncertainty_fraction)
            .collect();
        log::info!(
            "Masking {}/{} targets whose interpolation uncertainty power is more than {:.3} of the intrinsic power.",
            uncertainty.iter().filter(|&&keep| !keep).count(),
            uncertainty.len(),
            mask_uncertainty_fraction
        );

        let median_color = median(&colors.to_vec());
        let redshift_color = (0..colors.len())
            .map(|i| {
                redshift_errors[i] < MAX_REDSHIFT_ERROR
                    && helio_redshifts[i] > MIN_HELIO_REDSHIFT
                    && colors[i] - median_color < MAX_COLOR_EXCESS
            })
            .collect();

        let salt = subsets
            .iter()
            .zip(salt_available.iter())
            .map(|(subset, &available)| {
                available && matches!(subset, Subset::Training | Subset::Validation)
            })
            .collect();

        Self {
            uncertainty,
            redshift_color,
            salt,
            finite_magnitude: magnitudes.iter().map(|m| m.is_finite()).collect(),
            uncertainty_fraction,
        }
    }

    pub fn len(&self) -> usize {
        self.uncertainty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uncertainty.is_empty()
    }

    /// Targets with an RBTL magnitude and a usable embedding.
    pub fn rbtl_full(&self) -> Vec<bool> {
        and(&self.finite_magnitude, &self.uncertainty)
    }

    pub fn rbtl_good(&self) -> Vec<bool> {
        and(&self.rbtl_full(), &self.redshift_color)
    }

    pub fn salt_full(&self) -> Vec<bool> {
        and(&self.salt, &self.uncertainty)
    }

    pub fn salt_good(&self) -> Vec<bool> {
        and(&self.good_salt(), &self.uncertainty)
    }

    /// Targets used to fit the SALT2 standardization, independent of the
    /// embedding.
    pub fn good_salt(&self) -> Vec<bool> {
        and(&self.salt, &self.redshift_color)
    }
}

pub fn and(a: &[bool], b: &[bool]) -> Vec<bool> {
    a.iter().zip(b.iter()).map(|(&x, &y)| x && y).collect()
}

pub fn count(mask: &[bool]) -> usize {
    mask.iter().filter(|&&keep| keep).count()
}

/// `Σ_w frac_to_mag(fluxerr/flux)² / Σ_w frac_to_mag(δ)²` per target.
pub fn uncertainty_fraction(
    maximum_flux: &Array2<f64>,
    maximum_fluxerr: &Array2<f64>,
    fractional_dispersion: &Array1<f64>,
) -> Array1<f64> {
    let intrinsic_power: f64 = fractional_dispersion
        .iter()
        .map(|&d| frac_to_mag(d).powi(2))
        .sum();
    let relative = maximum_fluxerr / maximum_flux;
    relative
        .mapv(|r| frac_to_mag(r).powi(2))
        .sum_axis(Axis(1))
        / intrinsic_power
}
