//! # Analysis Settings
//!
//! Every tunable of the analysis lives in [`AnalysisSettings`]. The struct is
//! serialized to and from TOML so that a run can be reproduced exactly from its
//! settings file, and every field has a default so a partial file is valid.
//!
//! Settings are validated once, up front, by [`AnalysisSettings::validate`].
//! Nothing in the estimation stages re-checks them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating the analysis settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Must have an even number of phase coefficients, but {0} were requested.")]
    OddPhaseCoefficients(usize),

    #[error("At least two phase coefficients are required, but {0} were requested.")]
    TooFewPhaseCoefficients(usize),

    #[error("The setting '{name}' must be strictly positive, but was {value}.")]
    NonPositive { name: &'static str, value: f64 },

    #[error("Wavelength window for '{name}' is empty: [{min}, {max}].")]
    EmptyWavelengthWindow {
        name: &'static str,
        min: f64,
        max: f64,
    },

    #[error("Isomap requires at least one neighbor and one output component.")]
    InvalidIsomapShape,

    #[error("Failed to read settings file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML settings file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize settings to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// The full configuration of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Identifier of the dataset release the spectra come from.
    pub idr: String,
    /// Half-width of the phase window around maximum light, in days.
    pub phase_range: f64,
    /// Velocity width of the spectral bins used by the ingestion step (km/s).
    pub bin_velocity: f64,
    pub bin_min_wavelength: f64,
    pub bin_max_wavelength: f64,
    /// Wavelength window of the signal-to-noise quality cut.
    pub s2n_cut_min_wavelength: f64,
    pub s2n_cut_max_wavelength: f64,
    pub s2n_cut_threshold: f64,
    /// Number of phase-dispersion control points. Must be even so that the
    /// grid splits symmetrically at maximum light.
    pub maximum_num_phase_coefficients: usize,
    /// R_V of the fiducial Fitzpatrick (1999) color law.
    pub rbtl_fiducial_rv: f64,
    pub mask_uncertainty_fraction: f64,
    pub isomap_num_neighbors: usize,
    pub isomap_num_components: usize,
    /// Hide validation-subset magnitudes as soon as they are computed.
    pub blinded: bool,
    pub verbosity: u8,

    /// Directory holding cached stage results.
    pub cache_directory: PathBuf,
    /// Read stored fits when their key matches. When false the fits are
    /// recomputed and the stored entries overwritten.
    pub use_cache: bool,
    /// Host-galaxy peculiar velocity dispersion, km/s.
    pub peculiar_velocity: f64,

    /// Magnitudes fed to the GP: `rbtl`, `salt` or `salt_raw`.
    pub standardization: String,
    pub gp_fit: GpFit,
    /// Add a Matérn kernel along the phase of each target's center spectrum.
    pub gp_phase_kernel: bool,
    pub gp_hyperparameter_covariance: bool,

    pub maximum_max_iterations: usize,
    pub rbtl_max_iterations: usize,
    pub gp_max_iterations: usize,
    pub optimizer_tolerance: f64,
}

/// How the GP hyperparameters are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpFit {
    /// Maximum likelihood of one joint GP over the good targets.
    Likelihood,
    /// Minimum out-of-sample dispersion of the good targets.
    Dispersion,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            idr: "BLACKSTONE".to_string(),
            phase_range: 5.0,
            bin_velocity: 1000.0,
            bin_min_wavelength: 3300.0,
            bin_max_wavelength: 8600.0,
            s2n_cut_min_wavelength: 3300.0,
            s2n_cut_max_wavelength: 3800.0,
            s2n_cut_threshold: 100.0,
            maximum_num_phase_coefficients: 4,
            rbtl_fiducial_rv: 2.8,
            mask_uncertainty_fraction: 0.1,
            isomap_num_neighbors: 10,
            isomap_num_components: 3,
            blinded: true,
            verbosity: 1,
            cache_directory: PathBuf::from("cache"),
            use_cache: true,
            peculiar_velocity: 300.0,
            standardization: "rbtl".to_string(),
            gp_fit: GpFit::Likelihood,
            gp_phase_kernel: false,
            gp_hyperparameter_covariance: true,
            maximum_max_iterations: 20000,
            rbtl_max_iterations: 5000,
            gp_max_iterations: 500,
            optimizer_tolerance: 1e-6,
        }
    }
}

impl AnalysisSettings {
    /// Checks every invariant the estimation stages rely on.
    ///
    /// This runs before any array is allocated, so a bad setting never costs a
    /// partial computation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let k = self.maximum_num_phase_coefficients;
        if k % 2 != 0 {
            return Err(ConfigError::OddPhaseCoefficients(k));
        }
        if k < 2 {
            return Err(ConfigError::TooFewPhaseCoefficients(k));
        }

        for (name, value) in [
            ("phase_range", self.phase_range),
            ("bin_velocity", self.bin_velocity),
            ("rbtl_fiducial_rv", self.rbtl_fiducial_rv),
            ("mask_uncertainty_fraction", self.mask_uncertainty_fraction),
            ("peculiar_velocity", self.peculiar_velocity),
            ("optimizer_tolerance", self.optimizer_tolerance),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }

        if !(self.bin_min_wavelength < self.bin_max_wavelength) {
            return Err(ConfigError::EmptyWavelengthWindow {
                name: "bin",
                min: self.bin_min_wavelength,
                max: self.bin_max_wavelength,
            });
        }
        if !(self.s2n_cut_min_wavelength < self.s2n_cut_max_wavelength) {
            return Err(ConfigError::EmptyWavelengthWindow {
                name: "s2n_cut",
                min: self.s2n_cut_min_wavelength,
                max: self.s2n_cut_max_wavelength,
            });
        }

        if self.isomap_num_neighbors == 0 || self.isomap_num_components == 0 {
            return Err(ConfigError::InvalidIsomapShape);
        }

        Ok(())
    }

    /// The ordered fields identifying the working sample. Any change in one of
    /// them changes the dataset hash and therefore every downstream cache key.
    pub fn dataset_hash_fields(&self) -> Vec<String> {
        vec![
            self.idr.clone(),
            self.phase_range.to_string(),
            self.bin_velocity.to_string(),
            self.bin_min_wavelength.to_string(),
            self.bin_max_wavelength.to_string(),
            self.s2n_cut_min_wavelength.to_string(),
            self.s2n_cut_max_wavelength.to_string(),
            self.s2n_cut_threshold.to_string(),
        ]
    }

    /// Loads settings from a TOML file. Missing fields take their defaults.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&toml_string)?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        AnalysisSettings::default().validate().expect("defaults must validate");
    }

    #[test]
    fn odd_phase_coefficient_count_is_rejected() {
        for k in [1, 3, 5, 7, 21] {
            let settings = AnalysisSettings {
                maximum_num_phase_coefficients: k,
                ..AnalysisSettings::default()
            };
            match settings.validate() {
                Err(ConfigError::OddPhaseCoefficients(found)) => assert_eq!(found, k),
                other => panic!("expected an odd-coefficient error, got {other:?}"),
            }
        }
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let settings: AnalysisSettings =
            toml::from_str("idr = \"TEST\"\nbin_velocity = 2000.0\n").unwrap();
        assert_eq!(settings.idr, "TEST");
        assert_eq!(settings.bin_velocity, 2000.0);
        assert_eq!(settings.phase_range, AnalysisSettings::default().phase_range);
    }

    #[test]
    fn settings_round_trip_through_toml() {
        let settings = AnalysisSettings::default();
        let text = settings.to_toml().unwrap();
        let parsed: AnalysisSettings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn gp_fit_mode_parses_lowercase() {
        let settings: AnalysisSettings = toml::from_str("gp_fit = \"dispersion\"\n").unwrap();
        assert_eq!(settings.gp_fit, GpFit::Dispersion);
        assert!(toml::from_str::<AnalysisSettings>("gp_fit = \"median\"\n").is_err());
    }

    #[test]
    fn hash_fields_track_binning() {
        let base = AnalysisSettings::default();
        let other = AnalysisSettings {
            bin_velocity: 1500.0,
            ..base.clone()
        };
        assert_ne!(base.dataset_hash_fields(), other.dataset_hash_fields());
    }
}
