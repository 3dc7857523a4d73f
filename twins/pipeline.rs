//! # Analysis Pipeline
//!
//! Runs the stages in order, each consuming the immutable results of the
//! previous ones:
//!
//! 1. sample selection into a [`SpectrumTable`];
//! 2. the maximum-light fit (cached);
//! 3. the RBTL dereddening fit (cached), parsed with blinding;
//! 4. masks and the Isomap embedding of the residual spectra;
//! 5. the SALT2 baseline and the manifold GP standardization;
//! 6. twin-pair diagnostics.
//!
//! The two joint fits are the expensive stages. Their raw results are cached
//! under a key derived from the dataset identity, the model identity and
//! the configuration fields the fit depends on.

use crate::cache::{CacheError, CacheStatus, Cached, ResultCache, hash_fields, hash_text};
use crate::config::{AnalysisSettings, ConfigError};
use crate::dataset::{DataError, Dataset, Subset};
use crate::estimate::color_law::fitzpatrick99;
use crate::estimate::embedding::{EmbeddingError, embed_masked, fractional_residuals};
use crate::estimate::maximum::{self, MaximumData, MaximumError, MaximumResult, fit_maximum};
use crate::estimate::optimize::MinimizeOptions;
use crate::estimate::rbtl::{self, RbtlError, RbtlResult, fit_rbtl};
use crate::masks::Masks;
use crate::pairs::{TwinDispersion, leakage_matrix, twin_dispersion};
use crate::standardize::{
    MagnitudeSet, ManifoldOptions, ManifoldStandardization, SaltStandardization, SaltTerms,
    StandardizationError, StandardizationKind, fit_salt, peculiar_velocity_uncertainty,
    standardize_on_manifold,
};
use crate::table::{Attrition, SpectrumTable};
use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Invalid settings: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Maximum-light fit failed: {0}")]
    Maximum(#[from] MaximumError),

    #[error("Dereddening fit failed: {0}")]
    Rbtl(#[from] RbtlError),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Standardization(#[from] StandardizationError),

    #[error("Failed to write results: {0}")]
    Io(#[from] std::io::Error),
}

/// Spectra of the table in the layout of the maximum-light fit.
pub fn maximum_data(table: &SpectrumTable) -> MaximumData {
    let spectra = table.usable_spectra();
    MaximumData {
        flux: SpectrumTable::stack(&spectra, |s| &s.flux),
        fluxerr: SpectrumTable::stack(&spectra, |s| &s.fluxerr),
        phases: spectra.iter().map(|s| s.phase).collect(),
        targets: spectra.iter().map(|s| s.target).collect(),
        centers: spectra.iter().map(|s| s.center).collect(),
        stretches: table.stretches(),
    }
}

pub fn maximum_hash(table: &SpectrumTable, settings: &AnalysisSettings) -> String {
    hash_fields(&[
        table.dataset_hash.clone(),
        hash_text(maximum::MODEL_IDENTITY),
        settings.maximum_num_phase_coefficients.to_string(),
    ])
}

pub fn rbtl_hash(maximum_hash: &str, settings: &AnalysisSettings) -> String {
    hash_fields(&[
        maximum_hash.to_string(),
        hash_text(rbtl::MODEL_IDENTITY),
        settings.rbtl_fiducial_rv.to_string(),
    ])
}

/// Loads the maximum-light fit from the cache, or runs and stores it.
/// With `use_cache` off the fit always runs.
pub fn maximum_stage(
    table: &SpectrumTable,
    settings: &AnalysisSettings,
    cache: &ResultCache,
) -> Result<Cached<MaximumResult>, AnalysisError> {
    let hash = maximum_hash(table, settings);
    if settings.use_cache {
        if let Some(value) = cache.load::<MaximumResult>(&hash) {
            return Ok(Cached {
                value,
                hash,
                status: CacheStatus::Hit,
            });
        }
    } else {
        log::debug!("Cache lookup disabled; recomputing {hash}");
    }

    let value = fit_maximum(
        &maximum_data(table),
        settings.phase_range,
        settings.maximum_num_phase_coefficients,
        MinimizeOptions {
            tolerance: settings.optimizer_tolerance,
            max_iterations: settings.maximum_max_iterations,
        },
    )?;
    if !value.converged {
        log::warn!("Maximum-light fit did not converge; using the best point found.");
    }
    cache.save(&hash, &value)?;
    Ok(Cached {
        value,
        hash,
        status: CacheStatus::Computed,
    })
}

/// Loads the dereddening fit from the cache, or runs and stores it.
pub fn rbtl_stage(
    table: &SpectrumTable,
    settings: &AnalysisSettings,
    cache: &ResultCache,
    maximum: &Cached<MaximumResult>,
) -> Result<Cached<RbtlResult>, AnalysisError> {
    let hash = rbtl_hash(&maximum.hash, settings);
    if settings.use_cache {
        if let Some(value) = cache.load::<RbtlResult>(&hash) {
            return Ok(Cached {
                value,
                hash,
                status: CacheStatus::Hit,
            });
        }
    } else {
        log::debug!("Cache lookup disabled; recomputing {hash}");
    }

    let color_law = fitzpatrick99(&table.wave, settings.rbtl_fiducial_rv);
    let value = fit_rbtl(
        &maximum.value.maximum_flux,
        &maximum.value.maximum_fluxerr,
        &color_law,
        MinimizeOptions {
            tolerance: settings.optimizer_tolerance,
            max_iterations: settings.rbtl_max_iterations,
        },
    )?;
    if !value.converged {
        log::warn!("Dereddening fit did not converge; using the best point found.");
    }
    cache.save(&hash, &value)?;
    Ok(Cached {
        value,
        hash,
        status: CacheStatus::Computed,
    })
}

/// Dereddening results as the rest of the analysis sees them.
#[derive(Debug, Clone)]
pub struct ParsedRbtl {
    /// NaN for every blinded target.
    pub magnitudes: Array1<f64>,
    pub colors: Array1<f64>,
    pub mean_flux: Array1<f64>,
    pub fractional_dispersion: Array1<f64>,
    /// Spectra at maximum divided by their model scale.
    pub scaled_flux: Array2<f64>,
    pub scaled_fluxerr: Array2<f64>,
}

impl ParsedRbtl {
    /// With `blinded`, magnitudes of the validation subset are replaced by
    /// NaN before anything else can read them.
    pub fn parse(
        result: &RbtlResult,
        maximum: &MaximumResult,
        subsets: &[Subset],
        blinded: bool,
    ) -> Self {
        let mut magnitudes = result.magnitudes.clone();
        if blinded {
            let mut hidden = 0;
            for (magnitude, subset) in magnitudes.iter_mut().zip(subsets.iter()) {
                if *subset == Subset::Validation {
                    *magnitude = f64::NAN;
                    hidden += 1;
                }
            }
            log::info!("Blinded the magnitudes of {hidden} validation targets.");
        }
        Self {
            magnitudes,
            colors: result.colors.clone(),
            mean_flux: result.mean_flux.clone(),
            fractional_dispersion: result.fractional_dispersion.clone(),
            scaled_flux: &maximum.maximum_flux / &result.model_scales,
            scaled_fluxerr: &maximum.maximum_fluxerr / &result.model_scales,
        }
    }
}

/// Everything one analysis run produces.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub target_names: Vec<String>,
    pub subsets: Vec<Subset>,
    pub attrition: Attrition,
    pub maximum: Cached<MaximumResult>,
    pub rbtl: Cached<RbtlResult>,
    pub parsed: ParsedRbtl,
    pub masks: Masks,
    /// Isomap coordinates, NaN outside the uncertainty mask.
    pub embedding: Array2<f64>,
    pub peculiar_velocity: Array1<f64>,
    /// Absent when too few targets qualify for the SALT2 fit.
    pub salt: Option<SaltStandardization>,
    pub manifold: ManifoldStandardization,
    pub twins: TwinDispersion,
    pub leakage: Array2<f64>,
}

impl AnalysisReport {
    /// One row per target, tab-separated.
    pub fn write_tsv(&self, path: &Path) -> Result<(), AnalysisError> {
        let mut writer = BufWriter::new(File::create(path)?);
        let components = self.embedding.ncols();
        let mut header = vec![
            "name".to_string(),
            "subset".to_string(),
            "rbtl_mag".to_string(),
            "rbtl_color".to_string(),
        ];
        header.extend((1..=components).map(|c| format!("embedding_{c}")));
        header.extend(
            [
                "uncertainty_mask",
                "redshift_color_mask",
                "salt_hr",
                "gp_corrected_mag",
                "gp_corrected_std",
            ]
            .map(String::from),
        );
        writeln!(writer, "{}", header.join("\t"))?;

        for (i, name) in self.target_names.iter().enumerate() {
            let mut row = vec![
                name.clone(),
                self.subsets[i].to_string(),
                self.parsed.magnitudes[i].to_string(),
                self.parsed.colors[i].to_string(),
            ];
            row.extend(self.embedding.row(i).iter().map(f64::to_string));
            row.push(self.masks.uncertainty[i].to_string());
            row.push(self.masks.redshift_color[i].to_string());
            row.push(
                self.salt
                    .as_ref()
                    .map_or(f64::NAN, |salt| salt.residuals[i])
                    .to_string(),
            );
            row.push(self.manifold.corrected_magnitudes[i].to_string());
            row.push(
                self.manifold
                    .corrected_variances
                    .as_ref()
                    .map_or(f64::NAN, |v| v[i].sqrt())
                    .to_string(),
            );
            writeln!(writer, "{}", row.join("\t"))?;
        }
        writer.flush()?;
        log::info!("Wrote per-target results to {}", path.display());
        Ok(())
    }
}

/// Runs the whole analysis on an ingested dataset.
pub fn run_analysis(
    dataset: &Dataset,
    settings: &AnalysisSettings,
) -> Result<AnalysisReport, AnalysisError> {
    settings.validate()?;
    let kind: StandardizationKind = settings.standardization.parse()?;

    let table = SpectrumTable::build(dataset, settings)?;
    let cache = ResultCache::new(&settings.cache_directory);
    let subsets = table.subsets()?;
    let redshifts = table.redshifts()?;

    let maximum = maximum_stage(&table, settings, &cache)?;
    let rbtl = rbtl_stage(&table, settings, &cache, &maximum)?;
    let parsed = ParsedRbtl::parse(&rbtl.value, &maximum.value, &subsets, settings.blinded);

    let salt_fits: Vec<_> = table.targets.iter().map(|t| t.salt_fit.as_ref()).collect();
    let masks = Masks::build(
        &maximum.value.maximum_flux,
        &maximum.value.maximum_fluxerr,
        &parsed.fractional_dispersion,
        &parsed.magnitudes,
        &parsed.colors,
        &redshifts.helio,
        &redshifts.helio_err,
        &subsets,
        &salt_fits.iter().map(Option::is_some).collect::<Vec<_>>(),
        settings.mask_uncertainty_fraction,
    );

    let residuals = fractional_residuals(&parsed.scaled_flux, &parsed.mean_flux);
    let embedding = embed_masked(
        &residuals,
        &masks.uncertainty,
        settings.isomap_num_neighbors,
        settings.isomap_num_components,
    )?;

    let peculiar_velocity = peculiar_velocity_uncertainty(&redshifts.cmb, settings.peculiar_velocity);
    let gp_options = MinimizeOptions {
        tolerance: settings.optimizer_tolerance,
        max_iterations: settings.gp_max_iterations,
    };
    let salt = match fit_salt(
        &SaltTerms::from_fits(&salt_fits),
        &peculiar_velocity,
        &masks.good_salt(),
        gp_options,
    ) {
        Ok(salt) => Some(salt),
        Err(StandardizationError::TooFewSaltTargets(found)) => {
            log::warn!("Skipping the SALT2 standardization: only {found} targets qualify.");
            None
        }
        Err(err) => return Err(err.into()),
    };

    let phases: Option<Array1<f64>> = settings
        .gp_phase_kernel
        .then(|| table.center_spectra().iter().map(|s| s.phase).collect());
    let set = MagnitudeSet::select(
        kind,
        &parsed.magnitudes,
        &parsed.colors,
        salt.as_ref(),
        &peculiar_velocity,
        &masks,
    )?;
    let manifold = standardize_on_manifold(
        &set,
        &embedding,
        phases.as_ref(),
        &peculiar_velocity,
        ManifoldOptions {
            fit: settings.gp_fit,
            phase_kernel: settings.gp_phase_kernel,
            estimate_covariance: settings.gp_hyperparameter_covariance,
            groups: None,
            minimize: gp_options,
            verbosity: settings.verbosity,
        },
    )?;

    let twins = twin_dispersion(&residuals, &parsed.magnitudes, &masks.rbtl_good());
    let leakage = leakage_matrix(&residuals, &embedding, &masks.uncertainty);

    Ok(AnalysisReport {
        target_names: table.target_names().into_iter().map(String::from).collect(),
        subsets,
        attrition: table.attrition,
        maximum,
        rbtl,
        parsed,
        masks,
        embedding,
        peculiar_velocity,
        salt,
        manifold,
        twins,
        leakage,
    })
}
