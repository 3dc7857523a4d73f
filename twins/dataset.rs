//! # Ingested Dataset
//!
//! The observational records handed over by the ingestion collaborator: a list
//! of targets, each owning its time series of spectra on a common wavelength
//! grid. Binning and calibration happen upstream of this crate; here the data
//! is only validated and given a typed shape.
//!
//! Two CSV files make up a dataset on disk:
//!
//! - `targets.csv`: a `name` column plus one column per metadata key
//!   (`host.zhelio`, `host.zcmb`, `host.zhelio.err`, `idr.subset`, and the
//!   optional `salt2.*` light-curve fit columns).
//! - `spectra.csv`: long-format rows `target,spectrum,phase,wave,flux,fluxerr`.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Metadata keys every analysis needs.
pub const KEY_Z_HELIO: &str = "host.zhelio";
pub const KEY_Z_CMB: &str = "host.zcmb";
pub const KEY_Z_HELIO_ERR: &str = "host.zhelio.err";
pub const KEY_SUBSET: &str = "idr.subset";

/// A comprehensive error type for data loading and metadata access.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Error reading CSV input: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Couldn't find key '{0}' in the spectrum or target metadata.")]
    MetadataKeyNotFound(String),

    #[error("Metadata key '{key}' of target '{target}' is not numeric (found '{found}').")]
    MetadataNotNumeric {
        key: String,
        target: String,
        found: String,
    },

    #[error("The required column '{0}' was not found in '{1}'.")]
    ColumnNotFound(String, String),

    #[error("Could not parse '{value}' in column '{column}' as a number.")]
    InvalidNumber { column: String, value: String },

    #[error("Spectrum row references unknown target '{0}'.")]
    UnknownTarget(String),

    #[error("Unknown subset '{0}'; expected training, validation or other.")]
    UnknownSubset(String),

    #[error(
        "Spectrum '{spectrum}' of target '{target}' does not share the common wavelength grid."
    )]
    InconsistentWavelengthGrid { target: String, spectrum: String },

    #[error("The wavelength grid must be strictly increasing.")]
    NonMonotonicWavelengthGrid,

    #[error("No spectra survived the quality cuts; there is nothing to analyze.")]
    EmptySample,
}

/// Membership of a target in the dataset release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subset {
    Training,
    Validation,
    Other,
}

impl FromStr for Subset {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "training" => Ok(Subset::Training),
            "validation" => Ok(Subset::Validation),
            "other" | "" => Ok(Subset::Other),
            other => Err(DataError::UnknownSubset(other.to_string())),
        }
    }
}

impl fmt::Display for Subset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Subset::Training => "training",
            Subset::Validation => "validation",
            Subset::Other => "other",
        };
        f.write_str(label)
    }
}

/// A single metadata value. Numbers are parsed eagerly; anything else is
/// kept as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Number(f64),
    Text(String),
}

impl MetaValue {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(value) => MetaValue::Number(value),
            Err(_) => MetaValue::Text(raw.trim().to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Number(value) => Some(*value),
            MetaValue::Text(_) => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Number(value) => write!(f, "{value}"),
            MetaValue::Text(text) => f.write_str(text),
        }
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// SALT2 light-curve fit of one target.
///
/// The covariance is ordered `(t0, x0, x1, c)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaltFit {
    pub t0: f64,
    pub t0_err: f64,
    pub x0: f64,
    pub x0_err: f64,
    pub x1: f64,
    pub x1_err: f64,
    pub c: f64,
    pub c_err: f64,
    pub covariance: [[f64; 4]; 4],
}

impl SaltFit {
    /// Builds the fit from `salt2.*` metadata keys. Returns `None` when any of
    /// the central values is missing, which marks the target as having no
    /// usable light-curve fit.
    pub fn from_metadata(meta: &Metadata) -> Option<Self> {
        let get = |key: &str| meta.get(key).and_then(MetaValue::as_f64);
        let opt = |key: &str| get(key).unwrap_or(0.0);

        let t0 = get("salt2.t0")?;
        let x0 = get("salt2.x0")?;
        let x1 = get("salt2.x1")?;
        let c = get("salt2.c")?;

        let t0_err = opt("salt2.t0.err");
        let x0_err = opt("salt2.x0.err");
        let x1_err = opt("salt2.x1.err");
        let c_err = opt("salt2.c.err");

        let mut covariance = [[0.0; 4]; 4];
        let errs = [t0_err, x0_err, x1_err, c_err];
        for (i, err) in errs.iter().enumerate() {
            covariance[i][i] = err * err;
        }
        let names = ["t0", "x0", "x1", "c"];
        for i in 0..4 {
            for j in (i + 1)..4 {
                let key = format!("salt2.cov.{}.{}", names[i], names[j]);
                if let Some(value) = get(&key) {
                    covariance[i][j] = value;
                    covariance[j][i] = value;
                }
            }
        }

        Some(Self {
            t0,
            t0_err,
            x0,
            x0_err,
            x1,
            x1_err,
            c,
            c_err,
            covariance,
        })
    }
}

/// One flux measurement of a target at a given epoch.
#[derive(Debug, Clone)]
pub struct Spectrum {
    /// Index of the owning target in its containing collection.
    pub target: usize,
    pub name: String,
    /// Days relative to maximum light.
    pub phase: f64,
    pub flux: Array1<f64>,
    pub fluxerr: Array1<f64>,
    pub meta: Metadata,
    pub usable: bool,
    pub center: bool,
}

/// One supernova with its spectral time series.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub meta: Metadata,
    pub salt_fit: Option<SaltFit>,
    pub spectra: Vec<Spectrum>,
}

/// The complete ingested dataset on its common wavelength grid.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub wave: Array1<f64>,
    pub targets: Vec<Target>,
}

impl Dataset {
    /// Assembles a dataset, checking the shared-grid invariant.
    pub fn new(wave: Array1<f64>, mut targets: Vec<Target>) -> Result<Self, DataError> {
        if wave.windows(2).into_iter().any(|pair| pair[1] <= pair[0]) {
            return Err(DataError::NonMonotonicWavelengthGrid);
        }
        for (index, target) in targets.iter_mut().enumerate() {
            for spectrum in target.spectra.iter_mut() {
                spectrum.target = index;
                if spectrum.flux.len() != wave.len() || spectrum.fluxerr.len() != wave.len() {
                    return Err(DataError::InconsistentWavelengthGrid {
                        target: target.name.clone(),
                        spectrum: spectrum.name.clone(),
                    });
                }
            }
        }
        Ok(Self { wave, targets })
    }

    /// Loads the two-file CSV representation described in the module docs.
    pub fn load_csv(targets_path: &Path, spectra_path: &Path) -> Result<Self, DataError> {
        let mut targets = internal::read_targets(targets_path)?;
        let wave = internal::read_spectra(spectra_path, &mut targets)?;
        log::info!(
            "Loaded {} targets with {} spectra on a {}-point wavelength grid.",
            targets.len(),
            targets.iter().map(|t| t.spectra.len()).sum::<usize>(),
            wave.len()
        );
        Self::new(wave, targets)
    }
}

mod internal {
    use super::*;
    use std::collections::HashMap;

    fn column_index(
        headers: &csv::StringRecord,
        name: &str,
        path: &Path,
    ) -> Result<usize, DataError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string(), path.display().to_string()))
    }

    fn parse_number(column: &str, value: &str) -> Result<f64, DataError> {
        value.trim().parse().map_err(|_| DataError::InvalidNumber {
            column: column.to_string(),
            value: value.to_string(),
        })
    }

    pub(super) fn read_targets(path: &Path) -> Result<Vec<Target>, DataError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let name_idx = column_index(&headers, "name", path)?;

        let mut targets = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut meta = Metadata::new();
            for (idx, header) in headers.iter().enumerate() {
                if idx == name_idx {
                    continue;
                }
                if let Some(raw) = record.get(idx) {
                    if !raw.trim().is_empty() {
                        meta.insert(header.trim().to_string(), MetaValue::parse(raw));
                    }
                }
            }
            let salt_fit = SaltFit::from_metadata(&meta);
            targets.push(Target {
                name: record.get(name_idx).unwrap_or_default().trim().to_string(),
                meta,
                salt_fit,
                spectra: Vec::new(),
            });
        }
        Ok(targets)
    }

    struct SpectrumRows {
        target: usize,
        phase: f64,
        wave: Vec<f64>,
        flux: Vec<f64>,
        fluxerr: Vec<f64>,
    }

    /// Reads the long-format spectra table, attaches each spectrum to its
    /// target, and returns the common wavelength grid.
    pub(super) fn read_spectra(
        path: &Path,
        targets: &mut [Target],
    ) -> Result<Array1<f64>, DataError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let target_idx = column_index(&headers, "target", path)?;
        let spectrum_idx = column_index(&headers, "spectrum", path)?;
        let phase_idx = column_index(&headers, "phase", path)?;
        let wave_idx = column_index(&headers, "wave", path)?;
        let flux_idx = column_index(&headers, "flux", path)?;
        let fluxerr_idx = column_index(&headers, "fluxerr", path)?;

        let lookup: HashMap<String, usize> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        // Preserve first-seen order of spectra.
        let mut order: Vec<(String, String)> = Vec::new();
        let mut rows: HashMap<(String, String), SpectrumRows> = HashMap::new();

        for record in reader.records() {
            let record = record?;
            let field = |idx: usize| record.get(idx).unwrap_or_default().trim();
            let target_name = field(target_idx).to_string();
            let spectrum_name = field(spectrum_idx).to_string();
            let target = *lookup
                .get(&target_name)
                .ok_or_else(|| DataError::UnknownTarget(target_name.clone()))?;

            let key = (target_name, spectrum_name);
            if !rows.contains_key(&key) {
                let phase = parse_number("phase", field(phase_idx))?;
                order.push(key.clone());
                rows.insert(
                    key.clone(),
                    SpectrumRows {
                        target,
                        phase,
                        wave: Vec::new(),
                        flux: Vec::new(),
                        fluxerr: Vec::new(),
                    },
                );
            }
            let wave = parse_number("wave", field(wave_idx))?;
            let flux = parse_number("flux", field(flux_idx))?;
            let fluxerr = parse_number("fluxerr", field(fluxerr_idx))?;
            if let Some(entry) = rows.get_mut(&key) {
                entry.wave.push(wave);
                entry.flux.push(flux);
                entry.fluxerr.push(fluxerr);
            }
        }

        let mut grid: Option<Vec<f64>> = None;
        for key in order {
            let Some(spectrum) = rows.remove(&key) else {
                continue;
            };
            match &grid {
                None => grid = Some(spectrum.wave.clone()),
                Some(reference) => {
                    let matches = reference.len() == spectrum.wave.len()
                        && reference
                            .iter()
                            .zip(spectrum.wave.iter())
                            .all(|(a, b)| (a - b).abs() <= 1e-6 * a.abs().max(1.0));
                    if !matches {
                        return Err(DataError::InconsistentWavelengthGrid {
                            target: key.0,
                            spectrum: key.1,
                        });
                    }
                }
            }
            targets[spectrum.target].spectra.push(Spectrum {
                target: spectrum.target,
                name: key.1,
                phase: spectrum.phase,
                flux: Array1::from(spectrum.flux),
                fluxerr: Array1::from(spectrum.fluxerr),
                meta: Metadata::new(),
                usable: true,
                center: false,
            });
        }

        grid.map(Array1::from).ok_or(DataError::EmptySample)
    }
}
