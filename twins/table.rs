//! # Spectrum Table
//!
//! The working sample: targets that survive the quality cuts, each with the
//! spectra falling inside the phase window around maximum light. Building the
//! table is the only place where spectra are annotated (phase shift, `usable`
//! and `center` flags); every later stage reads it immutably.
//!
//! Quality exclusions are not errors. They are counted in [`Attrition`] and
//! logged at debug level.

use crate::cache::hash_fields;
use crate::config::AnalysisSettings;
use crate::dataset::{
    DataError, Dataset, KEY_SUBSET, KEY_Z_CMB, KEY_Z_HELIO, KEY_Z_HELIO_ERR, MetaValue, Spectrum,
    Subset, Target,
};
use crate::progress::create_progress_bar;
use ndarray::{Array1, Array2};

/// Targets with fewer spectra than this are dropped before anything else.
const MIN_SPECTRA_PER_TARGET: usize = 5;
/// Largest tolerated uncertainty on the SALT2 time of maximum, in days.
const MAX_T0_UNCERTAINTY: f64 = 1.0;

/// Number of targets surviving each successive cut.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attrition {
    pub initial: usize,
    pub enough_spectra: usize,
    pub salt_daymax: usize,
    pub range: usize,
    pub usable: usize,
}

#[derive(Debug, Clone)]
pub struct SpectrumTable {
    pub wave: Array1<f64>,
    /// Surviving targets. Their spectra are those inside the phase window;
    /// the ones failing the signal-to-noise cut have `usable == false`.
    pub targets: Vec<Target>,
    pub attrition: Attrition,
    /// Identity of the working sample, the root of every cache key.
    pub dataset_hash: String,
}

impl SpectrumTable {
    /// Applies the sample selection to an ingested dataset.
    pub fn build(dataset: &Dataset, settings: &AnalysisSettings) -> Result<Self, DataError> {
        let mut attrition = Attrition {
            initial: dataset.targets.len(),
            ..Attrition::default()
        };
        let s2n_window: Vec<usize> = dataset
            .wave
            .iter()
            .enumerate()
            .filter(|&(_, &w)| {
                w >= settings.s2n_cut_min_wavelength && w <= settings.s2n_cut_max_wavelength
            })
            .map(|(i, _)| i)
            .collect();

        let pb = create_progress_bar(
            dataset.targets.len() as u64,
            "Selecting spectra",
            settings.verbosity,
        );
        let mut targets = Vec::new();
        for target in &dataset.targets {
            pb.inc(1);
            if let Some(selected) = select_target(target, settings, &s2n_window, &mut attrition) {
                targets.push(selected);
            }
        }
        pb.finish_and_clear();

        if targets.is_empty() {
            return Err(DataError::EmptySample);
        }
        for (index, target) in targets.iter_mut().enumerate() {
            for spectrum in target.spectra.iter_mut() {
                spectrum.target = index;
            }
        }

        log::info!(
            "Sample attrition: {} initial, {} with enough spectra, {} with a good time of maximum, {} in the phase window, {} usable",
            attrition.initial,
            attrition.enough_spectra,
            attrition.salt_daymax,
            attrition.range,
            attrition.usable
        );

        let mut fields = settings.dataset_hash_fields();
        fields.push(content_digest(&dataset.wave, &targets));
        let dataset_hash = hash_fields(&fields);

        Ok(Self {
            wave: dataset.wave.clone(),
            targets,
            attrition,
            dataset_hash,
        })
    }

    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn num_wave(&self) -> usize {
        self.wave.len()
    }

    /// Usable spectra of every target, in target order.
    pub fn usable_spectra(&self) -> Vec<&Spectrum> {
        self.targets
            .iter()
            .flat_map(|t| t.spectra.iter().filter(|s| s.usable))
            .collect()
    }

    /// The single center spectrum of each target.
    pub fn center_spectra(&self) -> Vec<&Spectrum> {
        self.targets
            .iter()
            .filter_map(|t| t.spectra.iter().find(|s| s.center))
            .collect()
    }

    /// Reads a metadata key for every target, looking at the center spectrum
    /// first and falling back to the target record.
    pub fn read_meta(&self, key: &str) -> Result<Vec<&MetaValue>, DataError> {
        self.targets
            .iter()
            .map(|target| {
                target
                    .spectra
                    .iter()
                    .find(|s| s.center)
                    .and_then(|s| s.meta.get(key))
                    .or_else(|| target.meta.get(key))
                    .ok_or_else(|| DataError::MetadataKeyNotFound(key.to_string()))
            })
            .collect()
    }

    pub fn read_meta_f64(&self, key: &str) -> Result<Array1<f64>, DataError> {
        let values = self.read_meta(key)?;
        values
            .into_iter()
            .zip(self.targets.iter())
            .map(|(value, target)| {
                value.as_f64().ok_or_else(|| DataError::MetadataNotNumeric {
                    key: key.to_string(),
                    target: target.name.clone(),
                    found: value.to_string(),
                })
            })
            .collect()
    }

    pub fn redshifts(&self) -> Result<Redshifts, DataError> {
        Ok(Redshifts {
            helio: self.read_meta_f64(KEY_Z_HELIO)?,
            cmb: self.read_meta_f64(KEY_Z_CMB)?,
            helio_err: self.read_meta_f64(KEY_Z_HELIO_ERR)?,
        })
    }

    pub fn subsets(&self) -> Result<Vec<Subset>, DataError> {
        self.read_meta(KEY_SUBSET)?
            .into_iter()
            .map(|value| value.to_string().parse())
            .collect()
    }

    /// SALT2 stretch per target, zero for targets without a light-curve fit.
    pub fn stretches(&self) -> Array1<f64> {
        self.targets
            .iter()
            .map(|t| t.salt_fit.as_ref().map_or(0.0, |fit| fit.x1))
            .collect()
    }

    /// Names of the targets, in table order.
    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.name.as_str()).collect()
    }

    /// Stacks a per-spectrum quantity into a `(spectra, wave)` matrix.
    pub fn stack<F>(spectra: &[&Spectrum], field: F) -> Array2<f64>
    where
        F: Fn(&Spectrum) -> &Array1<f64>,
    {
        let width = spectra.first().map_or(0, |s| field(s).len());
        let mut out = Array2::zeros((spectra.len(), width));
        for (mut row, spectrum) in out.rows_mut().into_iter().zip(spectra.iter()) {
            row.assign(field(spectrum));
        }
        out
    }
}

/// Redshift columns of the table.
#[derive(Debug, Clone)]
pub struct Redshifts {
    pub helio: Array1<f64>,
    pub cmb: Array1<f64>,
    pub helio_err: Array1<f64>,
}

fn signal_to_noise(spectrum: &Spectrum, window: &[usize]) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    let signal: f64 = window.iter().map(|&i| spectrum.flux[i]).sum();
    let noise: f64 = window
        .iter()
        .map(|&i| spectrum.fluxerr[i] * spectrum.fluxerr[i])
        .sum::<f64>()
        .sqrt();
    Some(signal / noise)
}

/// Runs one target through the cuts. Returns the annotated copy if it
/// survives.
fn select_target(
    target: &Target,
    settings: &AnalysisSettings,
    s2n_window: &[usize],
    attrition: &mut Attrition,
) -> Option<Target> {
    if target.spectra.len() < MIN_SPECTRA_PER_TARGET {
        log::debug!(
            "Cut {}: only {} spectra",
            target.name,
            target.spectra.len()
        );
        return None;
    }
    attrition.enough_spectra += 1;

    let mut spectra = target.spectra.clone();
    if let Some(fit) = &target.salt_fit {
        if fit.t0_err > MAX_T0_UNCERTAINTY {
            log::debug!(
                "Cut {}: time of maximum uncertainty {:.2} days",
                target.name,
                fit.t0_err
            );
            return None;
        }
        for spectrum in spectra.iter_mut() {
            spectrum.phase -= fit.t0;
        }
    }
    attrition.salt_daymax += 1;

    spectra.retain(|s| s.phase >= -settings.phase_range && s.phase <= settings.phase_range);
    if spectra.is_empty() {
        log::debug!("Cut {}: no spectra in the phase window", target.name);
        return None;
    }
    attrition.range += 1;

    for spectrum in spectra.iter_mut() {
        spectrum.center = false;
        spectrum.usable = match signal_to_noise(spectrum, s2n_window) {
            Some(s2n) if !(s2n >= settings.s2n_cut_threshold) => {
                log::debug!(
                    "Cut spectrum {} of {}: S/N {:.1}",
                    spectrum.name,
                    target.name,
                    s2n
                );
                false
            }
            _ => true,
        };
    }

    let center = spectra
        .iter()
        .enumerate()
        .filter(|(_, s)| s.usable)
        .fold(None::<(usize, f64)>, |best, (i, s)| match best {
            Some((_, best_phase)) if s.phase.abs() >= best_phase => best,
            _ => Some((i, s.phase.abs())),
        });
    let Some((center, _)) = center else {
        log::debug!("Cut {}: no usable spectra", target.name);
        return None;
    };
    spectra[center].center = true;
    attrition.usable += 1;

    Some(Target {
        name: target.name.clone(),
        meta: target.meta.clone(),
        salt_fit: target.salt_fit.clone(),
        spectra,
    })
}

/// Digest of the sample content that feeds the estimators.
fn content_digest(wave: &Array1<f64>, targets: &[Target]) -> String {
    let mut hasher = blake3::Hasher::new();
    for w in wave.iter() {
        hasher.update(&w.to_le_bytes());
    }
    for target in targets {
        hasher.update(target.name.as_bytes());
        for spectrum in target.spectra.iter().filter(|s| s.usable) {
            hasher.update(&spectrum.phase.to_le_bytes());
            for (f, e) in spectrum.flux.iter().zip(spectrum.fluxerr.iter()) {
                hasher.update(&f.to_le_bytes());
                hasher.update(&e.to_le_bytes());
            }
        }
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Metadata, SaltFit};
    use ndarray::array;

    fn spectrum(name: &str, phase: f64, level: f64) -> Spectrum {
        Spectrum {
            target: 0,
            name: name.to_string(),
            phase,
            flux: array![level, level, level],
            fluxerr: array![0.01, 0.01, 0.01],
            meta: Metadata::new(),
            usable: true,
            center: false,
        }
    }

    fn target(name: &str, phases: &[f64]) -> Target {
        let mut meta = Metadata::new();
        meta.insert(KEY_Z_HELIO.to_string(), MetaValue::Number(0.05));
        meta.insert(KEY_SUBSET.to_string(), MetaValue::Text("training".to_string()));
        Target {
            name: name.to_string(),
            meta,
            salt_fit: None,
            spectra: phases
                .iter()
                .enumerate()
                .map(|(i, &p)| spectrum(&format!("{name}-{i}"), p, 10.0))
                .collect(),
        }
    }

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            verbosity: 0,
            s2n_cut_min_wavelength: 3300.0,
            s2n_cut_max_wavelength: 3800.0,
            ..AnalysisSettings::default()
        }
    }

    fn dataset(targets: Vec<Target>) -> Dataset {
        Dataset::new(array![3400.0, 3600.0, 5000.0], targets).unwrap()
    }

    #[test]
    fn center_is_closest_to_maximum_with_first_on_ties() {
        let data = dataset(vec![target("a", &[-8.0, -3.0, 1.5, -1.5, 4.0, 9.0])]);
        let table = SpectrumTable::build(&data, &settings()).unwrap();
        let spectra = &table.targets[0].spectra;
        assert_eq!(spectra.len(), 4);
        let centers: Vec<_> = spectra.iter().filter(|s| s.center).collect();
        assert_eq!(centers.len(), 1);
        assert_eq!(centers[0].phase, 1.5);
    }

    #[test]
    fn low_signal_to_noise_spectra_are_not_center() {
        let mut t = target("a", &[-8.0, -3.0, 0.5, 2.0, 6.0]);
        t.spectra[2].fluxerr = array![1.0, 1.0, 1.0];
        let table = SpectrumTable::build(&dataset(vec![t]), &settings()).unwrap();
        let spectra = &table.targets[0].spectra;
        let faint = spectra.iter().find(|s| s.phase == 0.5).unwrap();
        assert!(!faint.usable);
        assert!(!faint.center);
        assert_eq!(table.center_spectra()[0].phase, 2.0);
        assert_eq!(table.usable_spectra().len(), 2);
    }

    #[test]
    fn attrition_counts_each_cut() {
        let few = target("few", &[0.0, 1.0]);
        let out_of_range = target("far", &[-20.0, -15.0, 12.0, 15.0, 30.0]);
        let mut late_t0 = target("late", &[0.0, 1.0, 2.0, 3.0, 4.0]);
        late_t0.salt_fit = Some(SaltFit {
            t0: 0.0,
            t0_err: 2.0,
            x0: 1.0,
            x0_err: 0.1,
            x1: 0.0,
            x1_err: 0.1,
            c: 0.0,
            c_err: 0.1,
            covariance: [[0.0; 4]; 4],
        });
        let good = target("good", &[-10.0, -2.0, 0.0, 2.0, 10.0]);
        let table =
            SpectrumTable::build(&dataset(vec![few, out_of_range, late_t0, good]), &settings())
                .unwrap();
        assert_eq!(
            table.attrition,
            Attrition {
                initial: 4,
                enough_spectra: 3,
                salt_daymax: 2,
                range: 1,
                usable: 1,
            }
        );
        assert_eq!(table.target_names(), vec!["good"]);
        assert_eq!(table.targets[0].spectra[0].target, 0);
    }

    #[test]
    fn salt_time_of_maximum_shifts_phases() {
        let mut t = target("a", &[10.0, 12.0, 14.0, 16.0, 30.0]);
        t.salt_fit = Some(SaltFit {
            t0: 13.0,
            t0_err: 0.2,
            x0: 1.0,
            x0_err: 0.1,
            x1: 0.7,
            x1_err: 0.1,
            c: 0.0,
            c_err: 0.1,
            covariance: [[0.0; 4]; 4],
        });
        let table = SpectrumTable::build(&dataset(vec![t]), &settings()).unwrap();
        let phases: Vec<f64> = table.targets[0].spectra.iter().map(|s| s.phase).collect();
        assert_eq!(phases, vec![-3.0, -1.0, 1.0, 3.0]);
        assert_eq!(table.stretches()[0], 0.7);
    }

    #[test]
    fn empty_sample_is_an_error() {
        let data = dataset(vec![target("few", &[0.0])]);
        assert!(matches!(
            SpectrumTable::build(&data, &settings()),
            Err(DataError::EmptySample)
        ));
    }

    #[test]
    fn metadata_prefers_center_spectrum_and_reports_missing_keys() {
        let mut t = target("a", &[-2.0, 0.0, 1.0, 2.0, 3.0]);
        t.spectra[1]
            .meta
            .insert(KEY_Z_HELIO.to_string(), MetaValue::Number(0.07));
        let table = SpectrumTable::build(&dataset(vec![t]), &settings()).unwrap();
        assert_eq!(table.read_meta_f64(KEY_Z_HELIO).unwrap()[0], 0.07);
        assert_eq!(table.subsets().unwrap(), vec![Subset::Training]);
        match table.read_meta("host.mass") {
            Err(DataError::MetadataKeyNotFound(key)) => assert_eq!(key, "host.mass"),
            other => panic!("expected a lookup error, got {other:?}"),
        }
    }

    #[test]
    fn dataset_hash_tracks_settings_and_content() {
        let data = dataset(vec![target("a", &[-2.0, 0.0, 1.0, 2.0, 3.0])]);
        let base = SpectrumTable::build(&data, &settings()).unwrap();
        let again = SpectrumTable::build(&data, &settings()).unwrap();
        assert_eq!(base.dataset_hash, again.dataset_hash);

        let binned = AnalysisSettings {
            bin_velocity: 2000.0,
            ..settings()
        };
        assert_ne!(
            base.dataset_hash,
            SpectrumTable::build(&data, &binned).unwrap().dataset_hash
        );

        let mut changed = data.clone();
        changed.targets[0].spectra[1].flux[2] += 1.0;
        assert_ne!(
            base.dataset_hash,
            SpectrumTable::build(&changed, &settings()).unwrap().dataset_hash
        );
    }
}
