use manifold_twins::dataset::{Metadata, MetaValue};
use manifold_twins::estimate::color_law::fitzpatrick99;
use manifold_twins::{AnalysisSettings, Dataset, Spectrum, Subset, Target};
use ndarray::{Array1, array};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::path::Path;

pub const PHASES: [f64; 6] = [-10.0, -6.0, -2.0, 2.0, 6.0, 10.0];

/// Five bins, two of them inside the default signal-to-noise window.
pub fn wave() -> Array1<f64> {
    array![3400.0, 3700.0, 4500.0, 5500.0, 6500.0]
}

/// Targets sharing one mean spectrum, each with a gray offset, a color along
/// the fiducial law and a few percent of idiosyncratic structure.
pub fn synthetic_dataset(subsets: &[Subset]) -> Dataset {
    let wave = wave();
    let mean = array![0.8, 1.0, 1.4, 1.2, 0.9];
    let color_law = fitzpatrick99(&wave, 2.8);
    let slope = array![0.02, 0.015, 0.01, 0.005, 0.0];
    let magnitudes = [0.0, 0.15, -0.1, 0.05];
    let colors = [0.0, 0.08, -0.04, 0.12];

    let mut rng = StdRng::seed_from_u64(20_240_611);
    let structure = Normal::new(0.0, 0.06).unwrap();

    let targets = subsets
        .iter()
        .enumerate()
        .map(|(t, subset)| {
            let variation: Array1<f64> = (0..wave.len()).map(|_| structure.sample(&mut rng)).collect();
            let spectra = PHASES
                .iter()
                .enumerate()
                .map(|(s, &phase)| {
                    let flux = Array1::from_shape_fn(wave.len(), |w| {
                        let magnitude = magnitudes[t % magnitudes.len()]
                            + colors[t % colors.len()] * color_law[w]
                            + slope[w] * phase
                            + 0.002 * phase * phase;
                        mean[w] * (1.0 + variation[w]) * 10f64.powf(-0.4 * magnitude)
                    });
                    Spectrum {
                        target: t,
                        name: format!("spectrum_{s}"),
                        phase,
                        fluxerr: Array1::from_elem(wave.len(), 1e-4),
                        flux,
                        meta: Metadata::new(),
                        usable: true,
                        center: false,
                    }
                })
                .collect();
            Target {
                name: format!("SN{t:03}"),
                meta: target_meta(*subset),
                salt_fit: None,
                spectra,
            }
        })
        .collect();

    Dataset::new(wave, targets).unwrap()
}

pub fn target_meta(subset: Subset) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("host.zhelio".into(), MetaValue::Number(0.05));
    meta.insert("host.zcmb".into(), MetaValue::Number(0.05));
    meta.insert("host.zhelio.err".into(), MetaValue::Number(0.001));
    meta.insert("idr.subset".into(), MetaValue::Text(subset.to_string()));
    meta
}

/// Default settings with a private cache and no progress output.
pub fn settings(cache: &Path) -> AnalysisSettings {
    AnalysisSettings {
        cache_directory: cache.to_path_buf(),
        verbosity: 0,
        ..AnalysisSettings::default()
    }
}
