//! Twin-pair diagnostics.
//!
//! Pairs of targets with similar residual spectra ("twins") should have
//! similar magnitudes. These functions measure that over all pairs of a
//! masked sample and check how well the embedding preserves the spectral
//! ranking of pairs.

use crate::stats::{self, percentile, percentile_of_score};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1};

/// Pairs closer than this spectral-distance percentile count as twins.
const TWIN_PERCENTILE: f64 = 20.0;

/// Percentile bands of pair distance, from best to worst twinness.
pub const TWINNESS_SPLITS: [(f64, f64); 4] = [(0.0, 10.0), (10.0, 20.0), (20.0, 50.0), (50.0, 100.0)];

/// Magnitude dispersion of twin pairs, per supernova.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwinDispersion {
    pub rms: f64,
    pub nmad: f64,
    pub num_pairs: usize,
}

fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Condensed pairwise distances between the masked rows, pairs `(i, j)` with
/// `i < j` in row order.
pub fn pairwise_distances(points: &Array2<f64>, mask: &[bool]) -> Vec<f64> {
    (0..points.nrows())
        .filter(|&i| mask[i])
        .tuple_combinations()
        .map(|(i, j)| euclidean(points.row(i), points.row(j)))
        .collect()
}

/// Dispersion of the magnitude differences of the closest 20 % of pairs.
///
/// Both the RMS and the centered NMAD are divided by `√2` so they describe a
/// single supernova rather than a pair.
pub fn twin_dispersion(
    residuals: &Array2<f64>,
    magnitudes: &Array1<f64>,
    mask: &[bool],
) -> TwinDispersion {
    let selected: Vec<f64> = (0..magnitudes.len())
        .filter(|&i| mask[i])
        .map(|i| magnitudes[i])
        .collect();
    let offset = stats::mean(&selected);
    let delta_magnitudes: Vec<f64> = selected
        .iter()
        .map(|m| m - offset)
        .tuple_combinations()
        .map(|(a, b)| (a - b).abs())
        .collect();
    let spectral = pairwise_distances(residuals, mask);

    let twins: Vec<f64> = spectral
        .iter()
        .zip(delta_magnitudes.iter())
        .filter(|&(&distance, _)| percentile_of_score(&spectral, distance) < TWIN_PERCENTILE)
        .map(|(_, &delta)| delta)
        .collect();

    let dispersion = TwinDispersion {
        rms: stats::rms(&twins) / 2f64.sqrt(),
        nmad: stats::nmad_centered(&twins) / 2f64.sqrt(),
        num_pairs: twins.len(),
    };
    log::info!(
        "Twin pairs ({} of {}): RMS {:.3} mag, NMAD {:.3} mag",
        dispersion.num_pairs,
        spectral.len(),
        dispersion.rms,
        dispersion.nmad
    );
    dispersion
}

fn band_membership(distances: &[f64]) -> Vec<Vec<bool>> {
    TWINNESS_SPLITS
        .iter()
        .map(|&(low, high)| {
            let (low, high) = (percentile(distances, low), percentile(distances, high));
            distances.iter().map(|&d| d >= low && d < high).collect()
        })
        .collect()
}

/// Fraction of the pairs in spectral band `i` whose embedding distance falls
/// in band `j`, for the bands of [`TWINNESS_SPLITS`].
///
/// A spectral band holding no pairs has an undefined fraction and its row is
/// NaN. This happens for very small samples and for heavily tied distances.
pub fn leakage_matrix(residuals: &Array2<f64>, embedding: &Array2<f64>, mask: &[bool]) -> Array2<f64> {
    let spectral = band_membership(&pairwise_distances(residuals, mask));
    let embedded = band_membership(&pairwise_distances(embedding, mask));

    let n = TWINNESS_SPLITS.len();
    Array2::from_shape_fn((n, n), |(i, j)| {
        let from = spectral[i].iter().filter(|&&inside| inside).count();
        if from == 0 {
            return f64::NAN;
        }
        let both = spectral[i]
            .iter()
            .zip(embedded[j].iter())
            .filter(|&(&a, &b)| a && b)
            .count();
        both as f64 / from as f64
    })
}
