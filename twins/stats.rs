//! Robust summary statistics over float slices.
//!
//! NaN entries are never filtered here; callers select the finite subset they
//! want to summarize first.

/// `2.5 / ln(10)`: converts a small fractional flux difference to magnitudes.
pub const FRAC_TO_MAG: f64 = 2.5 / std::f64::consts::LN_10;

/// Scale that turns a median absolute deviation into a Gaussian sigma.
const NMAD_SCALE: f64 = 1.4826;

pub fn frac_to_mag(fractional: f64) -> f64 {
    FRAC_TO_MAG * fractional
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let sorted = sorted(values);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    }
}

/// Population standard deviation.
pub fn std(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

pub fn rms(values: &[f64]) -> f64 {
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Normalized median absolute deviation about the median.
pub fn nmad(values: &[f64]) -> f64 {
    let center = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    NMAD_SCALE * median(&deviations)
}

/// Normalized median absolute deviation about zero, for quantities that are
/// centered by construction (e.g. pair differences).
pub fn nmad_centered(values: &[f64]) -> f64 {
    let deviations: Vec<f64> = values.iter().map(|v| v.abs()).collect();
    NMAD_SCALE * median(&deviations)
}

/// Percentile with linear interpolation between closest ranks, `q` in [0, 100].
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let sorted = sorted(values);
    let position = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Percentile rank of `score` within `values` (0 to 100). Ties receive the
/// average of the ranks they span.
pub fn percentile_of_score(values: &[f64], score: f64) -> f64 {
    let n = values.len() as f64;
    let below = values.iter().filter(|&&v| v < score).count() as f64;
    let equal = values.iter().filter(|&&v| v == score).count() as f64;
    if equal > 0.0 {
        100.0 * (below + 0.5 * (equal + 1.0)) / n
    } else {
        100.0 * below / n
    }
}
