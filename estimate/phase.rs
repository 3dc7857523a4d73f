//! Piecewise-linear phase basis of the maximum-light model.
//!
//! The phase window `[-phase_range, +phase_range]` is split into
//! `num_coefficients` bins, half on each side of maximum light. A spectrum at
//! phase `p` gets unit weight on every bin between maximum and `p`, and a
//! fractional weight on the bin containing `p`, so the dispersion grows
//! linearly away from maximum and is exactly zero at `p = 0`.

use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PhaseBasisError {
    #[error("Must have an even number of phase coefficients, but {0} were requested.")]
    OddCoefficientCount(usize),
    #[error("The phase range must be strictly positive, but was {0}.")]
    NonPositiveRange(f64),
}

/// Weights of one spectrum on each of the phase bins.
pub fn phase_weights(
    phase: f64,
    phase_range: f64,
    num_coefficients: usize,
) -> Result<Vec<f64>, PhaseBasisError> {
    check(phase_range, num_coefficients)?;
    let mut weights = vec![0.0; num_coefficients];
    let half = num_coefficients / 2;

    let scale = (half as f64 * phase / phase_range).abs();
    let full_bins = scale.floor() as usize;
    let remainder = scale - full_bins as f64;

    for j in 0..=full_bins {
        let weight = if j == full_bins { remainder } else { 1.0 };
        let index = if phase > 0.0 {
            half + j
        } else {
            // Bins left of maximum count down from `half - 1`.
            match (half - 1).checked_sub(j) {
                Some(index) => index,
                None => continue,
            }
        };
        if index < num_coefficients {
            weights[index] = weight;
        }
    }
    Ok(weights)
}

/// Stacks the weights of several phases into a `(phases, coefficients)` matrix.
pub fn phase_coefficient_matrix(
    phases: &[f64],
    phase_range: f64,
    num_coefficients: usize,
) -> Result<Array2<f64>, PhaseBasisError> {
    check(phase_range, num_coefficients)?;
    let mut matrix = Array2::zeros((phases.len(), num_coefficients));
    for (row, &phase) in phases.iter().enumerate() {
        for (col, weight) in phase_weights(phase, phase_range, num_coefficients)?
            .into_iter()
            .enumerate()
        {
            matrix[[row, col]] = weight;
        }
    }
    Ok(matrix)
}

fn check(phase_range: f64, num_coefficients: usize) -> Result<(), PhaseBasisError> {
    if num_coefficients % 2 != 0 || num_coefficients == 0 {
        return Err(PhaseBasisError::OddCoefficientCount(num_coefficients));
    }
    if !(phase_range > 0.0) {
        return Err(PhaseBasisError::NonPositiveRange(phase_range));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn maximum_light_has_zero_weight() {
        let weights = phase_weights(0.0, 5.0, 4).unwrap();
        assert!(weights.iter().all(|&w| w == 0.0));
    }

    #[test]
    fn weights_accumulate_away_from_maximum() {
        // Half-bin width is 2.5 days with four coefficients over ±5 days.
        let late = phase_weights(3.0, 5.0, 4).unwrap();
        assert_abs_diff_eq!(late[2], 1.0);
        assert_abs_diff_eq!(late[3], 0.2, epsilon = 1e-12);
        assert_eq!(late[0], 0.0);
        assert_eq!(late[1], 0.0);

        let early = phase_weights(-1.0, 5.0, 4).unwrap();
        assert_abs_diff_eq!(early[1], 0.4, epsilon = 1e-12);
        assert_eq!(early[0], 0.0);
        assert_eq!(early[2], 0.0);
    }

    #[test]
    fn edge_of_window_saturates() {
        let edge = phase_weights(5.0, 5.0, 4).unwrap();
        assert_eq!(edge, vec![0.0, 0.0, 1.0, 1.0]);
        let early_edge = phase_weights(-5.0, 5.0, 4).unwrap();
        assert_eq!(early_edge, vec![1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn odd_counts_are_rejected() {
        assert_eq!(
            phase_coefficient_matrix(&[0.0], 5.0, 3),
            Err(PhaseBasisError::OddCoefficientCount(3))
        );
    }

    #[test]
    fn matrix_rows_match_single_weights() {
        let phases = [-4.0, -0.5, 2.0];
        let matrix = phase_coefficient_matrix(&phases, 5.0, 6).unwrap();
        for (row, &phase) in phases.iter().enumerate() {
            let weights = phase_weights(phase, 5.0, 6).unwrap();
            for (col, w) in weights.iter().enumerate() {
                assert_eq!(matrix[[row, col]], *w);
            }
        }
    }
}
