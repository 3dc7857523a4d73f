//! # Twins Manifold Embedding
//!
//! Isomap of the fractional residual spectra: a symmetric k-nearest-neighbor
//! graph approximates the manifold, shortest paths through it approximate
//! geodesic distances, and classical multidimensional scaling of those
//! distances yields the low-dimensional coordinates.
//!
//! The procedure is fully deterministic. Neighbor ties resolve by index and
//! each eigenvector's sign is fixed so that its largest-magnitude entry is
//! positive.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{Eigh, UPLO};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Cannot embed {points} points into {components} components.")]
    TooFewPoints { points: usize, components: usize },

    #[error(
        "The {neighbors}-nearest-neighbor graph is disconnected; increase the number of neighbors."
    )]
    DisconnectedGraph { neighbors: usize },

    #[error("Residual spectra contain non-finite values in row {0}.")]
    NonFiniteInput(usize),

    #[error("Eigendecomposition failed: {0}")]
    EigendecompositionFailed(#[from] ndarray_linalg::error::LinalgError),

    #[error("Mask has {mask} entries but there are {rows} residual spectra.")]
    MaskLengthMismatch { mask: usize, rows: usize },
}

/// `scaled_flux / mean_flux − 1` for every target.
pub fn fractional_residuals(scaled_flux: &Array2<f64>, mean_flux: &Array1<f64>) -> Array2<f64> {
    scaled_flux / &mean_flux.view().insert_axis(Axis(0)) - 1.0
}

/// Embeds the rows selected by `mask`. Unselected rows are NaN.
pub fn embed_masked(
    residuals: &Array2<f64>,
    mask: &[bool],
    num_neighbors: usize,
    num_components: usize,
) -> Result<Array2<f64>, EmbeddingError> {
    if mask.len() != residuals.nrows() {
        return Err(EmbeddingError::MaskLengthMismatch {
            mask: mask.len(),
            rows: residuals.nrows(),
        });
    }
    let selected: Vec<usize> = (0..mask.len()).filter(|&i| mask[i]).collect();
    let subset = residuals.select(Axis(0), &selected);
    let coordinates = isomap(&subset, num_neighbors, num_components)?;

    let mut embedding = Array2::from_elem((residuals.nrows(), num_components), f64::NAN);
    for (row, &target) in selected.iter().enumerate() {
        embedding.row_mut(target).assign(&coordinates.row(row));
    }
    Ok(embedding)
}

/// Isomap embedding of the rows of `points`.
pub fn isomap(
    points: &Array2<f64>,
    num_neighbors: usize,
    num_components: usize,
) -> Result<Array2<f64>, EmbeddingError> {
    let n = points.nrows();
    if n < 2 || num_components > n {
        return Err(EmbeddingError::TooFewPoints {
            points: n,
            components: num_components,
        });
    }
    if let Some(row) = (0..n).find(|&i| points.row(i).iter().any(|v| !v.is_finite())) {
        return Err(EmbeddingError::NonFiniteInput(row));
    }

    let neighbors = num_neighbors.min(n - 1);
    let graph = neighbor_graph(points, neighbors);
    let geodesic = all_pairs_shortest_paths(&graph);
    if geodesic.iter().any(|d| !d.is_finite()) {
        return Err(EmbeddingError::DisconnectedGraph { neighbors });
    }
    log::debug!("Isomap: {n} points, {neighbors} neighbors, {num_components} components");

    classical_mds(&geodesic, num_components)
}

fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Adjacency lists of the symmetrized k-nearest-neighbor graph.
fn neighbor_graph(points: &Array2<f64>, k: usize) -> Vec<Vec<(usize, f64)>> {
    let n = points.nrows();
    let mut adjacency = vec![Vec::new(); n];
    for i in 0..n {
        let mut distances: Vec<(usize, f64)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| (j, euclidean(points.row(i), points.row(j))))
            .collect();
        distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        for &(j, d) in distances.iter().take(k) {
            adjacency[i].push((j, d));
            adjacency[j].push((i, d));
        }
    }
    adjacency
}

/// Heap entry ordered by distance.
#[derive(PartialEq)]
struct Candidate(f64, usize);

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0).then(self.1.cmp(&other.1))
    }
}

/// Dijkstra from every node.
fn all_pairs_shortest_paths(adjacency: &[Vec<(usize, f64)>]) -> Array2<f64> {
    let n = adjacency.len();
    let mut distances = Array2::from_elem((n, n), f64::INFINITY);
    for source in 0..n {
        let mut row = distances.row_mut(source);
        row[source] = 0.0;
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(Candidate(0.0, source)));
        while let Some(Reverse(Candidate(distance, node))) = heap.pop() {
            if distance > row[node] {
                continue;
            }
            for &(next, weight) in &adjacency[node] {
                let candidate = distance + weight;
                if candidate < row[next] {
                    row[next] = candidate;
                    heap.push(Reverse(Candidate(candidate, next)));
                }
            }
        }
    }
    distances
}

/// Classical MDS of a distance matrix.
fn classical_mds(distances: &Array2<f64>, num_components: usize) -> Result<Array2<f64>, EmbeddingError> {
    let n = distances.nrows();
    let squared = distances.mapv(|d| d * d);
    let row_means = squared.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(n));
    let grand_mean = row_means.mean().unwrap_or(0.0);
    let kernel = Array2::from_shape_fn((n, n), |(i, j)| {
        -0.5 * (squared[[i, j]] - row_means[i] - row_means[j] + grand_mean)
    });

    let (eigenvalues, eigenvectors) = kernel.eigh(UPLO::Lower)?;

    // Eigenvalues come back in ascending order.
    let mut coordinates = Array2::zeros((n, num_components));
    for component in 0..num_components {
        let index = n - 1 - component;
        let eigenvalue = eigenvalues[index];
        let mut vector = eigenvectors.column(index).to_owned();
        let pivot = vector
            .iter()
            .copied()
            .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            vector.mapv_inplace(|v| -v);
        }
        let scale = if eigenvalue > 0.0 { eigenvalue.sqrt() } else { 0.0 };
        coordinates.column_mut(component).assign(&(vector * scale));
    }
    Ok(coordinates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Points along a straight line embedded in four dimensions.
    fn line(positions: &[f64]) -> Array2<f64> {
        let direction = array![0.5, -0.5, 0.5, 0.5];
        Array2::from_shape_fn((positions.len(), 4), |(i, j)| positions[i] * direction[j])
    }

    #[test]
    fn recovers_distances_along_a_line() {
        let positions = [0.0, 1.0, 2.5, 3.0, 4.5, 6.0];
        let embedding = isomap(&line(&positions), 2, 1).unwrap();
        for i in 0..positions.len() {
            for j in 0..positions.len() {
                assert_abs_diff_eq!(
                    (embedding[[i, 0]] - embedding[[j, 0]]).abs(),
                    (positions[i] - positions[j]).abs(),
                    epsilon = 1e-8
                );
            }
        }
    }

    #[test]
    fn geodesics_follow_the_graph() {
        // Three points on an L: the geodesic between the ends runs through
        // the corner.
        let points = array![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]];
        let graph = neighbor_graph(&points, 1);
        let geodesic = all_pairs_shortest_paths(&graph);
        assert_abs_diff_eq!(geodesic[[0, 2]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(geodesic[[2, 0]], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn embedding_is_deterministic_with_fixed_signs() {
        let points = array![
            [0.1, 0.2, 0.0],
            [0.3, -0.1, 0.2],
            [-0.2, 0.4, 0.1],
            [0.0, 0.0, -0.3],
            [0.5, 0.2, 0.2]
        ];
        let first = isomap(&points, 3, 2).unwrap();
        let second = isomap(&points, 3, 2).unwrap();
        assert_eq!(first, second);
        for column in first.columns() {
            let pivot = column
                .iter()
                .copied()
                .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
            assert!(pivot >= 0.0);
        }
    }

    #[test]
    fn disconnected_clusters_are_an_error() {
        let points = array![[0.0, 0.0], [0.1, 0.0], [10.0, 10.0], [10.1, 10.0]];
        assert!(matches!(
            isomap(&points, 1, 1),
            Err(EmbeddingError::DisconnectedGraph { neighbors: 1 })
        ));
    }

    #[test]
    fn masked_rows_are_missing() {
        let points = line(&[0.0, 1.0, 2.0, 3.0]);
        let embedding = embed_masked(&points, &[true, false, true, true], 2, 1).unwrap();
        assert!(embedding[[1, 0]].is_nan());
        assert!(embedding[[0, 0]].is_finite());
        assert_abs_diff_eq!(
            (embedding[[3, 0]] - embedding[[0, 0]]).abs(),
            3.0,
            epsilon = 1e-8
        );
    }

    #[test]
    fn residuals_are_relative_to_the_mean() {
        let residuals = fractional_residuals(&array![[2.0, 3.0], [1.0, 6.0]], &array![2.0, 3.0]);
        assert_eq!(residuals, array![[0.0, 0.0], [-0.5, 1.0]]);
    }
}
