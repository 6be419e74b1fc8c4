//! A PAM-style k-medoids implementation over squared-Euclidean distances.
//!
//! The feature matrix is small (a few hundred rows of a few dozen columns), so distances are
//! computed up front and the swap phase runs to a fixed point.
use anyhow::{Result, ensure};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;

/// The RNG seed used for medoid initialisation, fixed for reproducibility
pub const MEDOID_SEED: u64 = 42;

/// Cap on swap passes; in practice PAM settles in a handful
const MAX_SWAP_PASSES: usize = 100;

/// The outcome of a k-medoids run
#[derive(Debug, Clone, PartialEq)]
pub struct Medoids {
    /// Row indices of the medoids in the feature matrix
    pub medoids: Vec<usize>,
    /// For each row, the position in `medoids` of its cluster
    pub assignment: Vec<usize>,
}

impl Medoids {
    /// The number of rows assigned to each medoid
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.medoids.len()];
        for &cluster in &self.assignment {
            sizes[cluster] += 1;
        }
        sizes
    }

    /// Distance of each row to its own medoid
    pub fn distances_to_medoid(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        self.assignment
            .iter()
            .enumerate()
            .map(|(row, &cluster)| squared_distance(&rows[row], &rows[self.medoids[cluster]]))
            .collect()
    }
}

/// Squared Euclidean distance between two feature rows
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Run PAM k-medoids on the given feature rows.
///
/// Fails when there are fewer rows than requested clusters.
pub fn k_medoids(rows: &[Vec<f64>], k: usize) -> Result<Medoids> {
    ensure!(k >= 1, "Cluster count must be at least 1");
    ensure!(
        rows.len() >= k,
        "Cannot form {k} clusters from {} candidate days",
        rows.len()
    );

    // Deterministic initialisation
    let mut rng = StdRng::seed_from_u64(MEDOID_SEED);
    let mut medoids: Vec<usize> = sample(&mut rng, rows.len(), k).into_iter().collect();
    medoids.sort_unstable();

    let mut cost = total_cost(rows, &medoids);
    for _ in 0..MAX_SWAP_PASSES {
        let mut improved = false;

        for position in 0..medoids.len() {
            let current = medoids[position];
            let mut best = (current, cost);
            for candidate in 0..rows.len() {
                if medoids.contains(&candidate) {
                    continue;
                }
                medoids[position] = candidate;
                let candidate_cost = total_cost(rows, &medoids);
                if candidate_cost < best.1 {
                    best = (candidate, candidate_cost);
                }
            }
            medoids[position] = best.0;
            if best.0 != current {
                cost = best.1;
                improved = true;
            }
        }

        if !improved {
            break;
        }
    }

    medoids.sort_unstable();
    let assignment = assign(rows, &medoids);
    Ok(Medoids {
        medoids,
        assignment,
    })
}

/// Assign each row to its nearest medoid
fn assign(rows: &[Vec<f64>], medoids: &[usize]) -> Vec<usize> {
    rows.iter()
        .map(|row| {
            medoids
                .iter()
                .enumerate()
                .map(|(cluster, &medoid)| (cluster, squared_distance(row, &rows[medoid])))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .expect("At least one medoid")
                .0
        })
        .collect()
}

/// Total within-cluster cost for a medoid set
fn total_cost(rows: &[Vec<f64>], medoids: &[usize]) -> f64 {
    rows.iter()
        .map(|row| {
            medoids
                .iter()
                .map(|&medoid| squared_distance(row, &rows[medoid]))
                .min_by(f64::total_cmp)
                .expect("At least one medoid")
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    /// Two well-separated blobs
    fn blob_rows() -> Vec<Vec<f64>> {
        vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![1.0, 1.0],
            vec![0.9, 1.0],
            vec![1.0, 0.9],
        ]
    }

    #[test]
    fn test_two_blobs() {
        let rows = blob_rows();
        let result = k_medoids(&rows, 2).unwrap();

        // One medoid per blob, each row assigned with its blob
        assert_eq!(result.medoids.len(), 2);
        assert_eq!(result.assignment[0], result.assignment[1]);
        assert_eq!(result.assignment[0], result.assignment[2]);
        assert_eq!(result.assignment[3], result.assignment[4]);
        assert_ne!(result.assignment[0], result.assignment[3]);
        assert_eq!(result.cluster_sizes(), vec![3, 3]);
    }

    #[test]
    fn test_too_few_rows() {
        let rows = vec![vec![0.0], vec![1.0]];
        assert!(k_medoids(&rows, 3).is_err());
    }

    #[test]
    fn test_deterministic() {
        let rows = blob_rows();
        let first = k_medoids(&rows, 2).unwrap();
        let second = k_medoids(&rows, 2).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_squared_distance() {
        assert_approx_eq!(
            f64,
            squared_distance(&[0.0, 3.0], &[4.0, 0.0]),
            25.0
        );
    }

    #[test]
    fn test_distances_to_medoid_zero_for_medoids() {
        let rows = blob_rows();
        let result = k_medoids(&rows, 2).unwrap();
        let distances = result.distances_to_medoid(&rows);
        for &medoid in &result.medoids {
            assert_approx_eq!(f64, distances[medoid], 0.0);
        }
    }
}
