//! One-dimensional k-means for per-feature weight clustering.

use crate::error::{ExperimentError, Result};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Clustering parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KMeansConfig {
    pub clusters: usize,
    pub max_iter: usize,
    /// Stop once no centroid moves further than this
    pub tol: f64,
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            clusters: 3,
            max_iter: 300,
            tol: 1e-4,
            seed: 0,
        }
    }
}

/// Fitted clustering of one feature
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    /// Centroids in ascending order
    pub centroids: Vec<f64>,
    /// Cluster of every input value, numbered by ascending centroid
    pub labels: Vec<u8>,
    pub iterations: usize,
}

impl KMeansFit {
    /// `[min, midpoints between neighbouring centroids..., max]`
    pub fn boundaries(&self, values: &[f32]) -> Vec<f32> {
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut boundaries = Vec::with_capacity(self.centroids.len() + 1);
        boundaries.push(min);
        for pair in self.centroids.windows(2) {
            boundaries.push(((pair[0] + pair[1]) / 2.0) as f32);
        }
        boundaries.push(max);
        boundaries
    }
}

/// Lloyd's algorithm with k-means++ seeding
pub fn kmeans_1d(values: &[f32], config: &KMeansConfig) -> Result<KMeansFit> {
    let k = config.clusters;
    if k == 0 || k > u8::MAX as usize {
        return Err(ExperimentError::config(format!("invalid cluster count {}", k)));
    }
    if values.len() < k {
        return Err(ExperimentError::shape(format!(
            "{} values cannot form {} clusters",
            values.len(),
            k
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ExperimentError::shape("k-means over non-finite values"));
    }

    let data: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut centroids = seed_centroids(&data, k, &mut rng);
    let mut assignment = vec![0usize; data.len()];
    let mut iterations = 0;

    for _ in 0..config.max_iter {
        iterations += 1;
        for (slot, &x) in assignment.iter_mut().zip(data.iter()) {
            *slot = nearest(&centroids, x);
        }

        let mut sums = vec![0.0f64; k];
        let mut counts = vec![0usize; k];
        for (&c, &x) in assignment.iter().zip(data.iter()) {
            sums[c] += x;
            counts[c] += 1;
        }
        let mut shift = 0.0f64;
        for c in 0..k {
            // empty clusters keep their centroid
            if counts[c] > 0 {
                let updated = sums[c] / counts[c] as f64;
                shift = shift.max((updated - centroids[c]).abs());
                centroids[c] = updated;
            }
        }
        if shift <= config.tol {
            break;
        }
    }
    for (slot, &x) in assignment.iter_mut().zip(data.iter()) {
        *slot = nearest(&centroids, x);
    }

    // renumber by ascending centroid
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| centroids[a].total_cmp(&centroids[b]).then(a.cmp(&b)));
    let mut rank = vec![0u8; k];
    for (r, &c) in order.iter().enumerate() {
        rank[c] = r as u8;
    }

    Ok(KMeansFit {
        centroids: order.iter().map(|&c| centroids[c]).collect(),
        labels: assignment.iter().map(|&c| rank[c]).collect(),
        iterations,
    })
}

fn seed_centroids(data: &[f64], k: usize, rng: &mut ChaCha8Rng) -> Vec<f64> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(data[rng.gen_range(0..data.len())]);
    let mut distances = vec![0.0f64; data.len()];

    while centroids.len() < k {
        for (d, &x) in distances.iter_mut().zip(data.iter()) {
            let c = centroids[nearest(&centroids, x)];
            *d = (x - c) * (x - c);
        }
        let total: f64 = distances.iter().sum();
        if total <= 0.0 {
            // every value coincides with a centroid already
            centroids.push(centroids[centroids.len() - 1]);
            continue;
        }
        let mut target = rng.gen::<f64>() * total;
        let mut chosen = data.len() - 1;
        for (i, &d) in distances.iter().enumerate() {
            if target < d {
                chosen = i;
                break;
            }
            target -= d;
        }
        centroids.push(data[chosen]);
    }
    centroids
}

fn nearest(centroids: &[f64], x: f64) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (c, &centroid) in centroids.iter().enumerate() {
        let distance = (x - centroid).abs();
        if distance < best_distance {
            best_distance = distance;
            best = c;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn three_groups() -> Vec<f32> {
        vec![0.1, 5.0, 0.12, 9.0, 5.1, 0.11, 9.2, 4.9, 9.1]
    }

    #[test]
    fn test_labels_follow_centroid_order() {
        let fit = kmeans_1d(&three_groups(), &KMeansConfig::default()).unwrap();
        assert_eq!(fit.labels, vec![0, 1, 0, 2, 1, 0, 2, 1, 2]);
        assert!(fit.centroids.windows(2).all(|w| w[0] < w[1]));
        assert_abs_diff_eq!(fit.centroids[1], 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_seeded_runs_agree() {
        let values: Vec<f32> = (0..200).map(|i| ((i * 13) % 97) as f32 / 97.0).collect();
        let config = KMeansConfig {
            seed: 17,
            ..Default::default()
        };
        assert_eq!(kmeans_1d(&values, &config).unwrap(), kmeans_1d(&values, &config).unwrap());
    }

    #[test]
    fn test_boundaries_are_midpoints() {
        let values = three_groups();
        let fit = kmeans_1d(&values, &KMeansConfig::default()).unwrap();
        let boundaries = fit.boundaries(&values);
        assert_eq!(boundaries.len(), 4);
        assert_eq!(boundaries[0], 0.1);
        assert_eq!(boundaries[3], 9.2);
        assert!(boundaries[1] > 0.12 && boundaries[1] < 4.9);
        assert!(boundaries[2] > 5.1 && boundaries[2] < 9.0);
    }

    #[test]
    fn test_constant_values() {
        let fit = kmeans_1d(&[2.0; 6], &KMeansConfig::default()).unwrap();
        assert!(fit.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_too_few_values() {
        assert!(kmeans_1d(&[1.0, 2.0], &KMeansConfig::default()).is_err());
    }
}
