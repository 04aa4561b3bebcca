//! Minority-class oversampling for training folds.
//!
//! SMOTE synthesises minority rows by interpolating between a minority row and one
//! of its nearest minority neighbours. Sequence layouts are flattened to one row per
//! visit first and regrouped afterwards, so the oversampled row count has to be cut
//! back to a whole number of sequences.

use crate::data::{DataSet, SampleLayout};
use crate::error::{ExperimentError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// How the oversampled visit rows are cut back before regrouping into sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Truncation {
    /// Keep the largest multiple of the visit count
    #[default]
    WholeSequences,
    /// Keep exactly this many rows; must be a multiple of the visit count
    Rows(usize),
}

/// Oversampling configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResampleConfig {
    /// Neighbours considered per minority row
    pub k_neighbors: usize,
    /// Random seed
    pub seed: u64,
    /// Row truncation for sequence layouts (ignored for flat layouts)
    pub truncation: Truncation,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            k_neighbors: 5,
            seed: 40,
            truncation: Truncation::WholeSequences,
        }
    }
}

/// Synthetic minority oversampling over visit rows
#[derive(Debug, Clone)]
pub struct Smote {
    k_neighbors: usize,
    seed: u64,
}

impl Smote {
    pub fn new(k_neighbors: usize, seed: u64) -> Self {
        Self { k_neighbors, seed }
    }

    /// Minority rows needed: each row plus its `k` neighbours
    pub fn required_minority(&self) -> usize {
        self.k_neighbors + 1
    }

    /// Balance `rows` to a 1:1 class ratio.
    ///
    /// Original rows come first, in order, followed by the synthetic minority rows.
    pub fn fit_resample(
        &self,
        rows: &Array2<f32>,
        labels: &Array1<u8>,
    ) -> Result<(Array2<f32>, Array1<u8>)> {
        if rows.nrows() != labels.len() {
            return Err(ExperimentError::shape(format!(
                "{} rows but {} labels",
                rows.nrows(),
                labels.len()
            )));
        }
        if self.k_neighbors == 0 {
            return Err(ExperimentError::config("k_neighbors must be positive"));
        }

        let positives: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == 1).collect();
        let negatives: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == 0).collect();
        let (minority, minority_label, majority_count) = if positives.len() <= negatives.len() {
            (positives, 1u8, negatives.len())
        } else {
            (negatives, 0u8, positives.len())
        };

        if minority.len() < self.required_minority() {
            return Err(ExperimentError::InsufficientMinority {
                minority: minority.len(),
                required: self.required_minority(),
            });
        }

        let n_synthetic = majority_count - minority.len();
        if n_synthetic == 0 {
            debug!("Classes already balanced, nothing to oversample");
            return Ok((rows.clone(), labels.clone()));
        }

        let neighbours = self.nearest_neighbours(rows, &minority);
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let num_features = rows.ncols();
        let mut synthetic = Array2::<f32>::zeros((n_synthetic, num_features));

        for mut out in synthetic.axis_iter_mut(Axis(0)) {
            let pick = rng.gen_range(0..minority.len());
            let neighbour = neighbours[pick][rng.gen_range(0..self.k_neighbors)];
            let gap: f32 = rng.gen();
            let base = rows.row(minority[pick]);
            let other = rows.row(minority[neighbour]);
            for ((o, &b), &n) in out.iter_mut().zip(base.iter()).zip(other.iter()) {
                *o = b + gap * (n - b);
            }
        }

        let features = ndarray::concatenate(Axis(0), &[rows.view(), synthetic.view()])
            .map_err(|e| ExperimentError::shape(e.to_string()))?;
        let mut out_labels = labels.to_vec();
        out_labels.extend(std::iter::repeat(minority_label).take(n_synthetic));

        Ok((features, Array1::from_vec(out_labels)))
    }

    /// For each minority row, positions (within `minority`) of its k nearest others
    fn nearest_neighbours(&self, rows: &Array2<f32>, minority: &[usize]) -> Vec<Vec<usize>> {
        minority
            .iter()
            .enumerate()
            .map(|(i, &row)| {
                let anchor = rows.row(row);
                let mut distances: Vec<(f32, usize)> = minority
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i)
                    .map(|(j, &other)| (squared_distance(anchor, rows.row(other)), j))
                    .collect();
                distances.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                distances.truncate(self.k_neighbors);
                distances.into_iter().map(|(_, j)| j).collect()
            })
            .collect()
    }
}

fn squared_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Rebalances one training fold in either layout
#[derive(Debug, Clone)]
pub struct ImbalanceResampler {
    smote: Smote,
    truncation: Truncation,
}

impl ImbalanceResampler {
    pub fn new(config: &ResampleConfig) -> Self {
        Self {
            smote: Smote::new(config.k_neighbors, config.seed),
            truncation: config.truncation,
        }
    }

    /// Oversample the minority outcome of a training fold.
    ///
    /// Output keeps the input's rank and trailing dimensions; only the leading
    /// sample count changes.
    pub fn resample<L: SampleLayout>(&self, train: &DataSet<L>) -> Result<DataSet<L>> {
        let visits = L::visits_per_sample(train);
        let (rows, labels) = L::to_rows(train)?;
        info!(
            "Resampling {} layout: positive={}, negative={}",
            L::LAYOUT,
            train.positive_count(),
            train.negative_count()
        );

        let (rows, labels) = self.smote.fit_resample(&rows, &labels)?;
        let keep = self.rows_to_keep(rows.nrows(), visits)?;
        if keep < rows.nrows() {
            warn!(
                "Dropping {} oversampled rows to keep sequences of {} visits",
                rows.nrows() - keep,
                visits
            );
        }
        let rows = rows.slice_axis(Axis(0), (0..keep).into()).to_owned();
        let labels = labels.slice_axis(Axis(0), (0..keep).into()).to_owned();

        let resampled = L::from_rows(rows, labels, visits)?;
        info!(
            "Resampled training fold: {} samples, positive={}, negative={}",
            resampled.len(),
            resampled.positive_count(),
            resampled.negative_count()
        );
        Ok(resampled)
    }

    fn rows_to_keep(&self, available: usize, visits: usize) -> Result<usize> {
        if visits <= 1 {
            return Ok(available);
        }
        match self.truncation {
            Truncation::WholeSequences => Ok(available - available % visits),
            Truncation::Rows(rows) => {
                if rows % visits != 0 {
                    return Err(ExperimentError::config(format!(
                        "truncation of {} rows is not a multiple of {} visits",
                        rows, visits
                    )));
                }
                if rows > available {
                    return Err(ExperimentError::config(format!(
                        "truncation of {} rows exceeds the {} oversampled rows",
                        rows, available
                    )));
                }
                Ok(rows)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3, Ix2, Ix3};

    fn imbalanced_rows(n: usize, positives: usize) -> (Array2<f32>, Array1<u8>) {
        let rows = Array2::from_shape_fn((n, 3), |(r, c)| (r as f32) * 0.5 + c as f32);
        let labels = Array1::from_shape_fn(n, |r| (r < positives) as u8);
        (rows, labels)
    }

    #[test]
    fn test_smote_balances_classes() {
        let (rows, labels) = imbalanced_rows(30, 8);
        let smote = Smote::new(5, 40);
        let (out_rows, out_labels) = smote.fit_resample(&rows, &labels).unwrap();

        assert_eq!(out_rows.nrows(), 44);
        assert_eq!(out_labels.iter().filter(|&&l| l == 1).count(), 22);
        // originals are kept in front
        assert_eq!(out_rows.slice(ndarray::s![0..30, ..]), rows);
    }

    #[test]
    fn test_synthetic_rows_lie_within_minority_hull() {
        let (rows, labels) = imbalanced_rows(30, 8);
        let (out_rows, _) = Smote::new(3, 7).fit_resample(&rows, &labels).unwrap();
        let max_minority = rows[[7, 0]];
        for row in out_rows.slice(ndarray::s![30.., ..]).rows() {
            assert!(row[0] >= 0.0 && row[0] <= max_minority);
        }
    }

    #[test]
    fn test_smote_is_deterministic_for_seed() {
        let (rows, labels) = imbalanced_rows(20, 6);
        let a = Smote::new(5, 11).fit_resample(&rows, &labels).unwrap();
        let b = Smote::new(5, 11).fit_resample(&rows, &labels).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_insufficient_minority_is_reported() {
        let (rows, labels) = imbalanced_rows(20, 3);
        let err = Smote::new(5, 40).fit_resample(&rows, &labels).unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::InsufficientMinority { minority: 3, required: 6 }
        ));
    }

    #[test]
    fn test_flat_resample_keeps_feature_width() {
        let (rows, labels) = imbalanced_rows(30, 8);
        let train = DataSet::<Ix2>::new(rows, labels).unwrap();
        let resampler = ImbalanceResampler::new(&ResampleConfig::default());
        let out = resampler.resample(&train).unwrap();
        assert_eq!(out.features.ncols(), 3);
        assert_eq!(out.positive_count(), out.negative_count());
    }

    #[test]
    fn test_sequence_resample_keeps_visit_shape() {
        // 8 patients x 5 visits, 12 positive visits
        let features = Array3::from_shape_fn((8, 5, 4), |(p, v, f)| (p * 5 + v) as f32 + f as f32 * 0.1);
        let labels = ndarray::Array2::from_shape_fn((8, 5), |(p, v)| (p * 5 + v < 12) as u8);
        let train = DataSet::<Ix3>::new(features, labels).unwrap();
        let resampler = ImbalanceResampler::new(&ResampleConfig::default());
        let out = resampler.resample(&train).unwrap();

        // 40 + 16 synthetic rows = 56, truncated to 55 = 11 sequences
        assert_eq!(out.features.dim(), (11, 5, 4));
        assert_eq!(out.labels.dim(), (11, 5));
    }

    #[test]
    fn test_explicit_truncation_must_fit_sequences() {
        let features = Array3::from_shape_fn((8, 5, 2), |(p, v, _)| (p * 5 + v) as f32);
        let labels = ndarray::Array2::from_shape_fn((8, 5), |(p, v)| (p * 5 + v < 12) as u8);
        let train = DataSet::<Ix3>::new(features, labels).unwrap();

        let config = ResampleConfig {
            truncation: Truncation::Rows(52),
            ..ResampleConfig::default()
        };
        assert!(ImbalanceResampler::new(&config).resample(&train).is_err());

        let config = ResampleConfig {
            truncation: Truncation::Rows(50),
            ..ResampleConfig::default()
        };
        let out = ImbalanceResampler::new(&config).resample(&train).unwrap();
        assert_eq!(out.features.dim(), (10, 5, 2));
    }
}
