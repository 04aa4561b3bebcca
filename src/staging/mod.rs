//! Attention-weight staging.
//!
//! Per-feature boundaries split every feature's weights into `K` bins. A visit's
//! stage is the bin holding the largest share of its summed attention, ties going
//! to the lower bin. Outcome rates, mean weight profiles and feature rankings are
//! then reported per stage.

pub mod jenks;
pub mod kmeans;
pub mod pipeline;

use crate::error::{ExperimentError, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use self::jenks::jenks_breaks;
use self::kmeans::{kmeans_1d, KMeansConfig};

/// Bin marker for a weight above the last boundary of its feature
pub const UNBINNED: u8 = u8::MAX;

/// Staging parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Natural-breaks classes per feature
    pub classes: usize,
    /// k-means clusters per feature
    pub clusters: usize,
    pub kmeans_seed: u64,
    pub kmeans_max_iter: usize,
    pub kmeans_tol: f64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            classes: 5,
            clusters: 3,
            kmeans_seed: 0,
            kmeans_max_iter: 300,
            kmeans_tol: 1e-4,
        }
    }
}

impl StagingConfig {
    pub fn kmeans(&self) -> KMeansConfig {
        KMeansConfig {
            clusters: self.clusters,
            max_iter: self.kmeans_max_iter,
            tol: self.kmeans_tol,
            seed: self.kmeans_seed,
        }
    }
}

/// Per-feature bin boundaries `[features, K + 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointTable {
    breaks: Array2<f32>,
}

impl BreakpointTable {
    /// Wrap boundaries, checking every row is non-decreasing
    pub fn new(breaks: Array2<f32>) -> Result<Self> {
        if breaks.ncols() < 2 {
            return Err(ExperimentError::shape("a breakpoint row needs at least two boundaries"));
        }
        if breaks.ncols() - 1 > UNBINNED as usize {
            return Err(ExperimentError::config(format!("too many bins: {}", breaks.ncols() - 1)));
        }
        for (feature, row) in breaks.rows().into_iter().enumerate() {
            if row.iter().any(|b| b.is_nan()) || row.iter().zip(row.iter().skip(1)).any(|(a, b)| a > b) {
                return Err(ExperimentError::shape(format!(
                    "boundaries of feature {} are not non-decreasing",
                    feature
                )));
            }
        }
        Ok(Self { breaks })
    }

    pub fn num_features(&self) -> usize {
        self.breaks.nrows()
    }

    /// Number of bins `K`
    pub fn classes(&self) -> usize {
        self.breaks.ncols() - 1
    }

    pub fn breaks(&self) -> &Array2<f32> {
        &self.breaks
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.breaks
    }

    /// Bin of `weight` for `feature`.
    ///
    /// Bin 0 is `w < b1`, bin j is `b_j <= w < b_{j+1}` and the last bin is closed,
    /// `b_{K-1} <= w <= b_K`. Values above `b_K` fall in no bin.
    pub fn bin(&self, feature: usize, weight: f32) -> Option<usize> {
        let row = self.breaks.row(feature);
        let k = row.len() - 1;
        if weight > row[k] || weight.is_nan() {
            return None;
        }
        // first interior boundary strictly above the weight
        (1..k).find(|&j| weight < row[j]).map(|j| j - 1).or(Some(k - 1))
    }
}

/// Natural-breaks table over each feature's full weight distribution
pub fn compute_breakpoints(weights: &Array3<f32>, classes: usize) -> Result<BreakpointTable> {
    let rows = feature_columns(weights);
    let mut breaks = Array2::<f32>::zeros((rows.ncols(), classes + 1));
    for (feature, column) in rows.columns().into_iter().enumerate() {
        let values: Vec<f32> = column.to_vec();
        let feature_breaks = jenks_breaks(&values, classes)?;
        breaks.row_mut(feature).assign(&Array1::from(feature_breaks));
    }
    info!("Computed {} natural breaks for {} features", classes, rows.ncols());
    BreakpointTable::new(breaks)
}

/// Per-feature k-means clustering of attention weights
#[derive(Debug, Clone, PartialEq)]
pub struct WeightClusters {
    /// Cluster label per weight `[patients, visits, features]`
    pub labels: Array3<u8>,
    /// Ascending centroids `[features, clusters]`
    pub centroids: Array2<f32>,
    /// Boundaries at centroid midpoints
    pub breakpoints: BreakpointTable,
}

/// Replace every weight by its feature's k-means cluster label
pub fn cluster_weights(weights: &Array3<f32>, config: &KMeansConfig) -> Result<WeightClusters> {
    let (patients, visits, num_features) = weights.dim();
    let rows = feature_columns(weights);
    let mut labels = Array2::<u8>::zeros((patients * visits, num_features));
    let mut centroids = Array2::<f32>::zeros((num_features, config.clusters));
    let mut breaks = Array2::<f32>::zeros((num_features, config.clusters + 1));

    for feature in 0..num_features {
        let values = rows.column(feature).to_vec();
        let fit = kmeans_1d(&values, config)?;
        labels
            .column_mut(feature)
            .assign(&Array1::from(fit.labels.clone()));
        centroids
            .row_mut(feature)
            .assign(&fit.centroids.iter().map(|&c| c as f32).collect::<Array1<f32>>());
        breaks.row_mut(feature).assign(&Array1::from(fit.boundaries(&values)));
    }

    let labels = labels
        .into_shape_with_order((patients, visits, num_features))
        .map_err(|e| ExperimentError::shape(e.to_string()))?;
    info!("Clustered {} features into {} groups", num_features, config.clusters);
    Ok(WeightClusters {
        labels,
        centroids,
        breakpoints: BreakpointTable::new(breaks)?,
    })
}

/// Bin of every weight under `table`, [`UNBINNED`] when above the last boundary
pub fn bin_weights(weights: &Array3<f32>, table: &BreakpointTable) -> Result<Array3<u8>> {
    check_features(weights, table.num_features())?;
    let mut bins = Array3::<u8>::from_elem(weights.dim(), UNBINNED);
    for ((p, v, feature), &w) in weights.indexed_iter() {
        if let Some(b) = table.bin(feature, w) {
            bins[[p, v, feature]] = b as u8;
        }
    }
    Ok(bins)
}

/// Stage of every visit plus the per-bin scores it was chosen from
#[derive(Debug, Clone, PartialEq)]
pub struct StageAssignment {
    /// `[patients, visits]`, values in `[0, K)`
    pub stages: Array2<u8>,
    /// Summed weight per bin `[patients, visits, K]`
    pub scores: Array3<f32>,
}

/// Assign stages from explicit per-weight bins (breakpoint bins or cluster labels)
pub fn assign_from_bins(weights: &Array3<f32>, bins: &Array3<u8>, classes: usize) -> Result<StageAssignment> {
    if weights.dim() != bins.dim() {
        return Err(ExperimentError::shape(format!(
            "bins {:?} do not match weights {:?}",
            bins.shape(),
            weights.shape()
        )));
    }
    if classes == 0 {
        return Err(ExperimentError::config("staging needs at least one class"));
    }
    let (patients, visits, _) = weights.dim();
    let mut scores = Array3::<f32>::zeros((patients, visits, classes));
    let mut stages = Array2::<u8>::zeros((patients, visits));
    let mut unbinned_visits = 0usize;

    for p in 0..patients {
        for v in 0..visits {
            let mut visit_scores = scores.slice_mut(ndarray::s![p, v, ..]);
            let mut binned = false;
            for (&w, &b) in weights.slice(ndarray::s![p, v, ..]).iter().zip(bins.slice(ndarray::s![p, v, ..]).iter()) {
                if b == UNBINNED {
                    continue;
                }
                let b = b as usize;
                if b >= classes {
                    return Err(ExperimentError::shape(format!("bin {} outside {} classes", b, classes)));
                }
                visit_scores[b] += w;
                binned = true;
            }
            if !binned {
                unbinned_visits += 1;
            }
            stages[[p, v]] = stable_argmax(visit_scores.view()) as u8;
        }
    }
    if unbinned_visits > 0 {
        warn!("{} visits had no binned weight and default to stage 0", unbinned_visits);
    }
    Ok(StageAssignment { stages, scores })
}

/// Breakpoint staging: bin every weight, then pick each visit's dominant bin
pub fn assign_stages(weights: &Array3<f32>, table: &BreakpointTable) -> Result<StageAssignment> {
    let bins = bin_weights(weights, table)?;
    assign_from_bins(weights, &bins, table.classes())
}

fn stable_argmax(values: ArrayView1<f32>) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Event rate of one stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRate {
    Rate(f64),
    NoSamples,
}

impl StageRate {
    pub fn value(&self) -> Option<f64> {
        match self {
            StageRate::Rate(r) => Some(*r),
            StageRate::NoSamples => None,
        }
    }
}

impl std::fmt::Display for StageRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageRate::Rate(r) => write!(f, "{:.6}", r),
            StageRate::NoSamples => f.write_str("no samples"),
        }
    }
}

/// Outcome summary of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: usize,
    pub samples: usize,
    pub events: usize,
    pub rate: StageRate,
    /// Mean weight per feature, absent for an empty stage
    pub profile: Option<Vec<f32>>,
    /// Feature indices by ascending mean weight
    pub importance: Option<Vec<usize>>,
}

/// Per-stage outcome report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stages: Vec<StageSummary>,
}

impl StageReport {
    pub fn rates(&self) -> Vec<StageRate> {
        self.stages.iter().map(|s| s.rate).collect()
    }
}

/// Event rates, weight profiles and feature rankings per stage
pub fn stage_outcomes(
    stages: &Array2<u8>,
    labels: &Array2<u8>,
    weights: &Array3<f32>,
    classes: usize,
) -> Result<StageReport> {
    let (patients, visits, num_features) = weights.dim();
    if stages.dim() != (patients, visits) || labels.dim() != (patients, visits) {
        return Err(ExperimentError::shape(format!(
            "stages {:?} and labels {:?} must match weights {:?}",
            stages.shape(),
            labels.shape(),
            weights.shape()
        )));
    }

    let mut samples = vec![0usize; classes];
    let mut events = vec![0usize; classes];
    let mut sums = Array2::<f64>::zeros((classes, num_features));
    for ((p, v), &stage) in stages.indexed_iter() {
        let stage = stage as usize;
        if stage >= classes {
            return Err(ExperimentError::shape(format!("stage {} outside {} classes", stage, classes)));
        }
        samples[stage] += 1;
        events[stage] += (labels[[p, v]] == 1) as usize;
        for (sum, &w) in sums.row_mut(stage).iter_mut().zip(weights.slice(ndarray::s![p, v, ..]).iter()) {
            *sum += w as f64;
        }
    }

    let summaries = (0..classes)
        .map(|stage| {
            if samples[stage] == 0 {
                return StageSummary {
                    stage,
                    samples: 0,
                    events: 0,
                    rate: StageRate::NoSamples,
                    profile: None,
                    importance: None,
                };
            }
            let profile: Vec<f32> = sums
                .row(stage)
                .iter()
                .map(|&s| (s / samples[stage] as f64) as f32)
                .collect();
            let mut importance: Vec<usize> = (0..num_features).collect();
            importance.sort_by(|&a, &b| profile[a].total_cmp(&profile[b]).then(a.cmp(&b)));
            StageSummary {
                stage,
                samples: samples[stage],
                events: events[stage],
                rate: StageRate::Rate(events[stage] as f64 / samples[stage] as f64),
                profile: Some(profile),
                importance: Some(importance),
            }
        })
        .collect::<Vec<_>>();

    for summary in &summaries {
        info!(
            "Stage {}: {} visits, event rate {}",
            summary.stage, summary.samples, summary.rate
        );
    }
    Ok(StageReport { stages: summaries })
}

/// `[patients * visits, features]` copy of the weights
fn feature_columns(weights: &Array3<f32>) -> Array2<f32> {
    let (patients, visits, num_features) = weights.dim();
    Array2::from_shape_fn((patients * visits, num_features), |(r, f)| {
        weights[[r / visits, r % visits, f]]
    })
}

fn check_features(weights: &Array3<f32>, expected: usize) -> Result<()> {
    if weights.len_of(Axis(2)) != expected {
        return Err(ExperimentError::shape(format!(
            "weights have {} features, breakpoints cover {}",
            weights.len_of(Axis(2)),
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn toy_table() -> BreakpointTable {
        BreakpointTable::new(array![[0.0, 0.2, 0.5, 1.0], [0.0, 0.3, 0.6, 1.0]]).unwrap()
    }

    /// 2 patients x 3 visits x 2 features
    fn toy_weights() -> Array3<f32> {
        Array3::from_shape_vec(
            (2, 3, 2),
            vec![
                0.1, 0.7, 0.3, 0.4, 0.15, 0.1, //
                0.6, 0.2, 0.25, 0.35, 0.45, 0.05,
            ],
        )
        .unwrap()
    }

    fn toy_labels() -> Array2<u8> {
        array![[1, 0, 0], [1, 1, 0]]
    }

    #[test]
    fn test_bin_rules() {
        let table = toy_table();
        assert_eq!(table.classes(), 3);
        assert_eq!(table.bin(0, 0.19), Some(0));
        assert_eq!(table.bin(0, 0.2), Some(1));
        assert_eq!(table.bin(0, 0.5), Some(2));
        assert_eq!(table.bin(0, 1.0), Some(2));
        assert_eq!(table.bin(0, 1.01), None);
        assert_eq!(table.bin(0, -0.5), Some(0));
    }

    #[test]
    fn test_decreasing_boundaries_rejected() {
        assert!(BreakpointTable::new(array![[0.0, 0.5, 0.4]]).is_err());
        assert!(BreakpointTable::new(array![[0.0, 0.4, 0.4]]).is_ok());
    }

    #[test]
    fn test_toy_stage_assignment_and_rates() {
        let weights = toy_weights();
        let assignment = assign_stages(&weights, &toy_table()).unwrap();
        assert_eq!(assignment.stages, array![[2, 1, 0], [2, 1, 1]]);
        assert_abs_diff_eq!(assignment.scores[[1, 2, 1]], 0.45, epsilon = 1e-6);

        let report = stage_outcomes(&assignment.stages, &toy_labels(), &weights, 3).unwrap();
        assert_eq!(
            report.rates(),
            vec![StageRate::Rate(0.0), StageRate::Rate(1.0 / 3.0), StageRate::Rate(1.0)]
        );
        assert_eq!(report.stages[1].samples, 3);
        assert_eq!(report.stages[1].events, 1);

        let profile = report.stages[2].profile.as_ref().unwrap();
        assert_abs_diff_eq!(profile[0], 0.35, epsilon = 1e-6);
        assert_abs_diff_eq!(profile[1], 0.45, epsilon = 1e-6);
        assert_eq!(report.stages[2].importance, Some(vec![0, 1]));
        assert_eq!(report.stages[1].importance, Some(vec![1, 0]));
    }

    #[test]
    fn test_staging_is_deterministic() {
        let weights = toy_weights();
        let first = assign_stages(&weights, &toy_table()).unwrap();
        let second = assign_stages(&weights, &toy_table()).unwrap();
        assert_eq!(first, second);
        let a = stage_outcomes(&first.stages, &toy_labels(), &weights, 3).unwrap();
        let b = stage_outcomes(&second.stages, &toy_labels(), &weights, 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_stage_reports_no_samples() {
        // the top bin [0.9, 1.0] is never reached
        let table = BreakpointTable::new(array![[0.0, 0.2, 0.5, 0.9, 1.0], [0.0, 0.3, 0.6, 0.9, 1.0]]).unwrap();
        let weights = toy_weights();
        let assignment = assign_stages(&weights, &table).unwrap();
        let report = stage_outcomes(&assignment.stages, &toy_labels(), &weights, 4).unwrap();

        assert_eq!(report.stages[3].rate, StageRate::NoSamples);
        assert_eq!(report.stages[3].profile, None);
        assert_eq!(report.stages[3].rate.to_string(), "no samples");
    }

    #[test]
    fn test_ties_go_to_lower_bin() {
        let table = BreakpointTable::new(array![[0.0, 0.5, 1.0], [0.0, 0.5, 1.0]]).unwrap();
        let weights = Array3::from_shape_vec((1, 1, 2), vec![0.25, 0.75]).unwrap();
        // bin 0 holds 0.25, bin 1 holds 0.75
        assert_eq!(assign_stages(&weights, &table).unwrap().stages[[0, 0]], 1);

        let bins = Array3::from_shape_vec((1, 1, 2), vec![1u8, 0]).unwrap();
        let weights = Array3::from_shape_vec((1, 1, 2), vec![0.4, 0.4]).unwrap();
        assert_eq!(assign_from_bins(&weights, &bins, 2).unwrap().stages[[0, 0]], 0);
    }

    #[test]
    fn test_weights_above_table_are_unbinned() {
        let weights = Array3::from_shape_vec((1, 1, 2), vec![1.5, 0.1]).unwrap();
        let bins = bin_weights(&weights, &toy_table()).unwrap();
        assert_eq!(bins[[0, 0, 0]], UNBINNED);
        assert_eq!(bins[[0, 0, 1]], 0);
    }

    #[test]
    fn test_breakpoints_from_weights() {
        let weights = Array3::from_shape_fn((4, 5, 2), |(p, v, f)| ((p * 5 + v) % 7) as f32 * 0.1 + f as f32);
        let table = compute_breakpoints(&weights, 3).unwrap();
        assert_eq!(table.breaks().dim(), (2, 4));
        assert_eq!(table.breaks()[[1, 0]], 1.0);
        // every weight lands in some bin of a table built from it
        let bins = bin_weights(&weights, &table).unwrap();
        assert!(bins.iter().all(|&b| b < 3));
    }

    #[test]
    fn test_cluster_labels_per_feature() {
        let weights = Array3::from_shape_fn((3, 3, 1), |(p, v, _)| [0.1, 5.0, 9.0][(p + v) % 3]);
        let clusters = cluster_weights(&weights, &KMeansConfig::default()).unwrap();
        assert_eq!(clusters.labels.dim(), (3, 3, 1));
        assert_eq!(clusters.labels[[0, 0, 0]], 0);
        assert_eq!(clusters.labels[[0, 1, 0]], 1);
        assert_eq!(clusters.labels[[0, 2, 0]], 2);
        assert_eq!(clusters.breakpoints.classes(), 3);
    }
}
