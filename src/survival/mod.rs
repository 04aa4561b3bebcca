//! Time-to-event experiments: Cox regression and random survival forests,
//! cross-validated over the same patient folds as the classification models.

pub mod cox;
pub mod forest;

use crate::data::folds::FoldPlan;
use crate::data::loader::VisitTable;
use crate::error::{ExperimentError, Result};
use ndarray::{Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use cox::{CoxConfig, CoxModel};
pub use forest::{ForestConfig, RandomSurvivalForest};

/// Visit rows with their follow-up time and event indicator
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalData {
    /// `[rows, features]`
    pub features: Array2<f32>,
    pub times: Array1<f32>,
    /// 1 when the event was observed, 0 when censored
    pub events: Array1<u8>,
}

impl SurvivalData {
    pub fn new(features: Array2<f32>, times: Array1<f32>, events: Array1<u8>) -> Result<Self> {
        let rows = features.nrows();
        if times.len() != rows || events.len() != rows {
            return Err(ExperimentError::shape(format!(
                "{} rows with {} times and {} events",
                rows,
                times.len(),
                events.len()
            )));
        }
        if events.iter().any(|&e| e > 1) {
            return Err(ExperimentError::shape("event indicators must be 0 or 1"));
        }
        if times.iter().any(|t| !t.is_finite()) {
            return Err(ExperimentError::shape("survival times must be finite"));
        }
        Ok(Self { features, times, events })
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn event_count(&self) -> usize {
        self.events.iter().filter(|&&e| e == 1).count()
    }
}

/// Per-patient visit records for survival experiments
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalCohort {
    /// `[patients, visits, features]`
    pub features: Array3<f32>,
    /// `[patients, visits]`
    pub times: Array2<f32>,
    /// `[patients, visits]`
    pub events: Array2<u8>,
}

impl SurvivalCohort {
    pub fn new(features: Array3<f32>, times: Array2<f32>, events: Array2<u8>) -> Result<Self> {
        let (patients, visits, _) = features.dim();
        if times.dim() != (patients, visits) || events.dim() != (patients, visits) {
            return Err(ExperimentError::shape(format!(
                "times {:?} / events {:?} do not match features {:?}",
                times.shape(),
                events.shape(),
                features.shape()
            )));
        }
        Ok(Self { features, times, events })
    }

    /// Build from a table loaded with [`LoaderConfig::survival`](crate::data::loader::LoaderConfig::survival)
    pub fn from_table(table: VisitTable) -> Result<Self> {
        let times = table
            .times
            .ok_or_else(|| ExperimentError::config("visit table has no time column"))?;
        Self::new(table.features, times, table.outcomes)
    }

    pub fn num_patients(&self) -> usize {
        self.features.len_of(Axis(0))
    }

    /// Every visit as one row
    pub fn flatten(&self) -> Result<SurvivalData> {
        flatten(&self.features, &self.times, &self.events)
    }

    /// Train and test rows of one fold; visits of a patient stay together
    pub fn fold(&self, plan: &FoldPlan, fold: usize) -> Result<(SurvivalData, SurvivalData)> {
        let train = flatten(
            &plan.select_train(&self.features, fold)?,
            &plan.select_train(&self.times, fold)?,
            &plan.select_train(&self.events, fold)?,
        )?;
        let test = flatten(
            &plan.select_test(&self.features, fold)?,
            &plan.select_test(&self.times, fold)?,
            &plan.select_test(&self.events, fold)?,
        )?;
        Ok((train, test))
    }
}

fn flatten(features: &Array3<f32>, times: &Array2<f32>, events: &Array2<u8>) -> Result<SurvivalData> {
    let (patients, visits, num_features) = features.dim();
    let rows = patients * visits;
    let features = features
        .to_owned()
        .into_shape_with_order((rows, num_features))
        .map_err(|e| ExperimentError::shape(e.to_string()))?;
    let times = Array1::from_iter(times.iter().copied());
    let events = Array1::from_iter(events.iter().copied());
    SurvivalData::new(features, times, events)
}

/// A model producing relative risk; higher risk means an earlier event
pub trait SurvivalModel {
    fn name(&self) -> &str;

    fn fit(&mut self, data: &SurvivalData) -> Result<()>;

    fn risk(&self, features: &Array2<f32>) -> Result<Array1<f64>>;
}

/// Harrell's concordance index.
///
/// A pair is comparable when the shorter time ended in an event. It is concordant
/// when that row also has the higher risk; tied risks count one half.
pub fn concordance_index(times: &[f32], risk: &[f64], events: &[u8]) -> Result<f64> {
    if times.len() != risk.len() || times.len() != events.len() {
        return Err(ExperimentError::shape(format!(
            "{} times, {} risks, {} events",
            times.len(),
            risk.len(),
            events.len()
        )));
    }
    let mut comparable = 0.0f64;
    let mut concordant = 0.0f64;
    for i in 0..times.len() {
        if events[i] != 1 {
            continue;
        }
        for j in 0..times.len() {
            if times[i] < times[j] {
                comparable += 1.0;
                if risk[i] > risk[j] {
                    concordant += 1.0;
                } else if risk[i] == risk[j] {
                    concordant += 0.5;
                }
            }
        }
    }
    if comparable == 0.0 {
        return Err(ExperimentError::MetricUndefined(
            "concordance index has no comparable pairs".to_string(),
        ));
    }
    Ok(concordant / comparable)
}

/// Concordance of every fold plus its mean and (population) standard deviation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidation {
    pub model: String,
    pub fold_scores: Vec<f64>,
    pub mean: f64,
    pub std: f64,
}

impl CrossValidation {
    fn from_scores(model: &str, fold_scores: Vec<f64>) -> Self {
        let n = fold_scores.len().max(1) as f64;
        let mean = fold_scores.iter().sum::<f64>() / n;
        let variance = fold_scores.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n;
        Self {
            model: model.to_string(),
            fold_scores,
            mean,
            std: variance.sqrt(),
        }
    }
}

/// Fit and score `model` on every fold of `plan`
pub fn cross_validate<M: SurvivalModel>(
    model: &mut M,
    cohort: &SurvivalCohort,
    plan: &FoldPlan,
) -> Result<CrossValidation> {
    let mut scores = Vec::with_capacity(plan.folds());
    for fold in 0..plan.folds() {
        let (train, test) = cohort.fold(plan, fold)?;
        model.fit(&train)?;
        let risk = model.risk(&test.features)?;
        let c_index = concordance_index(&test.times.to_vec(), &risk.to_vec(), &test.events.to_vec())?;
        info!("{} fold {}: c-index={:.4}", model.name(), fold, c_index);
        scores.push(c_index);
    }
    let summary = CrossValidation::from_scores(model.name(), scores);
    info!(
        "{}: mean c-index={:.4} (std {:.4})",
        summary.model, summary.mean, summary.std
    );
    Ok(summary)
}

/// Column means and standard deviations; constant columns get a unit scale
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Standardizer {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl Standardizer {
    pub(crate) fn fit(features: &Array2<f32>) -> Self {
        let x = features.mapv(|v| v as f64);
        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scale = x.std_axis(Axis(0), 0.0).mapv(|s| if s > 1e-12 { s } else { 1.0 });
        Self { mean, scale }
    }

    pub(crate) fn transform(&self, features: &Array2<f32>) -> Result<Array2<f64>> {
        if features.ncols() != self.mean.len() {
            return Err(ExperimentError::shape(format!(
                "expected {} features, got {}",
                self.mean.len(),
                features.ncols()
            )));
        }
        Ok((features.mapv(|v| v as f64) - &self.mean) / &self.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_concordance_perfect_and_reversed() {
        let times = [1.0, 2.0, 3.0, 4.0];
        let events = [1, 1, 1, 0];
        assert_eq!(concordance_index(&times, &[4.0, 3.0, 2.0, 1.0], &events).unwrap(), 1.0);
        assert_eq!(concordance_index(&times, &[1.0, 2.0, 3.0, 4.0], &events).unwrap(), 0.0);
    }

    #[test]
    fn test_concordance_ties_count_half() {
        let c = concordance_index(&[1.0, 2.0], &[0.5, 0.5], &[1, 1]).unwrap();
        assert_eq!(c, 0.5);
    }

    #[test]
    fn test_concordance_censored_rows_only_follow_events() {
        // row 0's event precedes both censored rows: (0, 1) discordant, (0, 2) concordant
        let c = concordance_index(&[1.0, 2.0, 3.0], &[2.0, 9.0, 1.0], &[1, 0, 0]).unwrap();
        assert_eq!(c, 0.5);
    }

    #[test]
    fn test_concordance_ignores_early_censoring() {
        // rows 0 and 1 are censored at or before the only later events
        let times = [1.0, 2.0, 2.0, 4.0];
        let risk = [0.1, 0.2, 5.0, 1.0];
        let events = [0, 0, 1, 1];
        let c = concordance_index(&times, &risk, &events).unwrap();
        // only (2, 3) is comparable and concordant
        assert_eq!(c, 1.0);
    }

    #[test]
    fn test_concordance_without_pairs() {
        let err = concordance_index(&[1.0, 2.0], &[1.0, 2.0], &[0, 0]).unwrap_err();
        assert!(matches!(err, ExperimentError::MetricUndefined(_)));
    }

    #[test]
    fn test_fold_keeps_patient_visits_together() {
        let features = Array3::from_shape_fn((10, 2, 1), |(p, v, _)| (p * 2 + v) as f32);
        let times = Array2::from_shape_fn((10, 2), |(p, v)| (p * 2 + v) as f32);
        let events = Array2::from_elem((10, 2), 1u8);
        let cohort = SurvivalCohort::new(features, times, events).unwrap();
        let plan = FoldPlan::five_fold(10).unwrap();

        let (train, test) = cohort.fold(&plan, 1).unwrap();
        assert_eq!(test.times, array![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(train.len(), 16);
        assert!(train.times.iter().all(|t| !(4.0..8.0).contains(t)));
    }

    #[test]
    fn test_standardizer_handles_constant_columns() {
        let x = array![[1.0f32, 5.0], [3.0, 5.0]];
        let standardizer = Standardizer::fit(&x);
        let z = standardizer.transform(&x).unwrap();
        assert_eq!(z, array![[-1.0, 0.0], [1.0, 0.0]]);
        assert!(standardizer.transform(&array![[1.0f32]]).is_err());
    }

    #[test]
    fn test_cross_validation_summary() {
        let summary = CrossValidation::from_scores("cox", vec![0.6, 0.8]);
        assert_abs_diff_eq!(summary.mean, 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.std, 0.1, epsilon = 1e-12);
    }
}
