//! Cross-validated experiment driver.
//!
//! Folds run one after another against a single model handle. Predictions are
//! pooled in fold order, which lines them up with the first
//! `folds * floor(N / folds)` patients of the cohort.

use crate::data::folds::{FoldPlan, DEFAULT_FOLDS};
use crate::data::resample::{ImbalanceResampler, ResampleConfig};
use crate::data::Cohort;
use crate::error::{ExperimentError, Result};
use crate::evaluate::report::{ReportPaths, ReportWriter};
use crate::evaluate::{evaluate, Evaluation};
use crate::model::SequenceModel;
use ndarray::{concatenate, s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Settings of one cross-validated run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub folds: usize,
    pub resample: ResampleConfig,
    /// Directory receiving the evaluation report
    pub output_dir: PathBuf,
    /// File stem of the report
    pub run_name: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            folds: DEFAULT_FOLDS,
            resample: ResampleConfig::default(),
            output_dir: PathBuf::from("results"),
            run_name: "experiment".to_string(),
        }
    }
}

/// Test-fold predictions of every fold, concatenated in fold order
#[derive(Debug, Clone, PartialEq)]
pub struct PooledPredictions {
    /// Flat `(patient, visit)` row of each prediction in the cohort
    pub indices: Vec<usize>,
    pub labels: Vec<u8>,
    pub scores: Vec<f32>,
}

impl PooledPredictions {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn evaluate(&self) -> Result<Evaluation> {
        evaluate(&self.indices, &self.labels, &self.scores)
    }
}

/// Attention of every evaluated patient, gathered from the per-fold checkpoints
#[derive(Debug, Clone)]
pub struct AttentionCollection {
    /// `[evaluated patients, visits, features]`
    pub weights: Array3<f32>,
    /// `[evaluated patients, visits]`
    pub scores: Array2<f32>,
    /// Outcome labels of the same patients
    pub labels: Array2<u8>,
}

/// Scoped ownership of a model handle.
///
/// The model is closed exactly once: by [`ModelSession::release`] on the normal
/// path, or on drop if the session is abandoned by a panic.
pub struct ModelSession<'a, M: SequenceModel> {
    model: &'a mut M,
    released: bool,
}

impl<'a, M: SequenceModel> ModelSession<'a, M> {
    pub fn open(model: &'a mut M) -> Self {
        debug!("Opened session for {}", model.name());
        Self { model, released: false }
    }

    pub fn model(&mut self) -> &mut M {
        &mut *self.model
    }

    /// Close the model and merge the close result into `outcome`.
    ///
    /// A failed close never hides an earlier failure.
    pub fn release<T>(mut self, outcome: Result<T>) -> Result<T> {
        self.released = true;
        let closed = self.model.close();
        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(ExperimentError::Release(msg))) => Err(ExperimentError::Release(msg)),
            (Ok(_), Err(e)) => Err(ExperimentError::Release(e.to_string())),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_error)) => {
                warn!("Closing {} failed after an earlier error: {}", self.model.name(), close_error);
                Err(e)
            }
        }
    }
}

impl<M: SequenceModel> Drop for ModelSession<'_, M> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.model.close() {
                warn!("Closing {} on unwind failed: {}", self.model.name(), e);
            }
        }
    }
}

/// Drives fold splitting, resampling, fitting and pooling
pub struct ExperimentRunner {
    config: ExperimentConfig,
    resampler: ImbalanceResampler,
}

impl ExperimentRunner {
    pub fn new(config: ExperimentConfig) -> Self {
        let resampler = ImbalanceResampler::new(&config.resample);
        Self { config, resampler }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Cross-validate `model` on `cohort` and pool the test-fold predictions.
    ///
    /// The model is closed before returning, whether or not a fold failed.
    pub fn run<M: SequenceModel>(&self, model: &mut M, cohort: &Cohort) -> Result<PooledPredictions> {
        let mut session = ModelSession::open(model);
        let outcome = self.run_folds(session.model(), cohort);
        session.release(outcome)
    }

    fn run_folds<M: SequenceModel>(&self, model: &mut M, cohort: &Cohort) -> Result<PooledPredictions> {
        let plan = FoldPlan::new(cohort.num_patients(), self.config.folds)?;
        let started = Instant::now();
        info!(
            "Running {} over {} folds ({} patients, {} untested)",
            model.name(),
            plan.folds(),
            plan.patients(),
            plan.untested().len()
        );

        let mut labels = Vec::new();
        let mut scores = Vec::new();
        for fold in 0..plan.folds() {
            let split = plan.split_fold::<M::Layout>(cohort, fold)?;
            let train = self.resampler.resample(&split.train)?;
            model.fit(&train, &split.test)?;
            let predicted = model.predict(&split.test)?;
            if predicted.shape() != split.test.labels.shape() {
                return Err(ExperimentError::shape(format!(
                    "fold {}: {} returned scores {:?} for labels {:?}",
                    fold,
                    model.name(),
                    predicted.shape(),
                    split.test.labels.shape()
                )));
            }
            labels.extend(split.test.labels.iter().copied());
            scores.extend(predicted.iter().copied());
            info!("Finished fold {}/{}", fold + 1, plan.folds());
        }

        let indices = plan.pooled_row_indices(cohort.num_visits());
        if indices.len() != labels.len() {
            return Err(ExperimentError::shape(format!(
                "pooled {} predictions for {} evaluated rows",
                labels.len(),
                indices.len()
            )));
        }
        info!(
            "Pooled {} predictions in {}",
            labels.len(),
            crate::utils::format_duration(started.elapsed().as_secs_f64())
        );
        Ok(PooledPredictions { indices, labels, scores })
    }

    /// Run, evaluate and write the report under the configured run name
    pub fn run_and_report<M: SequenceModel>(
        &self,
        model: &mut M,
        cohort: &Cohort,
    ) -> Result<(Evaluation, ReportPaths)> {
        let pooled = self.run(model, cohort)?;
        let evaluation = pooled.evaluate()?;
        info!(
            "{}: AUC={:.4}, threshold={:.4}, accuracy={:.4}",
            self.config.run_name, evaluation.auc, evaluation.threshold, evaluation.metrics.accuracy
        );
        let paths = ReportWriter::new(&self.config.output_dir).write(&self.config.run_name, &evaluation)?;
        Ok((evaluation, paths))
    }

    /// Attention of every test fold from the checkpoints of an earlier run.
    ///
    /// Folds are concatenated in fold order, matching [`PooledPredictions`].
    pub fn collect_attention<M: SequenceModel>(&self, model: &mut M, cohort: &Cohort) -> Result<AttentionCollection> {
        let mut session = ModelSession::open(model);
        let outcome = self.attention_folds(session.model(), cohort);
        session.release(outcome)
    }

    fn attention_folds<M: SequenceModel>(&self, model: &mut M, cohort: &Cohort) -> Result<AttentionCollection> {
        let plan = FoldPlan::new(cohort.num_patients(), self.config.folds)?;
        let mut weights = Vec::with_capacity(plan.folds());
        let mut scores = Vec::with_capacity(plan.folds());
        for fold in 0..plan.folds() {
            let checkpoint = model.checkpoint_path(fold).ok_or_else(|| ExperimentError::Unsupported {
                model: model.name().to_string(),
                capability: "fold checkpoints".to_string(),
            })?;
            let features = plan.select_test(&cohort.features, fold)?;
            let output = model.attention_analysis(&features, &checkpoint)?;
            if output.weights.dim() != features.dim() {
                return Err(ExperimentError::shape(format!(
                    "fold {}: attention {:?} for features {:?}",
                    fold,
                    output.weights.shape(),
                    features.shape()
                )));
            }
            weights.push(output.weights);
            scores.push(output.scores);
        }

        let weight_views: Vec<_> = weights.iter().map(|w| w.view()).collect();
        let score_views: Vec<_> = scores.iter().map(|s| s.view()).collect();
        let weights = concatenate(Axis(0), &weight_views).map_err(|e| ExperimentError::shape(e.to_string()))?;
        let scores = concatenate(Axis(0), &score_views).map_err(|e| ExperimentError::shape(e.to_string()))?;
        let labels = cohort.labels.slice(s![..plan.evaluated_patients(), ..]).to_owned();
        info!("Collected attention for {} patients", weights.len_of(Axis(0)));
        Ok(AttentionCollection { weights, scores, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataSet;
    use crate::model::{AttentionOutput, Scores};
    use ndarray::{Array1, Ix2, Ix3};
    use std::path::Path;
    use tempfile::TempDir;

    fn cohort(patients: usize) -> Cohort {
        let features = Array3::from_shape_fn((patients, 5, 2), |(p, v, f)| {
            if f == 0 {
                (p * 5 + v) as f32
            } else {
                ((p + v) % 3) as f32
            }
        });
        let labels = Array2::from_shape_fn((patients, 5), |(p, v)| ((p + v) % 3 == 0) as u8);
        Cohort::new(features, labels).unwrap()
    }

    /// Scores each visit with its own cohort row number
    #[derive(Default)]
    struct RowEcho {
        fits: Vec<(usize, usize)>,
        closes: usize,
        fail_on_fit: Option<usize>,
        fail_close: bool,
    }

    impl RowEcho {
        fn fit_fold(&mut self, train: usize, test: usize) -> Result<()> {
            if self.fail_on_fit == Some(self.fits.len()) {
                return Err(ExperimentError::model("diverged"));
            }
            self.fits.push((train, test));
            Ok(())
        }

        fn close_once(&mut self) -> Result<()> {
            self.closes += 1;
            if self.fail_close {
                return Err(ExperimentError::Release("device busy".into()));
            }
            Ok(())
        }
    }

    impl SequenceModel for RowEcho {
        type Layout = Ix3;

        fn name(&self) -> &str {
            "row_echo"
        }

        fn fit(&mut self, train: &DataSet<Ix3>, test: &DataSet<Ix3>) -> Result<()> {
            self.fit_fold(train.len(), test.len())
        }

        fn predict(&mut self, test: &DataSet<Ix3>) -> Result<Scores<Ix3>> {
            Ok(test.features.index_axis(Axis(2), 0).to_owned())
        }

        fn attention_analysis(&mut self, features: &Array3<f32>, _checkpoint: &Path) -> Result<AttentionOutput> {
            Ok(AttentionOutput {
                scores: features.index_axis(Axis(2), 1).to_owned(),
                weights: features.clone(),
            })
        }

        fn checkpoint_path(&self, fold: usize) -> Option<PathBuf> {
            Some(PathBuf::from(format!("row_echo-fold{}.mpk", fold)))
        }

        fn close(&mut self) -> Result<()> {
            self.close_once()
        }
    }

    /// Flat variant of [`RowEcho`]
    #[derive(Default)]
    struct FlatEcho {
        closes: usize,
    }

    impl SequenceModel for FlatEcho {
        type Layout = Ix2;

        fn name(&self) -> &str {
            "flat_echo"
        }

        fn fit(&mut self, _train: &DataSet<Ix2>, _test: &DataSet<Ix2>) -> Result<()> {
            Ok(())
        }

        fn predict(&mut self, test: &DataSet<Ix2>) -> Result<Array1<f32>> {
            Ok(test.features.column(0).to_owned())
        }

        fn close(&mut self) -> Result<()> {
            self.closes += 1;
            Ok(())
        }
    }

    fn runner() -> ExperimentRunner {
        ExperimentRunner::new(ExperimentConfig::default())
    }

    #[test]
    fn test_predictions_pool_in_fold_order() {
        let cohort = cohort(12);
        let mut model = RowEcho::default();
        let pooled = runner().run(&mut model, &cohort).unwrap();

        assert_eq!(pooled.len(), 50);
        assert_eq!(pooled.indices, (0..50).collect::<Vec<_>>());
        let expected: Vec<f32> = (0..50).map(|i| i as f32).collect();
        assert_eq!(pooled.scores, expected);
        let labels: Vec<u8> = cohort.labels.slice(s![..10, ..]).iter().copied().collect();
        assert_eq!(pooled.labels, labels);

        assert_eq!(model.fits.len(), 5);
        assert!(model.fits.iter().all(|&(_, test)| test == 2));
        assert_eq!(model.closes, 1);
    }

    #[test]
    fn test_flat_layout_pools_the_same_rows() {
        let cohort = cohort(12);
        let mut model = FlatEcho::default();
        let pooled = runner().run(&mut model, &cohort).unwrap();
        let expected: Vec<f32> = (0..50).map(|i| i as f32).collect();
        assert_eq!(pooled.scores, expected);
        assert_eq!(model.closes, 1);
    }

    #[test]
    fn test_failed_fold_still_closes() {
        let cohort = cohort(12);
        let mut model = RowEcho {
            fail_on_fit: Some(2),
            ..Default::default()
        };
        let err = runner().run(&mut model, &cohort).unwrap_err();
        assert!(matches!(err, ExperimentError::Model(_)));
        assert_eq!(model.fits.len(), 2);
        assert_eq!(model.closes, 1);
    }

    #[test]
    fn test_close_failure_does_not_mask_fold_failure() {
        let cohort = cohort(12);
        let mut model = RowEcho {
            fail_on_fit: Some(0),
            fail_close: true,
            ..Default::default()
        };
        let err = runner().run(&mut model, &cohort).unwrap_err();
        assert!(matches!(err, ExperimentError::Model(_)));
        assert_eq!(model.closes, 1);
    }

    #[test]
    fn test_close_failure_after_success_is_reported() {
        let cohort = cohort(12);
        let mut model = RowEcho {
            fail_close: true,
            ..Default::default()
        };
        let err = runner().run(&mut model, &cohort).unwrap_err();
        assert!(matches!(err, ExperimentError::Release(_)));
        assert_eq!(model.closes, 1);
    }

    #[test]
    fn test_too_few_patients_closes_model() {
        let cohort = cohort(4);
        let mut model = RowEcho::default();
        let err = runner().run(&mut model, &cohort).unwrap_err();
        assert!(matches!(err, ExperimentError::TooFewPatients { patients: 4, folds: 5 }));
        assert_eq!(model.closes, 1);
    }

    #[test]
    fn test_session_closes_on_drop() {
        let mut model = RowEcho::default();
        {
            let _session = ModelSession::open(&mut model);
        }
        assert_eq!(model.closes, 1);
    }

    #[test]
    fn test_collect_attention_in_fold_order() {
        let cohort = cohort(12);
        let mut model = RowEcho::default();
        let collected = runner().collect_attention(&mut model, &cohort).unwrap();
        assert_eq!(collected.weights, cohort.features.slice(s![..10, .., ..]).to_owned());
        assert_eq!(collected.labels, cohort.labels.slice(s![..10, ..]).to_owned());
        assert_eq!(collected.scores.dim(), (10, 5));
        assert_eq!(model.closes, 1);
    }

    #[test]
    fn test_report_written_after_run() {
        let dir = TempDir::new().unwrap();
        let config = ExperimentConfig {
            output_dir: dir.path().to_path_buf(),
            run_name: "echo".to_string(),
            ..Default::default()
        };
        let cohort = cohort(12);
        let mut model = RowEcho::default();
        let (evaluation, paths) = ExperimentRunner::new(config).run_and_report(&mut model, &cohort).unwrap();
        assert_eq!(evaluation.samples.len(), 50);
        assert!(paths.summary.exists());
    }
}
