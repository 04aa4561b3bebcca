//! Experiment models built from a burn network architecture.
//!
//! The variants share one wrapper and differ only in their [`Architecture`], so
//! attention support is a property of the network rather than an override.

use crate::data::{DataSet, SampleLayout};
use crate::error::{ExperimentError, Result};
use crate::model::checkpoint::{load_weights, CheckpointMetadata, FoldCheckpoints};
use crate::model::network::{
    Architecture, AttentionBidirectionalLstm, BidirectionalLstm, LogisticRegression,
    SelfAttentionBidirectionalLstm,
};
use crate::model::{AttentionOutput, InferenceBackend, ModelConfig, Scores, SequenceModel, TrainBackend};
use crate::training::trainer::{batch_features, predict_probabilities, tensor_values, Trainer};
use crate::training::ExperimentSetup;
use burn::module::AutodiffModule;
use burn::prelude::Backend;
use ndarray::{Array, Array2, Array3, Axis, Dimension};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub type LogisticModel = NetworkModel<LogisticRegression>;
pub type BiLstmModel = NetworkModel<BidirectionalLstm>;
pub type AttentionBiLstmModel = NetworkModel<AttentionBidirectionalLstm>;
pub type SelfAttentionBiLstmModel = NetworkModel<SelfAttentionBidirectionalLstm>;

type Device = <InferenceBackend as Backend>::Device;

/// A burn network driven through the experiment model interface.
///
/// Each `fit` starts from freshly initialised parameters and writes the fitted
/// network to the checkpoint of the next fold.
pub struct NetworkModel<A: Architecture> {
    name: String,
    setup: ExperimentSetup,
    checkpoints: FoldCheckpoints,
    device: Device,
    net: Option<A::Net<InferenceBackend>>,
    folds_fitted: usize,
    closed: bool,
    _architecture: PhantomData<A>,
}

impl<A: Architecture> NetworkModel<A> {
    pub fn new<P: AsRef<Path>>(setup: ExperimentSetup, checkpoint_dir: P) -> Result<Self> {
        setup.validate()?;
        Ok(Self {
            name: A::NAME.to_string(),
            setup,
            checkpoints: FoldCheckpoints::new(checkpoint_dir.as_ref(), A::NAME),
            device: Device::default(),
            net: None,
            folds_fitted: 0,
            closed: false,
            _architecture: PhantomData,
        })
    }

    /// Use `name` in logs and checkpoint file names
    pub fn with_name<P: AsRef<Path>>(mut self, name: &str, checkpoint_dir: P) -> Self {
        self.name = name.to_string();
        self.checkpoints = FoldCheckpoints::new(checkpoint_dir, name);
        self
    }

    pub fn setup(&self) -> &ExperimentSetup {
        &self.setup
    }

    /// Folds fitted so far
    pub fn folds_fitted(&self) -> usize {
        self.folds_fitted
    }

    fn model_config(&self, num_features: usize, steps: usize) -> ModelConfig {
        ModelConfig::new(num_features)
            .with_time_steps(steps)
            .with_hidden_size(self.setup.hidden_size)
            .with_dropout(self.setup.drop_probability())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ExperimentError::model(format!("{} has been closed", self.name)));
        }
        Ok(())
    }
}

impl<A: Architecture> SequenceModel for NetworkModel<A>
where
    A::Net<TrainBackend>: AutodiffModule<TrainBackend, InnerModule = A::Net<InferenceBackend>>,
{
    type Layout = A::Layout;

    fn name(&self) -> &str {
        &self.name
    }

    fn fit(&mut self, train: &DataSet<A::Layout>, test: &DataSet<A::Layout>) -> Result<()> {
        self.ensure_open()?;
        let fold = self.folds_fitted;

        let train_x = <A::Layout as SampleLayout>::to_steps(&train.features);
        let train_y = step_labels(&train.labels, train_x.dim())?;
        let test_x = <A::Layout as SampleLayout>::to_steps(&test.features);
        let test_y = step_labels(&test.labels, test_x.dim())?;

        let (_, steps, num_features) = train_x.dim();
        let config = self.model_config(num_features, steps);
        info!(
            "Fitting {} on fold {}: {} train / {} test samples",
            self.name,
            fold,
            train.len(),
            test.len()
        );

        TrainBackend::seed(self.setup.seed.wrapping_add(fold as u64));
        let net = A::init::<TrainBackend>(&config, &self.device);
        let trainer = Trainer::<TrainBackend>::new(self.setup.clone(), self.device.clone());
        let (net, state) = trainer.fit(net, &train_x, &train_y, Some((&test_x, &test_y)))?;
        let net = net.valid();

        let metadata = CheckpointMetadata {
            model: self.name.clone(),
            fold,
            epochs: state.epoch,
            final_loss: state.last_loss(),
            num_features,
            setup: self.setup.clone(),
        };
        self.checkpoints.save::<InferenceBackend, _>(net.clone(), &metadata)?;

        self.net = Some(net);
        self.folds_fitted += 1;
        Ok(())
    }

    fn predict(&mut self, test: &DataSet<A::Layout>) -> Result<Scores<A::Layout>> {
        self.ensure_open()?;
        let net = self
            .net
            .as_ref()
            .ok_or_else(|| ExperimentError::model(format!("{} must be fitted before predicting", self.name)))?;
        let x = <A::Layout as SampleLayout>::to_steps(&test.features);
        let probabilities = predict_probabilities::<InferenceBackend, _>(net, &x, self.setup.batch_size, &self.device)?;
        debug!("Predicted {} samples with {}", test.len(), self.name);
        <A::Layout as SampleLayout>::scores_from_steps(probabilities)
    }

    fn attention_analysis(&mut self, features: &Array3<f32>, checkpoint: &Path) -> Result<AttentionOutput> {
        self.ensure_open()?;
        if !A::FEATURE_ATTENTION {
            return Err(ExperimentError::Unsupported {
                model: self.name.clone(),
                capability: "attention analysis".to_string(),
            });
        }

        let (n, steps, num_features) = features.dim();
        let config = self.model_config(num_features, steps);
        let net = A::init::<InferenceBackend>(&config, &self.device);
        let net = load_weights::<InferenceBackend, _>(net, checkpoint, &self.device)?;

        let scores = predict_probabilities::<InferenceBackend, _>(&net, features, self.setup.batch_size, &self.device)?;
        let rows: Vec<usize> = (0..n).collect();
        let mut weights = Vec::with_capacity(n * steps * num_features);
        for chunk in rows.chunks(self.setup.batch_size.max(1)) {
            let x = batch_features::<InferenceBackend>(features, chunk, &self.device);
            let attention = A::attention(&net, x).ok_or_else(|| ExperimentError::Unsupported {
                model: self.name.clone(),
                capability: "attention analysis".to_string(),
            })?;
            weights.extend(tensor_values(attention)?);
        }
        let weights = Array3::from_shape_vec((n, steps, num_features), weights)
            .map_err(|e| ExperimentError::shape(e.to_string()))?;

        info!("Attention analysis of {} samples from {:?}", n, checkpoint);
        Ok(AttentionOutput { scores, weights })
    }

    fn checkpoint_path(&self, fold: usize) -> Option<PathBuf> {
        Some(self.checkpoints.path(fold))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(ExperimentError::Release(format!("{} was already closed", self.name)));
        }
        self.net = None;
        self.closed = true;
        debug!("Released {}", self.name);
        Ok(())
    }
}

/// Labels of any layout as `[samples, steps]`
fn step_labels<D: Dimension>(labels: &Array<u8, D>, (n, steps, _): (usize, usize, usize)) -> Result<Array2<u8>> {
    if labels.ndim() > 0 && labels.len_of(Axis(0)) != n {
        return Err(ExperimentError::shape(format!(
            "{} label rows for {} samples",
            labels.len_of(Axis(0)),
            n
        )));
    }
    Array2::from_shape_vec((n, steps), labels.iter().copied().collect())
        .map_err(|e| ExperimentError::shape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Ix2, Ix3};
    use tempfile::TempDir;

    fn quick_setup() -> ExperimentSetup {
        ExperimentSetup {
            epochs: 2,
            batch_size: 4,
            hidden_size: 4,
            max_loss: 0.0,
            ..ExperimentSetup::attention_bi_lstm()
        }
    }

    fn sequences(n: usize) -> DataSet<Ix3> {
        let features = Array3::from_shape_fn((n, 5, 3), |(p, v, f)| ((p + v * f) % 4) as f32 * 0.25);
        let labels = Array2::from_shape_fn((n, 5), |(p, v)| ((p + v) % 3 == 0) as u8);
        DataSet::new(features, labels).unwrap()
    }

    #[test]
    fn test_attention_model_fit_predict_and_analysis() {
        let dir = TempDir::new().unwrap();
        let mut model = AttentionBiLstmModel::new(quick_setup(), dir.path()).unwrap();
        let train = sequences(8);
        let test = sequences(3);

        model.fit(&train, &test).unwrap();
        let scores = model.predict(&test).unwrap();
        assert_eq!(scores.dim(), (3, 5));
        assert!(scores.iter().all(|&s| s > 0.0 && s < 1.0));

        let checkpoint = model.checkpoint_path(0).unwrap();
        assert!(checkpoint.exists());
        let output = model.attention_analysis(&test.features, &checkpoint).unwrap();
        assert_eq!(output.weights.dim(), (3, 5, 3));
        assert_eq!(output.scores.dim(), (3, 5));
        for visit in output.weights.lanes(Axis(2)) {
            assert_abs_diff_eq!(visit.sum(), 1.0, epsilon = 1e-4);
        }
        model.close().unwrap();
    }

    #[test]
    fn test_refit_writes_next_fold() {
        let dir = TempDir::new().unwrap();
        let mut model = BiLstmModel::new(quick_setup(), dir.path()).unwrap();
        let data = sequences(6);
        model.fit(&data, &data).unwrap();
        model.fit(&data, &data).unwrap();
        assert_eq!(model.folds_fitted(), 2);
        assert!(dir.path().join("bi_lstm-fold1.mpk").exists());
    }

    #[test]
    fn test_logistic_uses_flat_rows() {
        let dir = TempDir::new().unwrap();
        let mut model = LogisticModel::new(quick_setup(), dir.path()).unwrap();
        let features = Array2::from_shape_fn((10, 3), |(r, c)| (r * c) as f32 * 0.1);
        let labels = Array1::from_shape_fn(10, |r| (r % 2) as u8);
        let data = DataSet::<Ix2>::new(features, labels).unwrap();

        model.fit(&data, &data).unwrap();
        assert_eq!(model.predict(&data).unwrap().len(), 10);
    }

    #[test]
    fn test_attention_unsupported_without_feature_weights() {
        let dir = TempDir::new().unwrap();
        let mut model = SelfAttentionBiLstmModel::new(quick_setup(), dir.path()).unwrap();
        let features = Array3::<f32>::zeros((2, 5, 3));
        let err = model.attention_analysis(&features, Path::new("missing.mpk")).unwrap_err();
        assert!(matches!(err, ExperimentError::Unsupported { .. }));
    }

    #[test]
    fn test_predict_before_fit_and_double_close() {
        let dir = TempDir::new().unwrap();
        let mut model = BiLstmModel::new(quick_setup(), dir.path()).unwrap();
        assert!(model.predict(&sequences(2)).is_err());
        model.close().unwrap();
        assert!(matches!(model.close(), Err(ExperimentError::Release(_))));
    }
}
