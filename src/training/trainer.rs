use crate::error::{ExperimentError, Result};
use crate::model::network::ScoringNetwork;
use crate::training::{ExperimentSetup, TrainingState};
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, Array3, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::time::Instant;
use tracing::{debug, info};

/// Mini-batch trainer for the outcome networks
pub struct Trainer<B: AutodiffBackend> {
    setup: ExperimentSetup,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(setup: ExperimentSetup, device: B::Device) -> Self {
        Self { setup, device }
    }

    /// Fit `net` on per-step labels.
    ///
    /// `monitor` is only scored, never trained on; its loss is logged every
    /// `output_n_epochs` epochs.
    pub fn fit<N>(
        &self,
        mut net: N,
        features: &Array3<f32>,
        labels: &Array2<u8>,
        monitor: Option<(&Array3<f32>, &Array2<u8>)>,
    ) -> Result<(N, TrainingState)>
    where
        N: ScoringNetwork<B> + AutodiffModule<B>,
    {
        check_aligned(features, labels)?;
        if features.len_of(Axis(0)) == 0 {
            return Err(ExperimentError::shape("cannot train on an empty data set"));
        }
        if let Some((x, y)) = monitor {
            check_aligned(x, y)?;
        }

        let start = Instant::now();
        let mut optim = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(self.setup.ridge as f32)))
            .init::<B, N>();
        let mut rng = ChaCha8Rng::seed_from_u64(self.setup.seed);
        let mut order: Vec<usize> = (0..features.len_of(Axis(0))).collect();
        let mut state = TrainingState::new();

        let progress = ProgressBar::new(self.setup.epochs as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner} [{elapsed_precise}] {bar:30} {pos}/{len} epochs {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        for epoch in 0..self.setup.epochs {
            order.shuffle(&mut rng);
            let mut total = 0.0;
            let mut batches = 0usize;

            for chunk in order.chunks(self.setup.batch_size.max(1)) {
                let x = batch_features::<B>(features, chunk, &self.device);
                let y = batch_labels::<B>(labels, chunk, &self.device);
                let loss = binary_cross_entropy(net.logits(x), y);
                total += loss.clone().into_scalar().elem::<f64>();

                let grads = GradientsParams::from_grads(loss.backward(), &net);
                net = optim.step(self.setup.learning_rate, net, grads);
                batches += 1;
            }

            let epoch_loss = total / batches as f64;
            state.update_epoch(epoch_loss);
            progress.set_message(format!("loss {:.4}", epoch_loss));
            progress.inc(1);

            if let Some((x, y)) = monitor {
                if (epoch + 1) % self.setup.output_n_epochs.max(1) == 0 {
                    let monitor_loss = self.evaluate_loss(&net, x, y);
                    state.monitor_loss_history.push((epoch + 1, monitor_loss));
                    debug!(
                        "Epoch {}: train loss {:.4}, monitor loss {:.4}",
                        epoch + 1,
                        epoch_loss,
                        monitor_loss
                    );
                }
            }

            if state.should_stop(self.setup.max_loss, self.setup.max_pace) {
                info!("Converged after {} epochs (loss {:.4})", epoch + 1, epoch_loss);
                break;
            }
        }

        progress.finish_and_clear();
        info!(
            "Training finished: {} epochs, final loss {:.4}, {}",
            state.epoch,
            state.last_loss().unwrap_or(f64::NAN),
            crate::utils::format_duration(start.elapsed().as_secs_f64())
        );
        Ok((net, state))
    }

    fn evaluate_loss<N: ScoringNetwork<B>>(&self, net: &N, features: &Array3<f32>, labels: &Array2<u8>) -> f64 {
        let n = features.len_of(Axis(0));
        if n == 0 {
            return f64::NAN;
        }
        let rows: Vec<usize> = (0..n).collect();
        let mut weighted = 0.0;
        for chunk in rows.chunks(self.setup.batch_size.max(1)) {
            let x = batch_features::<B>(features, chunk, &self.device);
            let y = batch_labels::<B>(labels, chunk, &self.device);
            let loss = binary_cross_entropy(net.logits(x), y).into_scalar().elem::<f64>();
            weighted += loss * chunk.len() as f64;
        }
        weighted / n as f64
    }
}

/// Mean binary cross-entropy on logits, computed in the stable form
/// `max(x, 0) - x * y + ln(1 + exp(-|x|))`
pub fn binary_cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let positive = logits.clone().clamp_min(0.0);
    let log_term = logits.clone().abs().neg().exp().add_scalar(1.0).log();
    (positive - logits * targets + log_term).mean()
}

/// Outcome probabilities `[samples, steps]`, in input order
pub fn predict_probabilities<B: Backend, N: ScoringNetwork<B>>(
    net: &N,
    features: &Array3<f32>,
    batch_size: usize,
    device: &B::Device,
) -> Result<Array2<f32>> {
    let (n, steps, _) = features.dim();
    let rows: Vec<usize> = (0..n).collect();
    let mut values = Vec::with_capacity(n * steps);
    for chunk in rows.chunks(batch_size.max(1)) {
        let x = batch_features::<B>(features, chunk, device);
        let probabilities = sigmoid(net.logits(x));
        values.extend(tensor_values(probabilities)?);
    }
    Array2::from_shape_vec((n, steps), values).map_err(|e| ExperimentError::shape(e.to_string()))
}

/// Copy the selected samples into a `[batch, steps, features]` tensor
pub fn batch_features<B: Backend>(features: &Array3<f32>, rows: &[usize], device: &B::Device) -> Tensor<B, 3> {
    let (_, steps, num_features) = features.dim();
    let mut data = Vec::with_capacity(rows.len() * steps * num_features);
    for &row in rows {
        data.extend(features.index_axis(Axis(0), row).iter().copied());
    }
    Tensor::from_data(TensorData::new(data, [rows.len(), steps, num_features]), device)
}

fn batch_labels<B: Backend>(labels: &Array2<u8>, rows: &[usize], device: &B::Device) -> Tensor<B, 2> {
    let steps = labels.ncols();
    let mut data = Vec::with_capacity(rows.len() * steps);
    for &row in rows {
        data.extend(labels.row(row).iter().map(|&l| l as f32));
    }
    Tensor::from_data(TensorData::new(data, [rows.len(), steps]), device)
}

/// Flatten a tensor to host memory
pub fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| ExperimentError::model(format!("{:?}", e)))
}

fn check_aligned(features: &Array3<f32>, labels: &Array2<u8>) -> Result<()> {
    let (n, steps, _) = features.dim();
    if labels.dim() != (n, steps) {
        return Err(ExperimentError::shape(format!(
            "labels {:?} do not match features {:?}",
            labels.shape(),
            features.shape()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::model::network::{Architecture, BidirectionalLstm, LogisticRegression};
    use crate::model::{ModelConfig, TrainBackend};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn separable(n: usize) -> (Array3<f32>, Array2<u8>) {
        let labels = Array2::from_shape_fn((n, 1), |(r, _)| (r % 2) as u8);
        let features = Array3::from_shape_fn((n, 1, 2), |(r, _, f)| {
            let sign = if r % 2 == 1 { 1.0 } else { -1.0 };
            sign * (1.0 + f as f32)
        });
        (features, labels)
    }

    #[test]
    fn test_bce_matches_closed_form() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![0.0f32, 2.0], [1, 2]), &device);
        let targets = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![1.0f32, 0.0], [1, 2]), &device);
        let loss = binary_cross_entropy(logits, targets).into_scalar().elem::<f64>();
        let expected = ((2.0f64).ln() + (1.0 + 2.0f64.exp()).ln()) / 2.0;
        assert_abs_diff_eq!(loss, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_logistic_fit_reduces_loss() {
        let (features, labels) = separable(32);
        let setup = ExperimentSetup {
            epochs: 15,
            batch_size: 8,
            learning_rate: 0.1,
            max_loss: 0.0,
            ..ExperimentSetup::logistic()
        };
        let device = Default::default();
        let config = ModelConfig::new(2).with_time_steps(1);
        let net = LogisticRegression::init::<TrainBackend>(&config, &device);

        let trainer = Trainer::<TrainBackend>::new(setup, Default::default());
        let (net, state) = trainer.fit(net, &features, &labels, Some((&features, &labels))).unwrap();

        assert_eq!(state.epoch, 15);
        assert!(state.train_loss_history[14] < state.train_loss_history[0]);
        assert_eq!(state.monitor_loss_history.len(), 15);

        let probabilities = predict_probabilities(&net, &features, 5, &device).unwrap();
        assert_eq!(probabilities.dim(), (32, 1));
        assert!(probabilities[[1, 0]] > probabilities[[0, 0]]);
    }

    #[test]
    fn test_fit_rejects_misaligned_labels() {
        let features = Array3::<f32>::zeros((4, 5, 3));
        let labels = Array2::<u8>::zeros((4, 4));
        let device = Default::default();
        let net = BidirectionalLstm::init::<TrainBackend>(&ModelConfig::new(3).with_hidden_size(2), &device);
        let trainer = Trainer::<TrainBackend>::new(ExperimentSetup::bi_lstm(), device);
        assert!(trainer.fit(net, &features, &labels, None).is_err());
    }

    #[test]
    fn test_predict_keeps_sample_order() {
        let device = Default::default();
        let net = BidirectionalLstm::init::<TestBackend>(&ModelConfig::new(3).with_hidden_size(2), &device);
        let features = Array3::from_shape_fn((7, 5, 3), |(p, v, f)| (p + v + f) as f32 * 0.1);

        let batched = predict_probabilities(&net, &features, 3, &device).unwrap();
        let single = predict_probabilities(&net, &features, 7, &device).unwrap();
        assert_eq!(batched.dim(), (7, 5));
        for (a, b) in batched.iter().zip(single.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
            assert!(*a > 0.0 && *a < 1.0);
        }
    }
}
