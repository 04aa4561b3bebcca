pub mod trainer;

use crate::error::{ExperimentError, Result};
use crate::model::ModelKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hyperparameters of one experiment.
///
/// Built once and passed by value into each model; there are no shared presets
/// that a run could mutate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSetup {
    /// Adam learning rate
    pub learning_rate: f64,
    /// Training stops only once the epoch loss is below this
    pub max_loss: f64,
    /// ...and the improvement over the previous epoch is below this
    pub max_pace: f64,
    /// L2 weight decay
    pub ridge: f64,
    /// Mini-batch size
    pub batch_size: usize,
    /// Hidden units per LSTM direction
    pub hidden_size: usize,
    /// Upper bound on training epochs
    pub epochs: usize,
    /// Keep probability of the dropout layer
    pub dropout: f64,
    /// Log the monitoring loss every this many epochs
    pub output_n_epochs: usize,
    /// Seed for mini-batch shuffling
    pub seed: u64,
}

impl Default for ExperimentSetup {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            max_loss: 2.0,
            max_pace: 0.01,
            ridge: 0.01,
            batch_size: 16,
            hidden_size: 128,
            epochs: 40,
            dropout: 1.0,
            output_n_epochs: 1,
            seed: 2026,
        }
    }
}

impl ExperimentSetup {
    pub fn logistic() -> Self {
        Self {
            learning_rate: 0.01,
            max_loss: 2.0,
            max_pace: 1e-4,
            ridge: 1e-4,
            ..Default::default()
        }
    }

    pub fn bi_lstm() -> Self {
        Self {
            learning_rate: 0.01,
            max_loss: 0.08,
            max_pace: 0.01,
            ridge: 1e-3,
            ..Default::default()
        }
    }

    pub fn attention_bi_lstm() -> Self {
        Self {
            learning_rate: 1e-3,
            max_loss: 0.08,
            max_pace: 1e-3,
            ridge: 1e-3,
            ..Default::default()
        }
    }

    pub fn self_attention_bi_lstm() -> Self {
        Self {
            learning_rate: 0.01,
            max_loss: 0.08,
            max_pace: 1e-3,
            ridge: 1e-3,
            ..Default::default()
        }
    }

    /// Preset tuned for `kind`
    pub fn for_model(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Logistic => Self::logistic(),
            ModelKind::BiLstm => Self::bi_lstm(),
            ModelKind::AttentionBiLstm => Self::attention_bi_lstm(),
            ModelKind::SelfAttentionBiLstm => Self::self_attention_bi_lstm(),
        }
    }

    /// Read a setup from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let setup: Self = serde_json::from_str(&text)?;
        setup.validate()?;
        Ok(setup)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.dropout > 0.0 && self.dropout <= 1.0) {
            return Err(ExperimentError::config(format!(
                "dropout keep probability must lie in (0, 1], got {}",
                self.dropout
            )));
        }
        if self.batch_size == 0 || self.epochs == 0 || self.hidden_size == 0 {
            return Err(ExperimentError::config(
                "batch_size, epochs and hidden_size must be positive",
            ));
        }
        if self.learning_rate <= 0.0 {
            return Err(ExperimentError::config("learning_rate must be positive"));
        }
        Ok(())
    }

    /// Drop probability handed to the dropout layer
    pub fn drop_probability(&self) -> f64 {
        1.0 - self.dropout
    }
}

/// Loss history of one fit
#[derive(Debug, Clone, Default)]
pub struct TrainingState {
    /// Completed epochs
    pub epoch: usize,
    /// Mean training loss per epoch
    pub train_loss_history: Vec<f64>,
    /// Monitoring loss on the held-out set, when evaluated
    pub monitor_loss_history: Vec<(usize, f64)>,
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished epoch
    pub fn update_epoch(&mut self, train_loss: f64) {
        self.epoch += 1;
        self.train_loss_history.push(train_loss);
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.train_loss_history.last().copied()
    }

    /// Converged: loss below `max_loss` and moving less than `max_pace`
    pub fn should_stop(&self, max_loss: f64, max_pace: f64) -> bool {
        match self.train_loss_history.as_slice() {
            [.., previous, last] => *last < max_loss && (previous - last).abs() < max_pace,
            _ => false,
        }
    }
}
