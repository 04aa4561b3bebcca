pub mod checkpoint;
mod config;
pub mod network;
pub mod neural;

use crate::data::{DataSet, SampleLayout};
use crate::error::{ExperimentError, Result};
use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use ndarray::{Array, Array3, Dimension};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use config::ModelConfig;
pub use neural::{AttentionBiLstmModel, BiLstmModel, LogisticModel, NetworkModel, SelfAttentionBiLstmModel};

/// Backend used while fitting
pub type TrainBackend = Autodiff<NdArray<f32>>;

/// Backend used for prediction and attention analysis
pub type InferenceBackend = NdArray<f32>;

/// Scores with the same shape as a layout's labels
pub type Scores<L> = Array<f32, <L as Dimension>::Smaller>;

/// Output of an attention analysis run
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Predicted outcome probability per visit `[patients, visits]`
    pub scores: ndarray::Array2<f32>,
    /// Attention weight per visit and feature `[patients, visits, features]`
    pub weights: Array3<f32>,
}

/// Capability interface every experiment model exposes.
///
/// A model is fitted once per fold; `fit` must start from fresh parameters so no
/// state leaks between folds. `close` releases whatever the model holds and is
/// called exactly once by the runner.
pub trait SequenceModel {
    /// Sample layout the model consumes
    type Layout: SampleLayout;

    fn name(&self) -> &str;

    /// Train on `train`; `test` is only used to monitor progress
    fn fit(&mut self, train: &DataSet<Self::Layout>, test: &DataSet<Self::Layout>) -> Result<()>;

    /// Outcome probabilities shaped like the labels of `test`
    fn predict(&mut self, test: &DataSet<Self::Layout>) -> Result<Scores<Self::Layout>>;

    /// Load `checkpoint` and report scores and per-feature attention for `features`
    fn attention_analysis(&mut self, _features: &Array3<f32>, _checkpoint: &Path) -> Result<AttentionOutput> {
        Err(ExperimentError::Unsupported {
            model: self.name().to_string(),
            capability: "attention analysis".to_string(),
        })
    }

    /// Checkpoint written by the fit of `fold`, if the model persists one
    fn checkpoint_path(&self, _fold: usize) -> Option<std::path::PathBuf> {
        None
    }

    fn close(&mut self) -> Result<()>;
}

/// Model variants selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Logistic,
    BiLstm,
    AttentionBiLstm,
    SelfAttentionBiLstm,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Logistic => "logistic",
            ModelKind::BiLstm => "bi_lstm",
            ModelKind::AttentionBiLstm => "attention_bi_lstm",
            ModelKind::SelfAttentionBiLstm => "self_attention_bi_lstm",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
