//! # stagecv: Cross-Validated Outcome Prediction and Attention Staging
//!
//! stagecv trains sequence models on longitudinal patient visits, evaluates them
//! with patient-level cross-validation, and turns learned attention weights into
//! discrete disease stages.
//!
//! ## Features
//!
//! - Five-fold patient-level splits for flat and sequence layouts
//! - SMOTE rebalancing of training folds
//! - Logistic, BiLSTM and attention BiLSTM models on burn
//! - Pooled ROC evaluation at the Youden threshold
//! - Natural-breaks and k-means staging with stage-conditional outcome rates
//! - Cox regression and random survival forests scored by concordance
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use stagecv::data::loader::CohortLoader;
//! use stagecv::experiment::{ExperimentConfig, ExperimentRunner};
//! use stagecv::model::AttentionBiLstmModel;
//! use stagecv::training::ExperimentSetup;
//!
//! let cohort = CohortLoader::new().load("visits.csv").unwrap();
//! let mut model = AttentionBiLstmModel::new(ExperimentSetup::attention_bi_lstm(), "checkpoints").unwrap();
//! let runner = ExperimentRunner::new(ExperimentConfig::default());
//! let (evaluation, _) = runner.run_and_report(&mut model, &cohort).unwrap();
//! println!("AUC {:.3}", evaluation.auc);
//! ```

pub mod cli;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod experiment;
pub mod model;
pub mod staging;
pub mod survival;
pub mod training;
pub mod utils;

/// Re-export commonly used types
pub use data::{Cohort, DataSet};
pub use error::{ExperimentError, Result};
pub use evaluate::Evaluation;
pub use experiment::{ExperimentConfig, ExperimentRunner, PooledPredictions};
pub use model::{InferenceBackend, ModelKind, SequenceModel, TrainBackend};
pub use staging::{BreakpointTable, StageReport, StagingConfig};
pub use training::ExperimentSetup;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!(
        "{} v{} - cross-validated outcome prediction and attention staging",
        NAME, VERSION
    )
}
