//! Error taxonomy for experiments, resampling, evaluation and staging.

/// Result type for stagecv operations
pub type Result<T> = std::result::Result<T, ExperimentError>;

/// Main error type for stagecv
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cannot form {folds} non-empty folds from {patients} patients")]
    TooFewPatients { patients: usize, folds: usize },

    #[error("Insufficient minority samples for oversampling: {minority} available, {required} required")]
    InsufficientMinority { minority: usize, required: usize },

    #[error("Metric undefined: {0}")]
    MetricUndefined(String),

    #[error("Stage '{stage}' requires artifact '{artifact}', which has not been produced")]
    MissingArtifact { artifact: String, stage: String },

    #[error("Stage '{stage}' reads '{artifact}', which was derived from an older '{input}'; rerun its producer first")]
    StaleArtifact {
        artifact: String,
        input: String,
        stage: String,
    },

    #[error("Model '{model}' does not support {capability}")]
    Unsupported { model: String, capability: String },

    #[error("Model failure: {0}")]
    Model(String),

    #[error("Failed to release model resources: {0}")]
    Release(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Artifact encoding error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl ExperimentError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        ExperimentError::Shape(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ExperimentError::Config(msg.into())
    }

    pub(crate) fn model(msg: impl std::fmt::Display) -> Self {
        ExperimentError::Model(msg.to_string())
    }
}
