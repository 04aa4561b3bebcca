use burn::prelude::*;

/// Network dimensions shared by every model variant
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Number of features per visit
    pub num_features: usize,

    /// Visits per sequence (1 for the flat layout)
    #[config(default = "5")]
    pub time_steps: usize,

    /// Hidden units per LSTM direction
    #[config(default = "128")]
    pub hidden_size: usize,

    /// Drop probability applied after the recurrent layer
    #[config(default = "0.0")]
    pub dropout: f64,
}
