//! Burn networks behind the model variants.
//!
//! Every network maps `[batch, steps, features]` to one logit per step,
//! `[batch, steps]`. The flat layout is fed as single-step sequences.

use crate::data::SampleLayout;
use crate::model::ModelConfig;
use burn::nn::{BiLstm, BiLstmConfig, Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use ndarray::{Ix2, Ix3};

/// A network producing per-step outcome logits
pub trait ScoringNetwork<B: Backend>: Module<B> {
    fn logits(&self, input: Tensor<B, 3>) -> Tensor<B, 2>;
}

/// Static description of one model variant
pub trait Architecture {
    /// Name used in logs and checkpoint files
    const NAME: &'static str;

    /// Whether [`Architecture::attention`] yields per-feature weights
    const FEATURE_ATTENTION: bool = false;

    type Layout: SampleLayout;
    type Net<B: Backend>: ScoringNetwork<B>;

    fn init<B: Backend>(config: &ModelConfig, device: &B::Device) -> Self::Net<B>;

    /// Per-feature attention `[batch, steps, features]`, when the network has it
    fn attention<B: Backend>(_net: &Self::Net<B>, _input: Tensor<B, 3>) -> Option<Tensor<B, 3>> {
        None
    }
}

/// Logistic regression over visit rows
#[derive(Module, Debug)]
pub struct LogisticNet<B: Backend> {
    linear: Linear<B>,
}

impl<B: Backend> ScoringNetwork<B> for LogisticNet<B> {
    fn logits(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        self.linear.forward(input).squeeze::<2>(2)
    }
}

/// Bidirectional LSTM with a per-visit output head
#[derive(Module, Debug)]
pub struct BiLstmNet<B: Backend> {
    lstm: BiLstm<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> ScoringNetwork<B> for BiLstmNet<B> {
    fn logits(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let (hidden, _) = self.lstm.forward(input, None);
        let hidden = self.dropout.forward(hidden);
        self.output.forward(hidden).squeeze::<2>(2)
    }
}

/// Bidirectional LSTM over inputs re-weighted by a softmax over features
#[derive(Module, Debug)]
pub struct AttentionBiLstmNet<B: Backend> {
    attention: Linear<B>,
    lstm: BiLstm<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> AttentionBiLstmNet<B> {
    /// Feature attention, each visit's weights sum to one
    pub fn attention_weights(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        softmax(self.attention.forward(input), 2)
    }
}

impl<B: Backend> ScoringNetwork<B> for AttentionBiLstmNet<B> {
    fn logits(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let weights = self.attention_weights(input.clone());
        let (hidden, _) = self.lstm.forward(input * weights, None);
        let hidden = self.dropout.forward(hidden);
        self.output.forward(hidden).squeeze::<2>(2)
    }
}

/// Bidirectional LSTM followed by scaled dot-product attention across visits
#[derive(Module, Debug)]
pub struct SelfAttentionBiLstmNet<B: Backend> {
    lstm: BiLstm<B>,
    query: Linear<B>,
    key: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> ScoringNetwork<B> for SelfAttentionBiLstmNet<B> {
    fn logits(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let (hidden, _) = self.lstm.forward(input, None);
        let scale = 1.0 / (hidden.dims()[2] as f64).sqrt();
        let query = self.query.forward(hidden.clone());
        let key = self.key.forward(hidden.clone());
        // [batch, steps, steps]
        let scores = query.matmul(key.swap_dims(1, 2)).mul_scalar(scale);
        let context = softmax(scores, 2).matmul(hidden);
        let context = self.dropout.forward(context);
        self.output.forward(context).squeeze::<2>(2)
    }
}

pub struct LogisticRegression;

impl Architecture for LogisticRegression {
    const NAME: &'static str = "logistic";
    type Layout = Ix2;
    type Net<B: Backend> = LogisticNet<B>;

    fn init<B: Backend>(config: &ModelConfig, device: &B::Device) -> LogisticNet<B> {
        LogisticNet {
            linear: LinearConfig::new(config.num_features, 1).init(device),
        }
    }
}

pub struct BidirectionalLstm;

impl Architecture for BidirectionalLstm {
    const NAME: &'static str = "bi_lstm";
    type Layout = Ix3;
    type Net<B: Backend> = BiLstmNet<B>;

    fn init<B: Backend>(config: &ModelConfig, device: &B::Device) -> BiLstmNet<B> {
        BiLstmNet {
            lstm: BiLstmConfig::new(config.num_features, config.hidden_size, true).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            output: LinearConfig::new(2 * config.hidden_size, 1).init(device),
        }
    }
}

pub struct AttentionBidirectionalLstm;

impl Architecture for AttentionBidirectionalLstm {
    const NAME: &'static str = "attention_bi_lstm";
    const FEATURE_ATTENTION: bool = true;
    type Layout = Ix3;
    type Net<B: Backend> = AttentionBiLstmNet<B>;

    fn init<B: Backend>(config: &ModelConfig, device: &B::Device) -> AttentionBiLstmNet<B> {
        AttentionBiLstmNet {
            attention: LinearConfig::new(config.num_features, config.num_features).init(device),
            lstm: BiLstmConfig::new(config.num_features, config.hidden_size, true).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            output: LinearConfig::new(2 * config.hidden_size, 1).init(device),
        }
    }

    fn attention<B: Backend>(net: &AttentionBiLstmNet<B>, input: Tensor<B, 3>) -> Option<Tensor<B, 3>> {
        Some(net.attention_weights(input))
    }
}

pub struct SelfAttentionBidirectionalLstm;

impl Architecture for SelfAttentionBidirectionalLstm {
    const NAME: &'static str = "self_attention_bi_lstm";
    type Layout = Ix3;
    type Net<B: Backend> = SelfAttentionBiLstmNet<B>;

    fn init<B: Backend>(config: &ModelConfig, device: &B::Device) -> SelfAttentionBiLstmNet<B> {
        let width = 2 * config.hidden_size;
        SelfAttentionBiLstmNet {
            lstm: BiLstmConfig::new(config.num_features, config.hidden_size, true).init(device),
            query: LinearConfig::new(width, width).init(device),
            key: LinearConfig::new(width, width).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            output: LinearConfig::new(width, 1).init(device),
        }
    }
}
