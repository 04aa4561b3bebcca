//! Pooled-prediction evaluation.
//!
//! The ROC curve drives everything: AUC is its trapezoidal area and the single
//! decision threshold is the point maximising Youden's J (`tpr - fpr`). All point
//! metrics and the per-sample outcome grouping use that threshold.

pub mod report;

use crate::error::{ExperimentError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info};

/// ROC curve points in descending-threshold order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub thresholds: Vec<f64>,
}

impl RocCurve {
    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    /// Trapezoidal area under the curve
    pub fn auc(&self) -> f64 {
        self.fpr
            .windows(2)
            .zip(self.tpr.windows(2))
            .map(|(x, y)| (x[1] - x[0]) * (y[1] + y[0]) / 2.0)
            .sum()
    }

    /// Index of the first point maximising `tpr - fpr`
    pub fn youden_index(&self) -> usize {
        let mut best = 0;
        let mut best_j = f64::NEG_INFINITY;
        for (i, (tpr, fpr)) in self.tpr.iter().zip(self.fpr.iter()).enumerate() {
            let j = tpr - fpr;
            if j > best_j {
                best_j = j;
                best = i;
            }
        }
        best
    }
}

/// Compute the ROC curve of `scores` against binary `labels`.
///
/// The first point is `(0, 0)` at threshold `max(score) + 1`; every distinct
/// score then contributes one point. Fails with `MetricUndefined` when only one
/// class is present.
pub fn roc_curve(labels: &[u8], scores: &[f32]) -> Result<RocCurve> {
    if labels.len() != scores.len() {
        return Err(ExperimentError::shape(format!(
            "{} labels but {} scores",
            labels.len(),
            scores.len()
        )));
    }
    if scores.iter().any(|s| s.is_nan()) {
        return Err(ExperimentError::shape("scores contain NaN"));
    }
    let positives = labels.iter().filter(|&&l| l == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(ExperimentError::MetricUndefined(format!(
            "AUC needs both classes, got {} positive and {} negative samples",
            positives, negatives
        )));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));

    let max_score = scores[order[0]] as f64;
    let mut roc = RocCurve {
        fpr: vec![0.0],
        tpr: vec![0.0],
        thresholds: vec![max_score + 1.0],
    };

    let (mut tp, mut fp) = (0usize, 0usize);
    let mut i = 0;
    while i < order.len() {
        let threshold = scores[order[i]];
        while i < order.len() && scores[order[i]] == threshold {
            if labels[order[i]] == 1 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        roc.fpr.push(fp as f64 / negatives as f64);
        roc.tpr.push(tp as f64 / positives as f64);
        roc.thresholds.push(threshold as f64);
    }
    Ok(roc)
}

/// Classification outcome of one sample at the decision threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Outcome {
    FalsePositive,
    TrueNegative,
    FalseNegative,
    TruePositive,
}

impl Outcome {
    pub const ALL: [Outcome; 4] = [
        Outcome::FalsePositive,
        Outcome::TrueNegative,
        Outcome::FalseNegative,
        Outcome::TruePositive,
    ];

    pub fn classify(label: u8, prediction: u8) -> Self {
        match (label, prediction) {
            (0, 1) => Outcome::FalsePositive,
            (0, _) => Outcome::TrueNegative,
            (_, 0) => Outcome::FalseNegative,
            _ => Outcome::TruePositive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::FalsePositive => "FP",
            Outcome::TrueNegative => "TN",
            Outcome::FalseNegative => "FN",
            Outcome::TruePositive => "TP",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confusion counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
    pub true_positive: usize,
}

impl ConfusionCounts {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::FalsePositive => self.false_positive += 1,
            Outcome::TrueNegative => self.true_negative += 1,
            Outcome::FalseNegative => self.false_negative += 1,
            Outcome::TruePositive => self.true_positive += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.false_positive + self.true_negative + self.false_negative + self.true_positive
    }

    pub fn get(&self, outcome: Outcome) -> usize {
        match outcome {
            Outcome::FalsePositive => self.false_positive,
            Outcome::TrueNegative => self.true_negative,
            Outcome::FalseNegative => self.false_negative,
            Outcome::TruePositive => self.true_positive,
        }
    }
}

/// Point metrics at the decision threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    /// `None` when nothing is predicted positive
    pub precision: Option<f64>,
    pub recall: f64,
    /// `None` when precision is undefined
    pub f1: Option<f64>,
    pub counts: ConfusionCounts,
}

impl ClassificationMetrics {
    pub fn from_counts(counts: ConfusionCounts) -> Result<Self> {
        let total = counts.total();
        let actual_positive = counts.true_positive + counts.false_negative;
        if total == 0 || actual_positive == 0 {
            return Err(ExperimentError::MetricUndefined(
                "recall needs at least one positive sample".to_string(),
            ));
        }
        let accuracy = (counts.true_positive + counts.true_negative) as f64 / total as f64;
        let recall = counts.true_positive as f64 / actual_positive as f64;
        let predicted_positive = counts.true_positive + counts.false_positive;
        let precision = (predicted_positive > 0).then(|| counts.true_positive as f64 / predicted_positive as f64);
        let f1 = precision.and_then(|p| {
            let denom = p + recall;
            (denom > 0.0).then(|| 2.0 * p * recall / denom)
        });
        Ok(Self {
            accuracy,
            precision,
            recall,
            f1,
            counts,
        })
    }
}

/// One pooled sample after thresholding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleOutcome {
    /// Row of the flattened cohort this prediction belongs to
    pub test_index: usize,
    pub label: u8,
    pub score: f32,
    pub prediction: u8,
    pub outcome: Outcome,
}

/// Full evaluation of a pooled prediction set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub auc: f64,
    pub threshold: f64,
    pub metrics: ClassificationMetrics,
    pub roc: RocCurve,
    pub samples: Vec<SampleOutcome>,
}

impl Evaluation {
    /// Sample indices grouped by outcome, groups in FP, TN, FN, TP order
    pub fn groups(&self) -> Vec<(Outcome, Vec<usize>)> {
        Outcome::ALL
            .iter()
            .map(|&outcome| {
                let members = self
                    .samples
                    .iter()
                    .filter(|s| s.outcome == outcome)
                    .map(|s| s.test_index)
                    .collect();
                (outcome, members)
            })
            .collect()
    }
}

/// Evaluate pooled `(index, label, score)` triples
pub fn evaluate(indices: &[usize], labels: &[u8], scores: &[f32]) -> Result<Evaluation> {
    if indices.len() != labels.len() {
        return Err(ExperimentError::shape(format!(
            "{} indices but {} labels",
            indices.len(),
            labels.len()
        )));
    }
    let roc = roc_curve(labels, scores)?;
    let auc = roc.auc();
    let best = roc.youden_index();
    let threshold = roc.thresholds[best];
    debug!(
        "Youden point {} of {}: tpr {:.4}, fpr {:.4}",
        best,
        roc.len(),
        roc.tpr[best],
        roc.fpr[best]
    );

    let mut counts = ConfusionCounts::default();
    let samples: Vec<SampleOutcome> = indices
        .iter()
        .zip(labels.iter())
        .zip(scores.iter())
        .map(|((&test_index, &label), &score)| {
            let prediction = (score as f64 >= threshold) as u8;
            let outcome = Outcome::classify(label, prediction);
            counts.add(outcome);
            SampleOutcome {
                test_index,
                label,
                score,
                prediction,
                outcome,
            }
        })
        .collect();

    let metrics = ClassificationMetrics::from_counts(counts)?;
    info!(
        "AUC {:.4}, threshold {:.4}, accuracy {:.4}, recall {:.4}",
        auc, threshold, metrics.accuracy, metrics.recall
    );
    Ok(Evaluation {
        auc,
        threshold,
        metrics,
        roc,
        samples,
    })
}
