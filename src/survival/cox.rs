//! Ridge-penalised Cox proportional hazards.
//!
//! Minimises the mean negative Breslow partial log-likelihood plus
//! `penalizer / 2 * |beta|^2` over standardised features by gradient descent with
//! a backtracking step.

use crate::error::{ExperimentError, Result};
use crate::survival::{Standardizer, SurvivalData, SurvivalModel};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoxConfig {
    pub penalizer: f64,
    pub max_iter: usize,
    /// Stop once the objective improves by less than this
    pub tol: f64,
}

impl Default for CoxConfig {
    fn default() -> Self {
        Self {
            penalizer: 100.0,
            max_iter: 500,
            tol: 1e-9,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoxModel {
    config: CoxConfig,
    standardizer: Option<Standardizer>,
    beta: Option<Array1<f64>>,
}

impl CoxModel {
    pub fn new(config: CoxConfig) -> Self {
        Self {
            config,
            standardizer: None,
            beta: None,
        }
    }

    /// Coefficients on the standardised feature scale
    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.beta.as_ref()
    }
}

impl SurvivalModel for CoxModel {
    fn name(&self) -> &str {
        "cox"
    }

    fn fit(&mut self, data: &SurvivalData) -> Result<()> {
        if data.event_count() == 0 {
            return Err(ExperimentError::model("cox regression needs at least one event"));
        }
        let standardizer = Standardizer::fit(&data.features);
        let x = standardizer.transform(&data.features)?;
        let times: Vec<f64> = data.times.iter().map(|&t| t as f64).collect();
        let events: Vec<bool> = data.events.iter().map(|&e| e == 1).collect();
        let likelihood = PartialLikelihood::new(&x, &times, &events, self.config.penalizer);

        let mut beta = Array1::<f64>::zeros(x.ncols());
        let (mut value, mut gradient) = likelihood.evaluate(&beta);
        let mut step = 1.0f64;
        let mut converged = false;

        for iteration in 0..self.config.max_iter {
            let slope = gradient.dot(&gradient);
            if slope.sqrt() < self.config.tol {
                converged = true;
                break;
            }
            // Armijo backtracking
            let mut accepted = None;
            while step > 1e-12 {
                let candidate = &beta - &(&gradient * step);
                let (candidate_value, candidate_gradient) = likelihood.evaluate(&candidate);
                if candidate_value <= value - 0.5 * step * slope {
                    accepted = Some((candidate, candidate_value, candidate_gradient));
                    break;
                }
                step *= 0.5;
            }
            let Some((next, next_value, next_gradient)) = accepted else {
                converged = true;
                break;
            };
            let improvement = value - next_value;
            beta = next;
            value = next_value;
            gradient = next_gradient;
            step = (step * 2.0).min(1.0 / self.config.penalizer.max(1e-3));
            if improvement < self.config.tol {
                debug!("Cox converged after {} iterations", iteration + 1);
                converged = true;
                break;
            }
        }
        if !converged {
            warn!("Cox fit stopped after {} iterations without converging", self.config.max_iter);
        }

        info!(
            "Fitted cox on {} rows ({} events), objective={:.6}",
            data.len(),
            data.event_count(),
            value
        );
        self.standardizer = Some(standardizer);
        self.beta = Some(beta);
        Ok(())
    }

    fn risk(&self, features: &Array2<f32>) -> Result<Array1<f64>> {
        let (standardizer, beta) = match (&self.standardizer, &self.beta) {
            (Some(s), Some(b)) => (s, b),
            _ => return Err(ExperimentError::model("cox model must be fitted before scoring")),
        };
        Ok(standardizer.transform(features)?.dot(beta))
    }
}

/// Penalised mean negative partial log-likelihood with Breslow ties
struct PartialLikelihood<'a> {
    x: &'a Array2<f64>,
    times: &'a [f64],
    events: &'a [bool],
    /// Rows by descending time
    order: Vec<usize>,
    penalizer: f64,
}

impl<'a> PartialLikelihood<'a> {
    fn new(x: &'a Array2<f64>, times: &'a [f64], events: &'a [bool], penalizer: f64) -> Self {
        let mut order: Vec<usize> = (0..times.len()).collect();
        order.sort_by(|&a, &b| times[b].total_cmp(&times[a]));
        Self {
            x,
            times,
            events,
            order,
            penalizer,
        }
    }

    fn evaluate(&self, beta: &Array1<f64>) -> (f64, Array1<f64>) {
        let eta = self.x.dot(beta);
        let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let n = self.times.len() as f64;

        let mut s0 = 0.0f64;
        let mut s1 = Array1::<f64>::zeros(beta.len());
        let mut value = 0.0f64;
        let mut gradient = Array1::<f64>::zeros(beta.len());

        let mut start = 0;
        while start < self.order.len() {
            let time = self.times[self.order[start]];
            let mut end = start;
            while end < self.order.len() && self.times[self.order[end]] == time {
                let i = self.order[end];
                let w = (eta[i] - shift).exp();
                s0 += w;
                s1.scaled_add(w, &self.x.row(i));
                end += 1;
            }
            // every row tied at `time` shares the same risk set
            for &i in &self.order[start..end] {
                if self.events[i] {
                    value += s0.ln() + shift - eta[i];
                    gradient += &(&s1 / s0);
                    gradient -= &self.x.row(i);
                }
            }
            start = end;
        }

        value = value / n + 0.5 * self.penalizer * beta.dot(beta);
        gradient = gradient / n + beta * self.penalizer;
        (value, gradient)
    }
}
