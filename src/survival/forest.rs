//! Random survival forest.
//!
//! Each tree grows on a bootstrap sample. Nodes split at the median of one of a
//! random subset of features, keeping the split with the largest log-rank
//! statistic. Leaves hold the Nelson–Aalen cumulative hazard on the grid of
//! training event times, and a row's risk is the forest-averaged cumulative
//! hazard summed over that grid.

use crate::error::{ExperimentError, Result};
use crate::survival::{concordance_index, SurvivalData, SurvivalModel};
use ndarray::{Array1, Array2, ArrayView1};
use rand::seq::index::sample;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub trees: usize,
    /// Nodes with at most this many rows become leaves
    pub min_node_size: usize,
    /// Features tried per split, `sqrt(F)` when unset
    pub max_features: Option<usize>,
    pub max_depth: usize,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            trees: 10,
            min_node_size: 5,
            max_features: None,
            max_depth: 32,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        hazard: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn leaf(&self, row: ArrayView1<f32>) -> &[f64] {
        let mut node = self;
        loop {
            match node {
                Node::Leaf { hazard } => return hazard,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RandomSurvivalForest {
    config: ForestConfig,
    num_features: usize,
    /// Distinct training event times, ascending
    grid: Vec<f32>,
    trees: Vec<Node>,
    oob_score: Option<f64>,
}

impl RandomSurvivalForest {
    pub fn new(config: ForestConfig) -> Self {
        Self {
            config,
            num_features: 0,
            grid: Vec::new(),
            trees: Vec::new(),
            oob_score: None,
        }
    }

    /// Out-of-bag concordance of the last fit, when defined
    pub fn oob_score(&self) -> Option<f64> {
        self.oob_score
    }

    /// Forest-averaged cumulative hazard of one row on the event-time grid
    pub fn cumulative_hazard(&self, row: ArrayView1<f32>) -> Result<Vec<f64>> {
        if self.trees.is_empty() {
            return Err(ExperimentError::model("forest must be fitted before scoring"));
        }
        let mut hazard = vec![0.0f64; self.grid.len()];
        for tree in &self.trees {
            for (h, &leaf) in hazard.iter_mut().zip(tree.leaf(row)) {
                *h += leaf;
            }
        }
        let n = self.trees.len() as f64;
        Ok(hazard.into_iter().map(|h| h / n).collect())
    }

    pub fn grid(&self) -> &[f32] {
        &self.grid
    }
}

impl SurvivalModel for RandomSurvivalForest {
    fn name(&self) -> &str {
        "rsf"
    }

    fn fit(&mut self, data: &SurvivalData) -> Result<()> {
        if data.event_count() == 0 {
            return Err(ExperimentError::model("survival forest needs at least one event"));
        }
        if self.config.trees == 0 {
            return Err(ExperimentError::config("survival forest needs at least one tree"));
        }
        let n = data.len();
        let num_features = data.num_features();
        if num_features == 0 {
            return Err(ExperimentError::shape("survival forest needs at least one feature"));
        }
        let mtry = self
            .config
            .max_features
            .unwrap_or_else(|| (num_features as f64).sqrt() as usize)
            .clamp(1, num_features.max(1));

        let mut grid: Vec<f32> = data
            .times
            .iter()
            .zip(data.events.iter())
            .filter(|(_, &e)| e == 1)
            .map(|(&t, _)| t)
            .collect();
        grid.sort_by(f32::total_cmp);
        grid.dedup();

        let builder = TreeBuilder {
            data,
            grid: &grid,
            mtry,
            min_node_size: self.config.min_node_size.max(1),
            max_depth: self.config.max_depth,
        };

        let mut trees = Vec::with_capacity(self.config.trees);
        let mut oob_sum = vec![0.0f64; n];
        let mut oob_count = vec![0usize; n];
        for t in 0..self.config.trees {
            let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(t as u64));
            let mut in_bag = vec![false; n];
            let rows: Vec<usize> = (0..n)
                .map(|_| {
                    let r = rng.gen_range(0..n);
                    in_bag[r] = true;
                    r
                })
                .collect();
            let tree = builder.grow(rows, 0, &mut rng);
            for (i, _) in in_bag.iter().enumerate().filter(|(_, &b)| !b) {
                oob_sum[i] += tree.leaf(data.features.row(i)).iter().sum::<f64>();
                oob_count[i] += 1;
            }
            trees.push(tree);
        }

        self.num_features = num_features;
        self.grid = grid;
        self.trees = trees;
        self.oob_score = oob_concordance(data, &oob_sum, &oob_count);
        match self.oob_score {
            Some(score) => info!("Fitted {} survival trees, oob c-index={:.4}", self.config.trees, score),
            None => info!("Fitted {} survival trees", self.config.trees),
        }
        Ok(())
    }

    fn risk(&self, features: &Array2<f32>) -> Result<Array1<f64>> {
        if features.ncols() != self.num_features {
            return Err(ExperimentError::shape(format!(
                "expected {} features, got {}",
                self.num_features,
                features.ncols()
            )));
        }
        features
            .rows()
            .into_iter()
            .map(|row| Ok(self.cumulative_hazard(row)?.iter().sum()))
            .collect::<Result<Vec<f64>>>()
            .map(Array1::from_vec)
    }
}

fn oob_concordance(data: &SurvivalData, sums: &[f64], counts: &[usize]) -> Option<f64> {
    let mut times = Vec::new();
    let mut risk = Vec::new();
    let mut events = Vec::new();
    for i in 0..data.len() {
        if counts[i] > 0 {
            times.push(data.times[i]);
            risk.push(sums[i] / counts[i] as f64);
            events.push(data.events[i]);
        }
    }
    concordance_index(&times, &risk, &events).ok()
}

struct TreeBuilder<'a> {
    data: &'a SurvivalData,
    grid: &'a [f32],
    mtry: usize,
    min_node_size: usize,
    max_depth: usize,
}

impl TreeBuilder<'_> {
    fn grow(&self, rows: Vec<usize>, depth: usize, rng: &mut ChaCha8Rng) -> Node {
        let has_event = rows.iter().any(|&r| self.data.events[r] == 1);
        if rows.len() <= self.min_node_size || depth >= self.max_depth || !has_event {
            return self.leaf(&rows);
        }

        let mut best: Option<(f64, usize, f32)> = None;
        for feature in sample(rng, self.data.num_features(), self.mtry).into_iter() {
            let mut values: Vec<f32> = rows.iter().map(|&r| self.data.features[[r, feature]]).collect();
            let threshold = median(&mut values);
            let (left, right): (Vec<usize>, Vec<usize>) = rows
                .iter()
                .partition(|&&r| self.data.features[[r, feature]] <= threshold);
            if left.is_empty() || right.is_empty() {
                continue;
            }
            let statistic = log_rank(self.data, &left, &right);
            if statistic > best.map_or(0.0, |(s, _, _)| s) {
                best = Some((statistic, feature, threshold));
            }
        }

        let Some((statistic, feature, threshold)) = best else {
            return self.leaf(&rows);
        };
        debug!("Split on feature {} at {} (log-rank {:.3})", feature, threshold, statistic);
        let (left, right): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&r| self.data.features[[r, feature]] <= threshold);
        Node::Split {
            feature,
            threshold,
            left: Box::new(self.grow(left, depth + 1, rng)),
            right: Box::new(self.grow(right, depth + 1, rng)),
        }
    }

    fn leaf(&self, rows: &[usize]) -> Node {
        Node::Leaf {
            hazard: nelson_aalen(self.data, rows, self.grid),
        }
    }
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_by(f32::total_cmp);
    let n = values.len();
    if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    }
}

/// `(time, deaths, leaving)` per distinct time, ascending
fn time_groups(data: &SurvivalData, rows: &[usize]) -> Vec<(f32, usize, usize)> {
    let mut sorted: Vec<(f32, u8)> = rows.iter().map(|&r| (data.times[r], data.events[r])).collect();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut groups: Vec<(f32, usize, usize)> = Vec::new();
    for (time, event) in sorted {
        match groups.last_mut() {
            Some(last) if last.0 == time => {
                last.1 += event as usize;
                last.2 += 1;
            }
            _ => groups.push((time, event as usize, 1)),
        }
    }
    groups
}

/// Cumulative hazard of `rows` evaluated at each grid time
fn nelson_aalen(data: &SurvivalData, rows: &[usize], grid: &[f32]) -> Vec<f64> {
    let mut at_risk = rows.len();
    let mut cumulative = 0.0f64;
    let mut steps: Vec<(f32, f64)> = Vec::new();
    for (time, deaths, leaving) in time_groups(data, rows) {
        if deaths > 0 {
            cumulative += deaths as f64 / at_risk as f64;
            steps.push((time, cumulative));
        }
        at_risk -= leaving;
    }

    let mut hazard = Vec::with_capacity(grid.len());
    let mut step = 0;
    let mut current = 0.0f64;
    for &g in grid {
        while step < steps.len() && steps[step].0 <= g {
            current = steps[step].1;
            step += 1;
        }
        hazard.push(current);
    }
    hazard
}

/// Standardised two-sample log-rank statistic `|O - E| / sqrt(V)`
fn log_rank(data: &SurvivalData, left: &[usize], right: &[usize]) -> f64 {
    let mut all: Vec<(f32, u8, bool)> = left
        .iter()
        .map(|&r| (data.times[r], data.events[r], true))
        .chain(right.iter().map(|&r| (data.times[r], data.events[r], false)))
        .collect();
    all.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut at_risk_left = left.len() as f64;
    let mut at_risk = all.len() as f64;
    let mut observed_minus_expected = 0.0f64;
    let mut variance = 0.0f64;

    let mut start = 0;
    while start < all.len() {
        let time = all[start].0;
        let mut end = start;
        let (mut deaths, mut deaths_left, mut leaving_left) = (0.0f64, 0.0f64, 0.0f64);
        while end < all.len() && all[end].0 == time {
            let (_, event, is_left) = all[end];
            deaths += event as f64;
            if is_left {
                deaths_left += event as f64;
                leaving_left += 1.0;
            }
            end += 1;
        }
        if deaths > 0.0 && at_risk > 1.0 {
            let share = at_risk_left / at_risk;
            observed_minus_expected += deaths_left - deaths * share;
            variance += deaths * share * (1.0 - share) * (at_risk - deaths) / (at_risk - 1.0);
        }
        at_risk -= (end - start) as f64;
        at_risk_left -= leaving_left;
        start = end;
    }

    if variance <= 0.0 {
        0.0
    } else {
        observed_minus_expected.abs() / variance.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_groups() -> SurvivalData {
        // feature 0 marks a high-hazard group with early events
        let n = 60;
        let features = Array2::from_shape_fn((n, 3), |(i, f)| match f {
            0 => (i % 2) as f32,
            1 => ((i * 7) % 11) as f32,
            _ => ((i * 3) % 5) as f32,
        });
        let times = Array1::from_shape_fn(n, |i| if i % 2 == 1 { 1.0 + (i % 7) as f32 } else { 20.0 + (i % 9) as f32 });
        let events = Array1::from_shape_fn(n, |i| (i % 6 != 0) as u8);
        SurvivalData::new(features, times, events).unwrap()
    }

    #[test]
    fn test_nelson_aalen_by_hand() {
        let data = SurvivalData::new(
            Array2::zeros((4, 1)),
            array![1.0, 2.0, 2.0, 3.0],
            array![1, 1, 0, 1],
        )
        .unwrap();
        let hazard = nelson_aalen(&data, &[0, 1, 2, 3], &[0.5, 1.0, 2.0, 3.0]);
        let expected = [0.0, 0.25, 0.25 + 1.0 / 3.0, 0.25 + 1.0 / 3.0 + 1.0];
        for (h, e) in hazard.iter().zip(expected) {
            assert_abs_diff_eq!(*h, e, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_log_rank_separates_groups() {
        let data = two_groups();
        let high: Vec<usize> = (0..60).filter(|i| i % 2 == 1).collect();
        let low: Vec<usize> = (0..60).filter(|i| i % 2 == 0).collect();
        let mixed_a: Vec<usize> = (0..30).collect();
        let mixed_b: Vec<usize> = (30..60).collect();
        assert!(log_rank(&data, &high, &low) > log_rank(&data, &mixed_a, &mixed_b));
        assert_eq!(log_rank(&data, &[0], &[2]), 0.0);
    }

    #[test]
    fn test_forest_ranks_high_hazard_group() {
        let data = two_groups();
        let mut forest = RandomSurvivalForest::new(ForestConfig {
            max_features: Some(3),
            ..Default::default()
        });
        forest.fit(&data).unwrap();
        let risk = forest.risk(&data.features).unwrap();
        let high: f64 = (0..60).filter(|i| i % 2 == 1).map(|i| risk[i]).sum::<f64>() / 30.0;
        let low: f64 = (0..60).filter(|i| i % 2 == 0).map(|i| risk[i]).sum::<f64>() / 30.0;
        assert!(high > low);

        let oob = forest.oob_score().unwrap();
        assert!((0.0..=1.0).contains(&oob));
    }

    #[test]
    fn test_seeded_forest_is_reproducible() {
        let data = two_groups();
        let mut a = RandomSurvivalForest::new(ForestConfig::default());
        let mut b = RandomSurvivalForest::new(ForestConfig::default());
        a.fit(&data).unwrap();
        b.fit(&data).unwrap();
        assert_eq!(a.risk(&data.features).unwrap(), b.risk(&data.features).unwrap());
        assert_eq!(a.grid(), b.grid());
    }

    #[test]
    fn test_unfitted_forest() {
        let forest = RandomSurvivalForest::new(ForestConfig::default());
        assert!(forest.risk(&Array2::zeros((1, 0))).is_err());
        assert!(forest.cumulative_hazard(array![1.0f32].view()).is_err());
    }
}
