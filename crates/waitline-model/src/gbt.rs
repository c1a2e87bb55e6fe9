//! Gradient-boosted regression trees with an absolute-error objective.
//!
//! Each round fits a depth-limited tree to the current residuals on a
//! deterministic row subsample; split structure comes from weighted
//! variance reduction over quantile candidate thresholds, and leaf values
//! are weighted medians of the residuals, which is what makes the ensemble
//! minimize absolute error rather than squared error. Shrinkage applies
//! per round; there is no early stopping.
//!
//! The engine is intentionally self-contained and deterministic: the row
//! subsampler is a seeded xorshift, so a retrain on identical inputs
//! produces an identical model.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::trainer::{Hyperparams, TrainingData};

/// Candidate split thresholds examined per feature per node.
const MAX_THRESHOLDS: usize = 32;

/// One tree node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    /// Internal split: rows with `feature < threshold` go left.
    Split {
        /// Feature index.
        feature: usize,
        /// Split threshold.
        threshold: f64,
        /// Left child index.
        left: usize,
        /// Right child index.
        right: usize,
    },
    /// Terminal value.
    Leaf {
        /// Leaf prediction (residual units).
        value: f64,
    },
}

/// One regression tree as a node arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Predicts one row.
    #[must_use]
    pub fn predict(&self, features: &[f64]) -> f64 {
        let mut at = 0usize;
        loop {
            match &self.nodes[at] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if features.get(*feature).copied().unwrap_or(f64::MIN) < *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

/// A fitted gradient-boosted-tree model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbtModel {
    /// Initial prediction (weighted median of the training target).
    pub base_score: f64,
    /// Shrinkage applied to every tree.
    pub learning_rate: f64,
    /// Feature count the model expects.
    pub n_features: usize,
    /// The ensemble.
    pub trees: Vec<Tree>,
}

impl GbtModel {
    /// Predicts one row.
    #[must_use]
    pub fn predict(&self, features: &[f64]) -> f64 {
        let mut score = self.base_score;
        for tree in &self.trees {
            score += self.learning_rate * tree.predict(features);
        }
        score
    }

    /// Fits the ensemble.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` if there are no training rows.
    pub fn fit(data: &TrainingData<'_>, params: &Hyperparams) -> Result<Self> {
        if data.train_idx.is_empty() {
            return Err(ModelError::insufficient("no training rows"));
        }

        let residual_pairs: Vec<(f64, f64)> = data
            .train_idx
            .iter()
            .map(|&i| (data.target[i], data.weights[i]))
            .collect();
        let base_score = weighted_median(&residual_pairs);

        let mut model = Self {
            base_score,
            learning_rate: params.learning_rate,
            n_features: data.n_features,
            trees: Vec::with_capacity(params.rounds as usize),
        };

        // Current prediction per training row.
        let mut current: Vec<f64> = vec![base_score; data.target.len()];
        let mut rng = Xorshift64::new(0x5DEE_CE66_D1CE_B00Cu64);

        for _round in 0..params.rounds {
            let sample = subsample(data.train_idx, params.subsample, &mut rng);
            if sample.is_empty() {
                continue;
            }
            let residuals: Vec<f64> = data
                .target
                .iter()
                .zip(&current)
                .map(|(y, f)| y - f)
                .collect();

            let mut builder = TreeBuilder {
                data,
                residuals: &residuals,
                max_depth: params.max_depth,
                min_child_weight: params.min_child_weight,
                nodes: Vec::new(),
            };
            builder.build(&sample, 0);
            let tree = Tree {
                nodes: builder.nodes,
            };

            for &i in data.train_idx {
                current[i] += params.learning_rate * tree.predict(data.row(i));
            }
            model.trees.push(tree);
        }
        Ok(model)
    }
}

struct TreeBuilder<'a> {
    data: &'a TrainingData<'a>,
    residuals: &'a [f64],
    max_depth: u32,
    min_child_weight: f64,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    /// Builds the subtree over `rows`, returning the node index.
    fn build(&mut self, rows: &[usize], depth: u32) -> usize {
        let weight_sum: f64 = rows.iter().map(|&i| self.data.weights[i]).sum();
        if depth >= self.max_depth
            || rows.len() < 2
            || weight_sum < 2.0 * self.min_child_weight
        {
            return self.leaf(rows);
        }

        let Some((feature, threshold)) = self.best_split(rows) else {
            return self.leaf(rows);
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .copied()
            .partition(|&i| self.data.row(i)[feature] < threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            return self.leaf(rows);
        }

        let at = self.nodes.len();
        self.nodes.push(Node::Leaf { value: 0.0 }); // placeholder
        let left = self.build(&left_rows, depth + 1);
        let right = self.build(&right_rows, depth + 1);
        self.nodes[at] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        at
    }

    fn leaf(&mut self, rows: &[usize]) -> usize {
        let pairs: Vec<(f64, f64)> = rows
            .iter()
            .map(|&i| (self.residuals[i], self.data.weights[i]))
            .collect();
        let at = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: weighted_median(&pairs),
        });
        at
    }

    /// Best (feature, threshold) by weighted variance reduction, or `None`
    /// when no candidate improves on the parent.
    fn best_split(&self, rows: &[usize]) -> Option<(usize, f64)> {
        let (parent_sse, _) = weighted_sse(rows.iter().map(|&i| {
            (self.residuals[i], self.data.weights[i])
        }));

        let mut best: Option<(f64, usize, f64)> = None;
        for feature in 0..self.data.n_features {
            let mut values: Vec<f64> = rows
                .iter()
                .map(|&i| self.data.row(i)[feature])
                .collect();
            values.sort_by(f64::total_cmp);
            values.dedup();
            if values.len() < 2 {
                continue;
            }

            let step = (values.len() / MAX_THRESHOLDS).max(1);
            for window in values.windows(2).step_by(step) {
                let threshold = (window[0] + window[1]) / 2.0;
                let (left, right): (Vec<usize>, Vec<usize>) = rows
                    .iter()
                    .copied()
                    .partition(|&i| self.data.row(i)[feature] < threshold);
                let left_weight: f64 = left.iter().map(|&i| self.data.weights[i]).sum();
                let right_weight: f64 = right.iter().map(|&i| self.data.weights[i]).sum();
                if left_weight < self.min_child_weight || right_weight < self.min_child_weight {
                    continue;
                }
                let (left_sse, _) = weighted_sse(
                    left.iter().map(|&i| (self.residuals[i], self.data.weights[i])),
                );
                let (right_sse, _) = weighted_sse(
                    right
                        .iter()
                        .map(|&i| (self.residuals[i], self.data.weights[i])),
                );
                let gain = parent_sse - left_sse - right_sse;
                if gain > 1e-12 && best.map_or(true, |(g, _, _)| gain > g) {
                    best = Some((gain, feature, threshold));
                }
            }
        }
        best.map(|(_, feature, threshold)| (feature, threshold))
    }
}

/// Weighted sum of squared errors around the weighted mean.
fn weighted_sse(pairs: impl Iterator<Item = (f64, f64)> + Clone) -> (f64, f64) {
    let (mut sum, mut weight_sum) = (0.0, 0.0);
    for (value, weight) in pairs.clone() {
        sum += value * weight;
        weight_sum += weight;
    }
    if weight_sum <= 0.0 {
        return (0.0, 0.0);
    }
    let mean = sum / weight_sum;
    let sse = pairs
        .map(|(value, weight)| weight * (value - mean) * (value - mean))
        .sum();
    (sse, weight_sum)
}

/// Weighted median of `(value, weight)` pairs.
fn weighted_median(pairs: &[(f64, f64)]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<(f64, f64)> = pairs.to_vec();
    sorted.sort_by(|a, b| f64::total_cmp(&a.0, &b.0));
    let half: f64 = sorted.iter().map(|(_, w)| w).sum::<f64>() / 2.0;
    let mut cumulative = 0.0;
    for (value, weight) in &sorted {
        cumulative += weight;
        if cumulative >= half {
            return *value;
        }
    }
    sorted.last().map_or(0.0, |(v, _)| *v)
}

/// Deterministic subsample without replacement.
fn subsample(rows: &[usize], fraction: f64, rng: &mut Xorshift64) -> Vec<usize> {
    if fraction >= 1.0 {
        return rows.to_vec();
    }
    let keep = ((rows.len() as f64) * fraction).round().max(1.0) as usize;
    let mut pool: Vec<usize> = rows.to_vec();
    // Partial Fisher-Yates: the first `keep` entries become the sample.
    for i in 0..keep.min(pool.len().saturating_sub(1)) {
        let j = i + (rng.next() as usize) % (pool.len() - i);
        pool.swap(i, j);
    }
    pool.truncate(keep);
    pool
}

/// Seeded xorshift64 generator.
struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}
