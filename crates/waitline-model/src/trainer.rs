//! The regressor trainer seam and model artifacts.
//!
//! Training is abstracted behind [`RegressorTrainer`] so the boosted-tree
//! engine can be swapped for an external library without touching the
//! orchestration. Two artifact kinds exist: the boosted-tree model and the
//! mean-model fallback recorded when an entity has too few observations.
//! Artifacts persist as JSON under `models/{entity_code}/`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::gbt::GbtModel;

/// Boosting hyperparameters (fixed initial values; tunable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperparams {
    /// Boosting rounds.
    pub rounds: u32,
    /// Maximum tree depth.
    pub max_depth: u32,
    /// Shrinkage per round.
    pub learning_rate: f64,
    /// Row subsample fraction per round.
    pub subsample: f64,
    /// Minimum summed weight per child node.
    pub min_child_weight: f64,
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            rounds: 2000,
            max_depth: 6,
            learning_rate: 0.1,
            subsample: 0.5,
            min_child_weight: 10.0,
        }
    }
}

/// The training inputs handed to a trainer.
#[derive(Debug, Clone, Copy)]
pub struct TrainingData<'a> {
    /// Row-major matrix, `rows × n_features`.
    pub matrix: &'a [f64],
    /// Feature count per row.
    pub n_features: usize,
    /// Targets.
    pub target: &'a [f64],
    /// Sample weights.
    pub weights: &'a [f64],
    /// Row indices used for fitting.
    pub train_idx: &'a [usize],
    /// Row indices held out for validation metrics.
    pub val_idx: &'a [usize],
}

impl TrainingData<'_> {
    /// One row's feature slice.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.matrix[i * self.n_features..(i + 1) * self.n_features]
    }
}

/// Anything that can fit a regressor on a feature table.
pub trait RegressorTrainer: Send + Sync {
    /// Fits a model.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs are unusable (no training rows).
    fn train(&self, data: &TrainingData<'_>, params: &Hyperparams) -> Result<TrainedArtifact>;
}

/// The default in-crate gradient-boosted-tree trainer.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoostedTreeTrainer;

impl RegressorTrainer for BoostedTreeTrainer {
    fn train(&self, data: &TrainingData<'_>, params: &Hyperparams) -> Result<TrainedArtifact> {
        let model = GbtModel::fit(data, params)?;
        Ok(TrainedArtifact::Boosted(model))
    }
}

/// The mean-model fallback: metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanModel {
    /// Mean target value over the available observations.
    pub mean: f64,
    /// Number of observations behind the mean.
    pub count: u64,
}

impl MeanModel {
    /// Fits the mean from targets and weights.
    #[must_use]
    pub fn fit(target: &[f64], weights: &[f64]) -> Self {
        let weight_sum: f64 = weights.iter().sum();
        let mean = if weight_sum > 0.0 {
            target
                .iter()
                .zip(weights)
                .map(|(y, w)| y * w)
                .sum::<f64>()
                / weight_sum
        } else {
            0.0
        };
        Self {
            mean,
            count: target.len() as u64,
        }
    }
}

/// A persisted model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainedArtifact {
    /// Gradient-boosted trees.
    Boosted(GbtModel),
    /// Mean fallback.
    Mean(MeanModel),
}

impl TrainedArtifact {
    /// Predicts one row.
    #[must_use]
    pub fn predict(&self, features: &[f64]) -> f64 {
        match self {
            Self::Boosted(model) => model.predict(features),
            Self::Mean(model) => model.mean,
        }
    }

    /// Mean absolute error over the rows at `idx`.
    #[must_use]
    pub fn mae(&self, data: &TrainingData<'_>, idx: &[usize]) -> Option<f64> {
        if idx.is_empty() {
            return None;
        }
        let total: f64 = idx
            .iter()
            .map(|&i| (self.predict(data.row(i)) - data.target[i]).abs())
            .sum();
        Some(total / idx.len() as f64)
    }

    /// Writes the artifact as JSON.
    ///
    /// # Errors
    ///
    /// Returns an artifact error on write failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        waitline_core::atomic::write_json_replace(path, self).map_err(ModelError::Core)
    }

    /// Loads an artifact from JSON.
    ///
    /// # Errors
    ///
    /// Returns an artifact error if the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        waitline_core::atomic::read_json(path).map_err(ModelError::Core)
    }
}
