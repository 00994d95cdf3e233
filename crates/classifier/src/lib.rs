//! Risk classification from manufacturer and device names.
//!
//! - [`booster`]: multinomial gradient-boosted regression trees
//! - [`pipeline`]: fitted vectorizers + booster, prediction and persistence
//! - [`split`]: seeded stratified train/test split and k-fold
//! - [`metrics`]: accuracy, per-class report, cross-validation summary
//! - [`train`]: the offline training run

use medrisk_features::VectorizerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod booster;
pub mod metrics;
pub mod pipeline;
pub mod split;
pub mod train;

pub use booster::{BoosterConfig, GradientBoostedTrees};
pub use metrics::{ClassificationReport, CrossValidationResult};
pub use pipeline::{class_probabilities, fallback_probabilities, RiskEstimator, RiskPipeline};
pub use train::{train, TrainingReport};

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Training set is empty")]
    EmptyTrainingSet,

    #[error("Got {rows} rows but {labels} labels")]
    LengthMismatch { rows: usize, labels: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid split: {0}")]
    InvalidSplit(String),

    #[error("Unsupported model artifact version: {0}")]
    UnsupportedArtifact(u32),

    #[error("Corrupt model artifact: {0}")]
    CorruptArtifact(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Configuration for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Fraction of rows held out for evaluation
    pub test_size: f64,
    /// Seed for the split and fold shuffles
    pub seed: u64,
    /// Cross-validation folds (< 2 disables cross-validation)
    pub cv_folds: usize,
    pub vectorizer: VectorizerConfig,
    pub booster: BoosterConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            test_size: 0.2,
            seed: 42,
            cv_folds: 5,
            vectorizer: VectorizerConfig::default(),
            booster: BoosterConfig::default(),
        }
    }
}
