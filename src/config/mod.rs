use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub factorization: FactorizationConfig,
    pub regressor: RegressorConfig,
    pub two_tower: TwoTowerConfig,
    pub pca: PcaConfig,
    pub recommendation: RecommendationConfig,
    pub training: TrainingConfig,
}

/// Bias-augmented matrix factorization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorizationConfig {
    pub embedding_dim: usize,
    pub learning_rate: f32,
    pub regularization: f32,
    /// Standard deviation of the Gaussian used for embedding rows
    pub init_std: f32,
    pub min_epochs: usize,
    pub tolerance: f32,
}

/// Feed-forward pointwise rating regressor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressorConfig {
    pub hidden_layers: Vec<usize>,
    pub learning_rate: f32,
    pub regularization: f32,
    pub dropout: f32,
    /// Multiplier applied to the learning rate after an epoch that got worse
    pub lr_decay: f32,
    /// Inset used to keep ratings 1 and 5 inside the open logit domain
    pub target_epsilon: f32,
    pub min_epochs: usize,
    pub tolerance: f32,
    /// Width of the hashed identifier encoding; zero selects feature concatenation
    pub hashed_input_width: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TowerKind {
    /// Direct embedding-table lookup
    Embedding,
    /// Feature vector through dense layers
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

/// Two-tower retrieval model trained with in-batch negatives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoTowerConfig {
    pub tower: TowerKind,
    pub embedding_dim: usize,
    pub hidden_layers: Vec<usize>,
    pub batch_size: usize,
    pub embedding_learning_rate: f32,
    pub tower_learning_rate: f32,
    pub optimizer: OptimizerKind,
    pub init_std: f32,
    pub min_epochs: usize,
    pub tolerance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaConfig {
    pub components: usize,
    pub iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    pub top_k: usize,
    /// Users with at least this many interactions are recommendation targets
    pub qualified_user_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub min_interactions: usize,
    pub seed: u64,
    /// Interactions per user held out for offline evaluation
    pub holdout_per_user: usize,
}

impl Default for FactorizationConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 32,
            learning_rate: 0.01,
            regularization: 0.02,
            init_std: 0.1,
            min_epochs: 10,
            tolerance: 1e-4,
        }
    }
}

impl Default for RegressorConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![64, 32],
            learning_rate: 0.01,
            regularization: 1e-4,
            dropout: 0.2,
            lr_decay: 0.95,
            target_epsilon: 0.01,
            min_epochs: 20,
            tolerance: 1e-4,
            hashed_input_width: 0,
        }
    }
}

impl Default for TwoTowerConfig {
    fn default() -> Self {
        Self {
            tower: TowerKind::Embedding,
            embedding_dim: 32,
            hidden_layers: vec![64],
            batch_size: 64,
            embedding_learning_rate: 0.01,
            tower_learning_rate: 0.001,
            optimizer: OptimizerKind::Adam,
            init_std: 0.1,
            min_epochs: 10,
            tolerance: 1e-4,
        }
    }
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            components: 2,
            iterations: 10,
        }
    }
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            qualified_user_threshold: 20,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            min_interactions: 10,
            seed: 42,
            holdout_per_user: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            factorization: FactorizationConfig::default(),
            regressor: RegressorConfig::default(),
            two_tower: TwoTowerConfig::default(),
            pca: PcaConfig::default(),
            recommendation: RecommendationConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("EMBEDREC").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, value: f32| {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(EngineError::InvalidConfiguration(format!(
                    "{} must be positive, got {}",
                    name, value
                )))
            }
        };

        if self.factorization.embedding_dim == 0 || self.two_tower.embedding_dim == 0 {
            return Err(EngineError::InvalidConfiguration(
                "embedding_dim must be at least 1".to_string(),
            ));
        }
        positive("factorization.learning_rate", self.factorization.learning_rate)?;
        positive("regressor.learning_rate", self.regressor.learning_rate)?;
        positive("two_tower.embedding_learning_rate", self.two_tower.embedding_learning_rate)?;
        positive("two_tower.tower_learning_rate", self.two_tower.tower_learning_rate)?;

        if !(0.0..1.0).contains(&self.regressor.dropout) {
            return Err(EngineError::InvalidConfiguration(format!(
                "regressor.dropout must be in [0, 1), got {}",
                self.regressor.dropout
            )));
        }
        if !(0.0..0.5).contains(&self.regressor.target_epsilon) || self.regressor.target_epsilon == 0.0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "regressor.target_epsilon must be in (0, 0.5), got {}",
                self.regressor.target_epsilon
            )));
        }
        if self.two_tower.batch_size == 0 {
            return Err(EngineError::InvalidConfiguration(
                "two_tower.batch_size must be at least 1".to_string(),
            ));
        }
        if self.pca.components == 0 {
            return Err(EngineError::InvalidConfiguration(
                "pca.components must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
