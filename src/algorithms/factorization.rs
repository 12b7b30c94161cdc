//! Bias-augmented matrix factorization trained by per-example SGD.
//!
//! Prediction is `clamp(global + b_u + b_i + <p_u, q_i>, 1, 5)`. Gradients are
//! taken on the unclamped value. Unknown users or items fall back to the
//! clamped global bias; parameters are never created during prediction.

use super::initializer::{self, InitializationMethod};
use super::{EarlyStopping, EmbeddingModel, EpochOutcome, RecommendationAlgorithm};
use crate::config::FactorizationConfig;
use crate::error::{EngineError, Result};
use crate::features::IdIndex;
use crate::models::{Interaction, ItemId, UserId};
use crate::utils::mean;
use crate::utils::validation::{self, MAX_RATING, MIN_RATING};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BiasedMatrixFactorization {
    config: FactorizationConfig,
    min_interactions: usize,
    users: IdIndex,
    items: IdIndex,
    user_embeddings: Array2<f32>,
    item_embeddings: Array2<f32>,
    user_bias: Array1<f32>,
    item_bias: Array1<f32>,
    global_bias: f32,
    initialized: bool,
    rng: StdRng,
}

impl BiasedMatrixFactorization {
    pub fn new(config: FactorizationConfig, min_interactions: usize, seed: u64) -> Self {
        Self {
            config,
            min_interactions,
            users: IdIndex::default(),
            items: IdIndex::default(),
            user_embeddings: Array2::zeros((0, 0)),
            item_embeddings: Array2::zeros((0, 0)),
            user_bias: Array1::zeros(0),
            item_bias: Array1::zeros(0),
            global_bias: 0.0,
            initialized: false,
            rng: initializer::seeded_rng(seed),
        }
    }

    /// Allocates embedding rows with small Gaussian noise and zeroes every bias.
    pub fn initialize_parameters(&mut self, user_ids: &[UserId], item_ids: &[ItemId]) -> Result<()> {
        self.users = IdIndex::from_ids(user_ids.iter().copied());
        self.items = IdIndex::from_ids(item_ids.iter().copied());
        if self.users.is_empty() || self.items.is_empty() {
            return Err(EngineError::InsufficientData {
                what: "users and items",
                required: 1,
                actual: self.users.len().min(self.items.len()),
            });
        }

        let dim = self.config.embedding_dim;
        let method = InitializationMethod::Normal {
            mean: 0.0,
            std_dev: self.config.init_std,
        };
        self.user_embeddings = self.random_table(method, self.users.len(), dim)?;
        self.item_embeddings = self.random_table(method, self.items.len(), dim)?;
        self.user_bias = Array1::zeros(self.users.len());
        self.item_bias = Array1::zeros(self.items.len());
        self.global_bias = 0.0;
        self.initialized = true;

        info!(
            users = self.users.len(),
            items = self.items.len(),
            dim,
            "Initialized factorization parameters"
        );
        Ok(())
    }

    fn random_table(&mut self, method: InitializationMethod, rows: usize, dim: usize) -> Result<Array2<f32>> {
        let values = method.initialize(&mut self.rng, rows * dim);
        Array2::from_shape_vec((rows, dim), values).map_err(|_| EngineError::DimensionMismatch {
            expected: rows * dim,
            actual: 0,
        })
    }

    fn raw_prediction(&self, user_idx: usize, item_idx: usize) -> f32 {
        self.global_bias
            + self.user_bias[user_idx]
            + self.item_bias[item_idx]
            + self.user_embeddings.row(user_idx).dot(&self.item_embeddings.row(item_idx))
    }

    /// Clamped prediction by dense index. `None` on either side is a cold start.
    pub fn predict_index(&self, user_idx: Option<usize>, item_idx: Option<usize>) -> f32 {
        match (user_idx, item_idx) {
            (Some(u), Some(i)) if u < self.users.len() && i < self.items.len() => {
                self.raw_prediction(u, i).clamp(MIN_RATING, MAX_RATING)
            }
            _ => self.global_bias.clamp(MIN_RATING, MAX_RATING),
        }
    }

    /// One SGD update; returns the squared error measured before the update.
    /// Nothing is written when the rating is out of range or the error is not finite.
    pub fn train_step(&mut self, user_idx: usize, item_idx: usize, rating: f32) -> Result<f32> {
        self.require_initialized()?;
        if user_idx >= self.users.len() || item_idx >= self.items.len() {
            return Err(EngineError::DimensionMismatch {
                expected: self.users.len().max(self.items.len()),
                actual: user_idx.max(item_idx) + 1,
            });
        }
        validation::validate_rating(rating)?;
        let error = self.raw_prediction(user_idx, item_idx) - rating;
        let squared_error = validation::ensure_finite("factorization step", error * error)?;

        let lr = self.config.learning_rate;
        let reg = self.config.regularization;
        let user_old = self.user_embeddings.row(user_idx).to_owned();
        let item_old = self.item_embeddings.row(item_idx).to_owned();

        let mut user_row = self.user_embeddings.row_mut(user_idx);
        for k in 0..user_old.len() {
            user_row[k] -= lr * (error * item_old[k] + reg * user_old[k]);
        }
        let mut item_row = self.item_embeddings.row_mut(item_idx);
        for k in 0..item_old.len() {
            item_row[k] -= lr * (error * user_old[k] + reg * item_old[k]);
        }
        self.user_bias[user_idx] -= lr * error;
        self.item_bias[item_idx] -= lr * error;

        Ok(squared_error)
    }

    pub fn global_bias(&self) -> f32 {
        self.global_bias
    }

    pub fn user_bias(&self, user_id: UserId) -> Option<f32> {
        self.users.index_of(user_id).map(|u| self.user_bias[u])
    }

    pub fn item_bias(&self, item_id: ItemId) -> Option<f32> {
        self.items.index_of(item_id).map(|i| self.item_bias[i])
    }

    fn require_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(EngineError::UninitializedModel(
                "factorization parameters have not been initialized".to_string(),
            ))
        }
    }
}

impl RecommendationAlgorithm for BiasedMatrixFactorization {
    fn name(&self) -> &'static str {
        "factorization"
    }

    fn initialize(&mut self, user_ids: &[UserId], item_ids: &[ItemId]) -> Result<()> {
        self.initialize_parameters(user_ids, item_ids)
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Centres the model on the mean rating of the interactions that
    /// `train_epoch` will actually use.
    fn begin_training(&mut self, interactions: &[Interaction]) -> Result<()> {
        self.require_initialized()?;
        validation::validate_training_set(interactions, self.min_interactions)?;

        let usable: Vec<f32> = interactions
            .iter()
            .filter(|i| self.users.index_of(i.user_id).is_some() && self.items.index_of(i.item_id).is_some())
            .filter(|i| validation::validate_rating(i.rating).is_ok())
            .map(|i| i.rating)
            .collect();
        if usable.is_empty() {
            return Err(EngineError::InsufficientData {
                what: "interactions with registered ids and valid ratings",
                required: 1,
                actual: 0,
            });
        }
        self.global_bias = mean(&usable);
        info!(
            interactions = interactions.len(),
            usable = usable.len(),
            global_bias = self.global_bias,
            "Starting factorization training"
        );
        Ok(())
    }

    fn train_epoch(&mut self, interactions: &[Interaction]) -> Result<EpochOutcome> {
        self.require_initialized()?;

        let mut order: Vec<usize> = (0..interactions.len()).collect();
        order.shuffle(&mut self.rng);

        let mut total = 0.0f64;
        let mut count = 0usize;
        let mut skipped = 0usize;

        for idx in order {
            let interaction = &interactions[idx];
            let (Some(u), Some(i)) = (
                self.users.index_of(interaction.user_id),
                self.items.index_of(interaction.item_id),
            ) else {
                skipped += 1;
                continue;
            };

            match self.train_step(u, i, interaction.rating) {
                Ok(squared_error) => {
                    total += squared_error as f64;
                    count += 1;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping factorization step: {}", e);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if skipped > 0 {
            warn!(skipped, "Factorization epoch skipped interactions");
        }
        if count == 0 {
            return Err(EngineError::unstable("factorization epoch with no valid steps", f32::NAN));
        }

        Ok(EpochOutcome {
            loss: (total / count as f64) as f32,
            skipped_steps: skipped,
        })
    }

    fn early_stopping(&self) -> EarlyStopping {
        EarlyStopping::new(self.config.min_epochs, self.config.tolerance)
    }

    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32> {
        self.require_initialized()?;
        Ok(self.predict_index(self.users.index_of(user_id), self.items.index_of(item_id)))
    }

    fn score(&self, user_id: UserId, item_id: ItemId) -> Result<f32> {
        self.require_initialized()?;
        let u = self
            .users
            .index_of(user_id)
            .ok_or(EngineError::UnknownEntity { kind: "user", id: user_id })?;
        let i = self
            .items
            .index_of(item_id)
            .ok_or(EngineError::UnknownEntity { kind: "item", id: item_id })?;
        Ok(self.user_embeddings.row(u).dot(&self.item_embeddings.row(i)))
    }

    fn as_embedding_model(&self) -> Option<&dyn EmbeddingModel> {
        Some(self)
    }
}

impl EmbeddingModel for BiasedMatrixFactorization {
    fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    fn user_embedding(&self, user_id: UserId) -> Result<Vec<f32>> {
        self.require_initialized()?;
        let u = self
            .users
            .index_of(user_id)
            .ok_or(EngineError::UnknownEntity { kind: "user", id: user_id })?;
        Ok(self.user_embeddings.row(u).to_vec())
    }

    fn item_embeddings(&self) -> Result<Vec<(ItemId, Vec<f32>)>> {
        self.require_initialized()?;
        Ok(self
            .items
            .ids()
            .iter()
            .enumerate()
            .map(|(i, &item_id)| (item_id, self.item_embeddings.row(i).to_vec()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(dim: usize) -> BiasedMatrixFactorization {
        let config = FactorizationConfig {
            embedding_dim: dim,
            ..FactorizationConfig::default()
        };
        BiasedMatrixFactorization::new(config, 1, 11)
    }

    #[test]
    fn test_predict_before_initialize_fails() {
        let m = model(4);
        assert!(matches!(m.predict(1, 1), Err(EngineError::UninitializedModel(_))));
    }

    #[test]
    fn test_initialize_zeroes_biases() {
        let mut m = model(4);
        m.initialize(&[1, 2], &[10, 20]).unwrap();
        assert_eq!(m.global_bias(), 0.0);
        assert_eq!(m.user_bias(1), Some(0.0));
        assert_eq!(m.item_bias(20), Some(0.0));

        let a = m.user_embedding(1).unwrap();
        let b = m.user_embedding(2).unwrap();
        assert_ne!(a, b);
        assert!(a.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_cold_start_returns_clamped_global_bias() {
        let mut m = model(4);
        m.initialize(&[1], &[10]).unwrap();
        m.begin_training(&[Interaction::new(1, 10, 4.0)]).unwrap();
        assert!((m.predict(99, 10).unwrap() - 4.0).abs() < 1e-6);
        assert!((m.predict(1, 99).unwrap() - 4.0).abs() < 1e-6);
        assert!(matches!(m.score(99, 10), Err(EngineError::UnknownEntity { .. })));
    }

    #[test]
    fn test_train_step_uses_pre_update_values() {
        let mut m = model(2);
        m.initialize(&[1], &[10]).unwrap();
        m.user_embeddings.row_mut(0).assign(&ndarray::arr1(&[1.0, 0.0]));
        m.item_embeddings.row_mut(0).assign(&ndarray::arr1(&[0.5, 0.5]));

        // prediction 0.5, rating 1.5, error -1.0
        let squared = m.train_step(0, 0, 1.5).unwrap();
        assert!((squared - 1.0).abs() < 1e-6);

        let lr = m.config.learning_rate;
        let reg = m.config.regularization;
        let user = m.user_embedding(1).unwrap();
        assert!((user[0] - (1.0 - lr * (-0.5 + reg))).abs() < 1e-6);
        let items = m.item_embeddings().unwrap();
        // item gradient uses the old user row [1, 0], not the updated one
        assert!((items[0].1[0] - (0.5 - lr * (-1.0 + reg * 0.5))).abs() < 1e-6);
        assert!((items[0].1[1] - (0.5 - lr * (reg * 0.5))).abs() < 1e-6);
        assert!((m.user_bias(1).unwrap() - lr).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_step_leaves_tables_untouched() {
        let mut m = model(2);
        m.initialize(&[1], &[10]).unwrap();
        m.user_embeddings.row_mut(0).assign(&ndarray::arr1(&[f32::MAX, 0.0]));
        m.item_embeddings.row_mut(0).assign(&ndarray::arr1(&[f32::MAX, 0.0]));
        let before = m.user_embedding(1).unwrap();

        let result = m.train_step(0, 0, 3.0);
        assert!(matches!(result, Err(EngineError::NumericInstability { .. })));
        assert_eq!(m.user_embedding(1).unwrap(), before);
        assert_eq!(m.user_bias(1), Some(0.0));
    }

    #[test]
    fn test_out_of_range_rating_leaves_tables_untouched() {
        let mut m = model(2);
        m.initialize(&[1], &[10]).unwrap();
        let before = m.user_embedding(1).unwrap();
        for rating in [6.0, 0.0, f32::NAN] {
            let result = m.train_step(0, 0, rating);
            assert!(matches!(result, Err(EngineError::DegenerateTarget { .. })));
        }
        assert_eq!(m.user_embedding(1).unwrap(), before);
        assert_eq!(m.user_bias(1), Some(0.0));
    }

    #[test]
    fn test_bad_rating_is_skipped_not_fatal() {
        let mut m = model(4);
        let mut interactions: Vec<Interaction> = (0..24)
            .map(|n| Interaction::new(n % 4, n % 6, 1.0 + (n % 5) as f32))
            .collect();
        interactions.push(Interaction::new(1, 1, 6.0));
        m.initialize(&[0, 1, 2, 3], &[0, 1, 2, 3, 4, 5]).unwrap();

        m.begin_training(&interactions).unwrap();
        let outcome = m.train_epoch(&interactions).unwrap();
        assert_eq!(outcome.skipped_steps, 1);
        assert!(outcome.loss.is_finite());

        let losses = m.train(&interactions, 3).unwrap();
        assert_eq!(losses.len(), 3);
        assert!(losses.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_global_bias_ignores_unusable_interactions() {
        let mut m = model(2);
        m.initialize(&[1], &[10]).unwrap();
        let interactions = vec![
            Interaction::new(1, 10, 2.0),
            Interaction::new(1, 10, 4.0),
            Interaction::new(7, 10, 5.0),
            Interaction::new(1, 70, 5.0),
            Interaction::new(1, 10, 9.0),
        ];
        m.begin_training(&interactions).unwrap();
        assert!((m.global_bias() - 3.0).abs() < 1e-6);

        let unknown_only = vec![Interaction::new(7, 70, 3.0)];
        assert!(matches!(
            m.begin_training(&unknown_only),
            Err(EngineError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_train_requires_minimum_interactions() {
        let config = FactorizationConfig::default();
        let mut m = BiasedMatrixFactorization::new(config, 10, 1);
        m.initialize(&[1], &[10]).unwrap();
        let result = m.train(&[Interaction::new(1, 10, 3.0)], 5);
        assert!(matches!(result, Err(EngineError::InsufficientData { .. })));
    }

    #[test]
    fn test_predictions_stay_in_rating_range() {
        let mut m = model(8);
        let interactions: Vec<Interaction> = (0..40)
            .map(|n| Interaction::new(n % 4, n % 5, if n % 3 == 0 { 5.0 } else { 1.0 }))
            .collect();
        m.initialize(&[0, 1, 2, 3], &[0, 1, 2, 3, 4]).unwrap();
        m.train(&interactions, 30).unwrap();

        for user in 0..6 {
            for item in 0..7 {
                let p = m.predict(user, item).unwrap();
                assert!((1.0..=5.0).contains(&p), "prediction {} out of range", p);
            }
        }
    }
}
