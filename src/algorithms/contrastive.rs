//! In-batch negative sampling for two-tower retrieval.
//!
//! For a batch of B positive (user, item) pairs the score matrix
//! `S = U V^T` is B x B; row r is a softmax classification whose correct
//! class is column r. Every other column in the row is a negative. The loss is
//! the row-wise cross-entropy averaged over the batch. Rating values are not
//! used, only co-occurrence.
//!
//! A batch of one pair has no negatives: its loss is defined as 0 and no
//! parameter moves.

use super::initializer;
use super::optimizer::{build_optimizer, Optimizer};
use super::tower::{EmbeddingTower, NetworkTower, Tower};
use super::{EarlyStopping, EmbeddingModel, EpochOutcome, RecommendationAlgorithm};
use crate::config::{TowerKind, TwoTowerConfig};
use crate::error::{EngineError, Result};
use crate::features::{FeatureTables, IdIndex};
use crate::models::{Interaction, ItemId, UserId};
use crate::utils::validation::{self, MAX_RATING, MIN_RATING};
use crate::utils::{log_sum_exp, sigmoid, softmax};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Mean row-wise softmax cross-entropy with the diagonal as labels, and its
/// gradient with respect to the scores.
pub fn in_batch_softmax_loss(scores: &DMatrix<f32>) -> (f32, DMatrix<f32>) {
    let batch = scores.nrows();
    let mut grad = DMatrix::zeros(batch, scores.ncols());
    if batch == 0 {
        return (0.0, grad);
    }

    let mut total = 0.0f32;
    for r in 0..batch {
        let row: Vec<f32> = scores.row(r).iter().copied().collect();
        total += log_sum_exp(&row) - row[r];

        for (c, p) in softmax(&row).into_iter().enumerate() {
            let label = if c == r { 1.0 } else { 0.0 };
            grad[(r, c)] = (p - label) / batch as f32;
        }
    }

    (total / batch as f32, grad)
}

#[derive(Debug)]
pub struct ContrastiveTrainer {
    embedding_learning_rate: f32,
    tower_learning_rate: f32,
    optimizer: Box<dyn Optimizer>,
}

impl ContrastiveTrainer {
    pub fn new(config: &TwoTowerConfig) -> Self {
        Self::with_optimizer(
            config.embedding_learning_rate,
            config.tower_learning_rate,
            build_optimizer(config.optimizer),
        )
    }

    pub fn with_optimizer(embedding_learning_rate: f32, tower_learning_rate: f32, optimizer: Box<dyn Optimizer>) -> Self {
        Self {
            embedding_learning_rate,
            tower_learning_rate,
            optimizer,
        }
    }

    /// Table towers and network towers train at different rates.
    fn learning_rate_for(&self, tower: &Tower) -> f32 {
        if tower.is_network() {
            self.tower_learning_rate
        } else {
            self.embedding_learning_rate
        }
    }

    /// One optimizer update over a batch of positive `(user_idx, item_idx)`
    /// pairs. Returns the batch loss. Towers are untouched on error.
    pub fn train_step(&mut self, user_tower: &mut Tower, item_tower: &mut Tower, batch: &[(usize, usize)]) -> Result<f32> {
        if batch.is_empty() {
            return Err(EngineError::InsufficientData {
                what: "pairs in batch",
                required: 1,
                actual: 0,
            });
        }
        if batch.len() == 1 {
            debug!("Single-pair batch has no negatives, skipping update");
            return Ok(0.0);
        }
        if user_tower.dim() != item_tower.dim() {
            return Err(EngineError::DimensionMismatch {
                expected: user_tower.dim(),
                actual: item_tower.dim(),
            });
        }

        let users: Vec<usize> = batch.iter().map(|&(u, _)| u).collect();
        let items: Vec<usize> = batch.iter().map(|&(_, i)| i).collect();

        let (user_vecs, user_cache) = user_tower.forward_batch(&users)?;
        let (item_vecs, item_cache) = item_tower.forward_batch(&items)?;
        let scores = &user_vecs * item_vecs.transpose();

        let (loss, score_grad) = in_batch_softmax_loss(&scores);
        let loss = validation::ensure_finite("contrastive loss", loss)?;

        let user_grad = &score_grad * &item_vecs;
        let item_grad = score_grad.transpose() * &user_vecs;

        let user_update = user_tower.gradients(&users, &user_cache, &user_grad)?;
        let item_update = item_tower.gradients(&items, &item_cache, &item_grad)?;
        if !user_update.is_finite() || !item_update.is_finite() {
            return Err(EngineError::unstable("contrastive gradient", f32::NAN));
        }

        let user_lr = self.learning_rate_for(user_tower);
        let item_lr = self.learning_rate_for(item_tower);
        user_tower.apply(&user_update, self.optimizer.as_mut(), "user_tower", user_lr)?;
        item_tower.apply(&item_update, self.optimizer.as_mut(), "item_tower", item_lr)?;

        Ok(loss)
    }

    pub fn reset(&mut self) {
        self.optimizer.reset();
    }
}

/// User and item towers trained with `ContrastiveTrainer`
#[derive(Debug)]
pub struct TwoTowerModel {
    config: TwoTowerConfig,
    min_interactions: usize,
    users: IdIndex,
    items: IdIndex,
    user_tower: Option<Tower>,
    item_tower: Option<Tower>,
    features: Option<Arc<FeatureTables>>,
    trainer: ContrastiveTrainer,
    rng: StdRng,
}

impl TwoTowerModel {
    pub fn new(config: TwoTowerConfig, min_interactions: usize, seed: u64) -> Self {
        let trainer = ContrastiveTrainer::new(&config);
        Self {
            config,
            min_interactions,
            users: IdIndex::default(),
            items: IdIndex::default(),
            user_tower: None,
            item_tower: None,
            features: None,
            trainer,
            rng: initializer::seeded_rng(seed),
        }
    }

    /// Feature tables are required by network towers.
    pub fn with_features(mut self, features: Arc<FeatureTables>) -> Self {
        self.features = Some(features);
        self
    }

    fn build_towers(&mut self) -> Result<(Tower, Tower)> {
        let dim = self.config.embedding_dim;
        match self.config.tower {
            TowerKind::Embedding => Ok((
                Tower::Embedding(EmbeddingTower::random(&mut self.rng, self.users.len(), dim, self.config.init_std)?),
                Tower::Embedding(EmbeddingTower::random(&mut self.rng, self.items.len(), dim, self.config.init_std)?),
            )),
            TowerKind::Network => {
                let tables = self.features.clone().ok_or_else(|| {
                    EngineError::UninitializedModel("network towers need feature tables".to_string())
                })?;
                let user_features = self
                    .users
                    .ids()
                    .iter()
                    .map(|&id| tables.user(id).map(<[f32]>::to_vec))
                    .collect::<Result<Vec<_>>>()?;
                let item_features = self.items.ids().iter().map(|&id| tables.item(id)).collect();

                let hidden = self.config.hidden_layers.clone();
                Ok((
                    Tower::Network(NetworkTower::new(&mut self.rng, user_features, &hidden, dim)?),
                    Tower::Network(NetworkTower::new(&mut self.rng, item_features, &hidden, dim)?),
                ))
            }
        }
    }

    fn towers(&self) -> Result<(&Tower, &Tower)> {
        match (&self.user_tower, &self.item_tower) {
            (Some(u), Some(i)) => Ok((u, i)),
            _ => Err(EngineError::UninitializedModel(
                "two-tower model has not been initialized".to_string(),
            )),
        }
    }

    fn indices(&self, user_id: UserId, item_id: ItemId) -> Result<(usize, usize)> {
        let u = self
            .users
            .index_of(user_id)
            .ok_or(EngineError::UnknownEntity { kind: "user", id: user_id })?;
        let i = self
            .items
            .index_of(item_id)
            .ok_or(EngineError::UnknownEntity { kind: "item", id: item_id })?;
        Ok((u, i))
    }

    fn dot(&self, user_id: UserId, item_id: ItemId) -> Result<f32> {
        let (user_tower, item_tower) = self.towers()?;
        let (u, i) = self.indices(user_id, item_id)?;
        let user = user_tower.embed(u)?;
        let item = item_tower.embed(i)?;
        validation::ensure_finite("two-tower score", crate::utils::dot(&user, &item))
    }
}

impl RecommendationAlgorithm for TwoTowerModel {
    fn name(&self) -> &'static str {
        match self.config.tower {
            TowerKind::Embedding => "two_tower_embedding",
            TowerKind::Network => "two_tower_network",
        }
    }

    fn initialize(&mut self, user_ids: &[UserId], item_ids: &[ItemId]) -> Result<()> {
        self.users = IdIndex::from_ids(user_ids.iter().copied());
        self.items = IdIndex::from_ids(item_ids.iter().copied());
        if self.users.is_empty() || self.items.is_empty() {
            return Err(EngineError::InsufficientData {
                what: "users and items",
                required: 1,
                actual: self.users.len().min(self.items.len()),
            });
        }

        let (user_tower, item_tower) = self.build_towers()?;
        self.user_tower = Some(user_tower);
        self.item_tower = Some(item_tower);
        self.trainer.reset();
        info!(
            users = self.users.len(),
            items = self.items.len(),
            tower = ?self.config.tower,
            "Initialized two-tower model"
        );
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.user_tower.is_some() && self.item_tower.is_some()
    }

    fn begin_training(&mut self, interactions: &[Interaction]) -> Result<()> {
        self.towers()?;
        validation::validate_training_set(interactions, self.min_interactions)?;
        info!(
            interactions = interactions.len(),
            batch_size = self.config.batch_size,
            "Starting contrastive training"
        );
        Ok(())
    }

    /// Shuffles positive pairs and trains on consecutive batches. Batches of a
    /// single pair carry no signal and are left out of the epoch mean.
    fn train_epoch(&mut self, interactions: &[Interaction]) -> Result<EpochOutcome> {
        let mut skipped = 0usize;
        let mut pairs: Vec<(usize, usize)> = Vec::with_capacity(interactions.len());
        for interaction in interactions {
            match (
                self.users.index_of(interaction.user_id),
                self.items.index_of(interaction.item_id),
            ) {
                (Some(u), Some(i)) => pairs.push((u, i)),
                _ => skipped += 1,
            }
        }
        if pairs.len() < 2 {
            return Err(EngineError::InsufficientData {
                what: "known pairs",
                required: 2,
                actual: pairs.len(),
            });
        }
        pairs.shuffle(&mut self.rng);

        let (Some(user_tower), Some(item_tower)) = (self.user_tower.as_mut(), self.item_tower.as_mut()) else {
            return Err(EngineError::UninitializedModel(
                "two-tower model has not been initialized".to_string(),
            ));
        };

        let mut total = 0.0f64;
        let mut batches = 0usize;
        for batch in pairs.chunks(self.config.batch_size.max(1)) {
            if batch.len() < 2 {
                continue;
            }
            match self.trainer.train_step(user_tower, item_tower, batch) {
                Ok(loss) => {
                    total += loss as f64;
                    batches += 1;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping contrastive batch: {}", e);
                    skipped += batch.len();
                }
                Err(e) => return Err(e),
            }
        }

        if batches == 0 {
            return Err(EngineError::unstable("contrastive epoch with no valid batches", f32::NAN));
        }

        Ok(EpochOutcome {
            loss: (total / batches as f64) as f32,
            skipped_steps: skipped,
        })
    }

    fn early_stopping(&self) -> EarlyStopping {
        EarlyStopping::new(self.config.min_epochs, self.config.tolerance)
    }

    /// `1 + 4 * sigmoid(<u, v>)`, clamped to the rating range
    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32> {
        let score = self.dot(user_id, item_id)?;
        Ok((MIN_RATING + (MAX_RATING - MIN_RATING) * sigmoid(score)).clamp(MIN_RATING, MAX_RATING))
    }

    fn score(&self, user_id: UserId, item_id: ItemId) -> Result<f32> {
        self.dot(user_id, item_id)
    }

    fn as_embedding_model(&self) -> Option<&dyn EmbeddingModel> {
        Some(self)
    }
}

impl EmbeddingModel for TwoTowerModel {
    fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    fn user_embedding(&self, user_id: UserId) -> Result<Vec<f32>> {
        let (user_tower, _) = self.towers()?;
        let u = self
            .users
            .index_of(user_id)
            .ok_or(EngineError::UnknownEntity { kind: "user", id: user_id })?;
        user_tower.embed(u)
    }

    fn item_embeddings(&self) -> Result<Vec<(ItemId, Vec<f32>)>> {
        let (_, item_tower) = self.towers()?;
        self.items
            .ids()
            .iter()
            .enumerate()
            .map(|(i, &item_id)| Ok((item_id, item_tower.embed(i)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::optimizer::SGD;
    use crate::algorithms::tower::seeded_embedding_tower;
    use crate::config::OptimizerKind;
    use crate::features::FeatureBuilder;

    fn table(tower: &Tower) -> Vec<f32> {
        match tower {
            Tower::Embedding(t) => t.table().iter().copied().collect(),
            Tower::Network(_) => panic!("expected table tower"),
        }
    }

    #[test]
    fn test_softmax_loss_on_known_scores() {
        let scores = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let (loss, grad) = in_batch_softmax_loss(&scores);
        let e = std::f32::consts::E;
        assert!((loss - ((e + 1.0).ln() - 1.0)).abs() < 1e-5);

        let p = e / (e + 1.0);
        assert!((grad[(0, 0)] - (p - 1.0) / 2.0).abs() < 1e-6);
        assert!((grad[(0, 1)] - (1.0 - p) / 2.0).abs() < 1e-6);
        // each gradient row sums to zero
        assert!((grad[(1, 0)] + grad[(1, 1)]).abs() < 1e-6);
    }

    #[test]
    fn test_single_pair_batch_is_a_no_op() {
        let mut trainer = ContrastiveTrainer::with_optimizer(0.1, 0.01, Box::new(SGD));
        let mut users = seeded_embedding_tower(1, 2, 4, 0.1).unwrap();
        let mut items = seeded_embedding_tower(2, 2, 4, 0.1).unwrap();
        let before = table(&users);

        let loss = trainer.train_step(&mut users, &mut items, &[(0, 1)]).unwrap();
        assert_eq!(loss, 0.0);
        assert_eq!(table(&users), before);

        assert!(matches!(
            trainer.train_step(&mut users, &mut items, &[]),
            Err(EngineError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_non_finite_scores_leave_towers_untouched() {
        let mut trainer = ContrastiveTrainer::with_optimizer(0.1, 0.01, Box::new(SGD));
        let mut poisoned = ndarray::Array2::<f32>::zeros((2, 2));
        poisoned[[0, 0]] = f32::NAN;
        let mut users = Tower::Embedding(EmbeddingTower::from_table(poisoned).unwrap());
        let mut items = seeded_embedding_tower(2, 2, 2, 0.1).unwrap();
        let items_before = table(&items);

        let result = trainer.train_step(&mut users, &mut items, &[(0, 0), (1, 1)]);
        assert!(matches!(result, Err(EngineError::NumericInstability { .. })));
        assert_eq!(table(&items), items_before);
    }

    #[test]
    fn test_step_lowers_batch_loss() {
        let mut trainer = ContrastiveTrainer::with_optimizer(0.5, 0.01, Box::new(SGD));
        let mut users = seeded_embedding_tower(3, 4, 8, 0.3).unwrap();
        let mut items = seeded_embedding_tower(4, 4, 8, 0.3).unwrap();
        let batch = [(0, 0), (1, 1), (2, 2), (3, 3)];

        let first = trainer.train_step(&mut users, &mut items, &batch).unwrap();
        let mut last = first;
        for _ in 0..20 {
            last = trainer.train_step(&mut users, &mut items, &batch).unwrap();
        }
        assert!(last < first, "loss went from {} to {}", first, last);
    }

    #[test]
    fn test_two_tower_training_trend_and_ranking() {
        let config = TwoTowerConfig {
            embedding_dim: 8,
            batch_size: 4,
            embedding_learning_rate: 0.05,
            optimizer: OptimizerKind::Adam,
            min_epochs: 40,
            ..TwoTowerConfig::default()
        };
        let mut model = TwoTowerModel::new(config, 1, 17);
        let ids: Vec<u32> = (0..8).collect();
        model.initialize(&ids, &ids).unwrap();

        let interactions: Vec<Interaction> = ids.iter().map(|&n| Interaction::new(n, n, 4.0)).collect();
        let losses = model.train(&interactions, 40).unwrap();
        assert_eq!(losses.len(), 40);

        let head: f32 = losses[..5].iter().sum::<f32>() / 5.0;
        let tail: f32 = losses[35..].iter().sum::<f32>() / 5.0;
        assert!(tail < head, "loss did not trend down: {:?}", losses);

        let own = model.score(3, 3).unwrap();
        let other = model.score(3, 5).unwrap();
        assert!(own > other);
        let p = model.predict(3, 3).unwrap();
        assert!((1.0..=5.0).contains(&p));
    }

    #[test]
    fn test_network_towers_need_features() {
        let config = TwoTowerConfig {
            tower: TowerKind::Network,
            ..TwoTowerConfig::default()
        };
        let mut model = TwoTowerModel::new(config.clone(), 1, 1);
        assert!(matches!(
            model.initialize(&[1], &[1]),
            Err(EngineError::UninitializedModel(_))
        ));

        let interactions = vec![
            Interaction::new(1, 10, 5.0),
            Interaction::new(1, 11, 1.0),
            Interaction::new(2, 10, 3.0),
            Interaction::new(2, 12, 4.0),
        ];
        let mut builder = FeatureBuilder::from_interactions(&interactions, 3);
        builder.set_item_genres(10, &[1.0, 0.0, 0.0]);
        builder.set_item_genres(11, &[0.0, 1.0, 0.0]);
        builder.set_item_genres(12, &[0.0, 0.0, 1.0]);

        let mut model = TwoTowerModel::new(config, 1, 1).with_features(builder.build());
        model.initialize(&[1, 2], &[10, 11, 12]).unwrap();
        let outcome = model.train_epoch(&interactions).unwrap();
        assert!(outcome.loss.is_finite());
        assert_eq!(model.user_embedding(1).unwrap().len(), 32);
        assert_eq!(model.item_embeddings().unwrap().len(), 3);
    }
}
