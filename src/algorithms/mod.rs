pub mod contrastive;
pub mod factorization;
pub mod initializer;
pub mod network;
pub mod optimizer;
pub mod pca;
pub mod ranker;
pub mod regressor;
pub mod tower;

pub use contrastive::{ContrastiveTrainer, TwoTowerModel};
pub use factorization::BiasedMatrixFactorization;
pub use pca::PcaProjector;
pub use regressor::FeedForwardRegressor;

use crate::error::Result;
use crate::models::{Interaction, ItemId, UserId};
use tracing::{debug, info};

/// Loss-plateau stopping rule shared by every model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EarlyStopping {
    pub min_epochs: usize,
    pub tolerance: f32,
}

impl EarlyStopping {
    pub fn new(min_epochs: usize, tolerance: f32) -> Self {
        Self {
            min_epochs,
            tolerance,
        }
    }

    /// True once at least `min_epochs` have run and the last two losses differ
    /// by less than `tolerance`.
    pub fn should_stop(&self, losses: &[f32]) -> bool {
        if losses.len() < self.min_epochs.max(2) {
            return false;
        }
        let last = losses[losses.len() - 1];
        let previous = losses[losses.len() - 2];
        (last - previous).abs() < self.tolerance
    }
}

/// Result of one pass over the training set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochOutcome {
    pub loss: f32,
    pub skipped_steps: usize,
}

/// A trainable model addressed by raw user/item ids.
///
/// `initialize` fixes the entity sets and allocates every parameter table.
/// `begin_training` runs once per training run before the first epoch;
/// `train_epoch` performs one full pass and mutates parameters in place.
pub trait RecommendationAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    fn initialize(&mut self, user_ids: &[UserId], item_ids: &[ItemId]) -> Result<()>;

    fn is_initialized(&self) -> bool;

    fn begin_training(&mut self, interactions: &[Interaction]) -> Result<()>;

    fn train_epoch(&mut self, interactions: &[Interaction]) -> Result<EpochOutcome>;

    fn early_stopping(&self) -> EarlyStopping;

    /// Predicted rating in [1, 5]
    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32>;

    /// Ranking score; larger is better
    fn score(&self, user_id: UserId, item_id: ItemId) -> Result<f32>;

    /// Embedding tables, for models that have them
    fn as_embedding_model(&self) -> Option<&dyn EmbeddingModel> {
        None
    }

    /// Runs up to `epochs` passes and returns the per-epoch mean loss.
    fn train(&mut self, interactions: &[Interaction], epochs: usize) -> Result<Vec<f32>> {
        self.begin_training(interactions)?;
        let stopping = self.early_stopping();
        let mut losses = Vec::with_capacity(epochs);

        for epoch in 0..epochs {
            let outcome = self.train_epoch(interactions)?;
            debug!(
                model = self.name(),
                epoch,
                loss = outcome.loss,
                skipped = outcome.skipped_steps,
                "Epoch finished"
            );
            losses.push(outcome.loss);

            if stopping.should_stop(&losses) {
                info!(model = self.name(), epoch, "Loss plateaued, stopping early");
                break;
            }
        }

        Ok(losses)
    }
}

/// Models whose users and items live in a shared embedding space
pub trait EmbeddingModel {
    fn embedding_dim(&self) -> usize;

    fn user_embedding(&self, user_id: UserId) -> Result<Vec<f32>>;

    /// Every known item with its embedding, in index order
    fn item_embeddings(&self) -> Result<Vec<(ItemId, Vec<f32>)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_stopping_waits_for_min_epochs() {
        let stopping = EarlyStopping::new(3, 1e-4);
        assert!(!stopping.should_stop(&[1.0, 1.0]));
        assert!(stopping.should_stop(&[2.0, 1.0, 1.00001]));
        assert!(!stopping.should_stop(&[2.0, 1.0, 0.5]));
    }

    #[test]
    fn test_early_stopping_needs_two_losses() {
        let stopping = EarlyStopping::new(0, 1.0);
        assert!(!stopping.should_stop(&[0.5]));
        assert!(stopping.should_stop(&[0.5, 0.5]));
    }
}
