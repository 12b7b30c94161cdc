use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = u32;
pub type ItemId = u32;

/// One rating event. Immutable once loaded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub rating: f32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationItem {
    pub item_id: ItemId,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub user_id: UserId,
    pub recommendations: Vec<RecommendationItem>,
    pub generated_at: DateTime<Utc>,
}

/// Summary of one training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub run_id: Uuid,
    pub model: String,
    pub epoch_losses: Vec<f32>,
    pub skipped_steps: usize,
    pub stopped_early: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Low-dimensional coordinates of a set of embeddings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingProjection {
    pub coordinates: Vec<Vec<f32>>,
    pub components: Vec<Vec<f32>>,
    pub explained_variance: Vec<f32>,
}

impl Interaction {
    pub fn new(user_id: UserId, item_id: ItemId, rating: f32) -> Self {
        Self {
            user_id,
            item_id,
            rating,
            timestamp: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl EmbeddingProjection {
    /// Share of the extracted variance carried by each component
    pub fn explained_variance_ratio(&self) -> Vec<f32> {
        let total: f32 = self.explained_variance.iter().sum();
        if total > 0.0 {
            self.explained_variance.iter().map(|&v| v / total).collect()
        } else {
            vec![0.0; self.explained_variance.len()]
        }
    }
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }

    pub fn epochs_run(&self) -> usize {
        self.epoch_losses.len()
    }
}
