//! Feature Builder: dense id indexing and fixed-length numeric features for
//! users (rating statistics) and items (genre indicators).

use crate::error::{EngineError, Result};
use crate::models::{Interaction, ItemId, UserId};
use crate::utils;
use nalgebra::DVector;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Length of the user rating-statistics vector
pub const USER_FEATURE_DIM: usize = 3;
/// Genre slots in the reference catalog
pub const GENRE_COUNT: usize = 19;

const RATING_SCALE: f32 = 5.0;
const COUNT_CAP: f32 = 100.0;
const STD_SCALE: f32 = 2.5;

/// Dense 0-based index over raw entity ids with the reverse mapping retained
#[derive(Debug, Clone, Default)]
pub struct IdIndex {
    forward: HashMap<u32, usize>,
    reverse: Vec<u32>,
}

impl IdIndex {
    /// Assigns indices in first-seen order; duplicates are ignored.
    pub fn from_ids<I: IntoIterator<Item = u32>>(ids: I) -> Self {
        let mut index = Self::default();
        for id in ids {
            if !index.forward.contains_key(&id) {
                index.forward.insert(id, index.reverse.len());
                index.reverse.push(id);
            }
        }
        index
    }

    pub fn index_of(&self, id: u32) -> Option<usize> {
        self.forward.get(&id).copied()
    }

    pub fn id_of(&self, index: usize) -> Option<u32> {
        self.reverse.get(index).copied()
    }

    pub fn ids(&self) -> &[u32] {
        &self.reverse
    }

    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }
}

/// `[mean/5, min(count/100, 1), std/2.5]` for one user's ratings
pub fn user_feature_vector(ratings: &[f32]) -> [f32; USER_FEATURE_DIM] {
    if ratings.is_empty() {
        return [0.0; USER_FEATURE_DIM];
    }
    [
        utils::mean(ratings) / RATING_SCALE,
        (ratings.len() as f32 / COUNT_CAP).min(1.0),
        utils::std_dev(ratings) / STD_SCALE,
    ]
}

/// Pads with zeros or truncates a genre indicator record to `dim`
pub fn item_feature_vector(genres: &[f32], dim: usize) -> Vec<f32> {
    let mut vector: Vec<f32> = genres.iter().take(dim).copied().collect();
    vector.resize(dim, 0.0);
    vector
}

/// Users with at least `threshold` interactions, in ascending id order
pub fn qualified_users(interactions: &[Interaction], threshold: usize) -> Vec<UserId> {
    let mut counts: HashMap<UserId, usize> = HashMap::new();
    for interaction in interactions {
        *counts.entry(interaction.user_id).or_insert(0) += 1;
    }

    let mut users: Vec<UserId> = counts
        .into_iter()
        .filter(|&(_, count)| count >= threshold)
        .map(|(user_id, _)| user_id)
        .collect();
    users.sort_unstable();
    users
}

/// Immutable snapshot of computed feature vectors
#[derive(Debug, Clone)]
pub struct FeatureTables {
    users: HashMap<UserId, Vec<f32>>,
    items: HashMap<ItemId, Vec<f32>>,
    item_dim: usize,
}

impl FeatureTables {
    pub fn user_dim(&self) -> usize {
        USER_FEATURE_DIM
    }

    pub fn item_dim(&self) -> usize {
        self.item_dim
    }

    pub fn user(&self, user_id: UserId) -> Result<&[f32]> {
        self.users
            .get(&user_id)
            .map(Vec::as_slice)
            .ok_or(EngineError::UnknownEntity { kind: "user", id: user_id })
    }

    /// Items without a catalog record get an all-zero genre vector.
    pub fn item(&self, item_id: ItemId) -> Vec<f32> {
        self.items
            .get(&item_id)
            .cloned()
            .unwrap_or_else(|| vec![0.0; self.item_dim])
    }
}

/// Accumulates ratings and catalog records; user features are recomputed
/// lazily after any change to the interaction history.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    ratings_by_user: HashMap<UserId, Vec<f32>>,
    item_genres: HashMap<ItemId, Vec<f32>>,
    item_dim: usize,
    cached: Option<Arc<FeatureTables>>,
}

impl FeatureBuilder {
    pub fn new(item_dim: usize) -> Self {
        Self {
            ratings_by_user: HashMap::new(),
            item_genres: HashMap::new(),
            item_dim,
            cached: None,
        }
    }

    pub fn from_interactions(interactions: &[Interaction], item_dim: usize) -> Self {
        let mut builder = Self::new(item_dim);
        builder.add_interactions(interactions);
        builder
    }

    pub fn add_interactions(&mut self, interactions: &[Interaction]) {
        for interaction in interactions {
            self.ratings_by_user
                .entry(interaction.user_id)
                .or_default()
                .push(interaction.rating);
        }
        self.cached = None;
    }

    pub fn set_item_genres(&mut self, item_id: ItemId, genres: &[f32]) {
        self.item_genres
            .insert(item_id, item_feature_vector(genres, self.item_dim));
        self.cached = None;
    }

    pub fn is_stale(&self) -> bool {
        self.cached.is_none()
    }

    pub fn build(&mut self) -> Arc<FeatureTables> {
        if let Some(tables) = &self.cached {
            return Arc::clone(tables);
        }

        let users = self
            .ratings_by_user
            .iter()
            .map(|(&user_id, ratings)| (user_id, user_feature_vector(ratings).to_vec()))
            .collect();

        let tables = Arc::new(FeatureTables {
            users,
            items: self.item_genres.clone(),
            item_dim: self.item_dim,
        });
        tracing::debug!(
            users = tables.users.len(),
            items = tables.items.len(),
            "Rebuilt feature tables"
        );
        self.cached = Some(Arc::clone(&tables));
        tables
    }
}

/// Turns a (user, item) pair into a fixed-length network input
pub trait InputEncoder: Send + Sync + std::fmt::Debug {
    fn input_dim(&self) -> usize;
    fn encode(&self, user_id: UserId, item_id: ItemId) -> Result<DVector<f32>>;
}

/// User statistics followed by item genres
#[derive(Debug, Clone)]
pub struct FeatureConcatEncoder {
    tables: Arc<FeatureTables>,
}

impl FeatureConcatEncoder {
    pub fn new(tables: Arc<FeatureTables>) -> Self {
        Self { tables }
    }
}

impl InputEncoder for FeatureConcatEncoder {
    fn input_dim(&self) -> usize {
        self.tables.user_dim() + self.tables.item_dim()
    }

    fn encode(&self, user_id: UserId, item_id: ItemId) -> Result<DVector<f32>> {
        let user = self.tables.user(user_id)?;
        let item = self.tables.item(item_id);
        Ok(DVector::from_iterator(
            self.input_dim(),
            user.iter().copied().chain(item),
        ))
    }
}

/// Hashes both identifiers into a shared multi-hot vector. Collision-prone;
/// only useful when no real features exist.
#[derive(Debug, Clone)]
pub struct HashedIdEncoder {
    width: usize,
}

impl HashedIdEncoder {
    pub fn new(width: usize) -> Self {
        Self { width: width.max(1) }
    }

    fn slot(&self, kind: &str, id: u32) -> usize {
        let mut hasher = DefaultHasher::new();
        kind.hash(&mut hasher);
        id.hash(&mut hasher);
        (hasher.finish() % self.width as u64) as usize
    }
}

impl InputEncoder for HashedIdEncoder {
    fn input_dim(&self) -> usize {
        self.width
    }

    fn encode(&self, user_id: UserId, item_id: ItemId) -> Result<DVector<f32>> {
        let mut vector = DVector::zeros(self.width);
        vector[self.slot("user", user_id)] = 1.0;
        vector[self.slot("item", item_id)] = 1.0;
        Ok(vector)
    }
}
