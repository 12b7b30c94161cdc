//! Top-K ranking over candidate items.
//!
//! Candidates are scored in parallel but collected in candidate order, and the
//! descending sort is stable, so equal scores keep their input order.
//! Repeated candidate ids are scored once, at their first position.

use crate::error::Result;
use crate::features::IdIndex;
use crate::models::{ItemId, RecommendationItem};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::warn;

pub const DEFAULT_TOP_K: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct Ranker {
    top_k: usize,
}

impl Default for Ranker {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_K)
    }
}

impl Ranker {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Scores every candidate not in `rated` and returns the best `top_k`.
    ///
    /// Candidates whose score fails with a recoverable error, or is not
    /// finite, are dropped with a warning. Other errors abort the ranking.
    pub fn rank<F>(&self, candidates: &[ItemId], rated: &HashSet<ItemId>, score: F) -> Result<Vec<RecommendationItem>>
    where
        F: Fn(ItemId) -> Result<f32> + Sync,
    {
        let distinct = IdIndex::from_ids(candidates.iter().copied());
        let scored: Vec<Option<RecommendationItem>> = distinct
            .ids()
            .par_iter()
            .filter(|&&item_id| !rated.contains(&item_id))
            .map(|&item_id| match score(item_id) {
                Ok(value) if value.is_finite() => Ok(Some(RecommendationItem { item_id, score: value })),
                Ok(value) => {
                    warn!(item_id, value, "Skipping candidate with non-finite score");
                    Ok(None)
                }
                Err(e) if e.is_recoverable() => {
                    warn!(item_id, "Skipping candidate: {}", e);
                    Ok(None)
                }
                Err(e) => Err(e),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut ranked: Vec<RecommendationItem> = scored.into_iter().flatten().collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        ranked.truncate(self.top_k);
        Ok(ranked)
    }
}
