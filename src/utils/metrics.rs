use crate::models::ItemId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Offline ranking quality averaged over evaluated users
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankingMetrics {
    pub users_evaluated: usize,
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub f1_score: f64,
    pub ndcg_at_k: f64,
    pub coverage: f64,
}

#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    k: usize,
}

impl MetricsCalculator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn calculate_precision_at_k(&self, recommended: &[ItemId], relevant: &HashSet<ItemId>) -> f64 {
        if recommended.is_empty() || self.k == 0 {
            return 0.0;
        }

        let hits = self.hits(recommended, relevant);
        hits as f64 / self.k.min(recommended.len()) as f64
    }

    pub fn calculate_recall_at_k(&self, recommended: &[ItemId], relevant: &HashSet<ItemId>) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }

        let hits = self.hits(recommended, relevant);
        hits as f64 / relevant.len() as f64
    }

    pub fn calculate_f1_score(&self, precision: f64, recall: f64) -> f64 {
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }

    /// Binary-relevance NDCG over the first `k` recommendations
    pub fn calculate_ndcg_at_k(&self, recommended: &[ItemId], relevant: &HashSet<ItemId>) -> f64 {
        let dcg: f64 = recommended
            .iter()
            .take(self.k)
            .enumerate()
            .filter(|(_, item_id)| relevant.contains(item_id))
            .map(|(i, _)| 1.0 / ((i + 2) as f64).log2())
            .sum();

        let ideal_hits = relevant.len().min(self.k);
        let idcg: f64 = (0..ideal_hits).map(|i| 1.0 / ((i + 2) as f64).log2()).sum();

        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }

    pub fn calculate_coverage(&self, recommended_items: &HashSet<ItemId>, catalog_size: usize) -> f64 {
        if catalog_size == 0 {
            return 0.0;
        }
        recommended_items.len() as f64 / catalog_size as f64
    }

    /// Averages per-user metrics. Users with nothing held out are skipped.
    pub fn evaluate<'a, I>(&self, per_user: I, catalog_size: usize) -> RankingMetrics
    where
        I: IntoIterator<Item = (&'a [ItemId], &'a HashSet<ItemId>)>,
    {
        let mut metrics = RankingMetrics::default();
        let mut recommended_union = HashSet::new();

        for (recommended, relevant) in per_user {
            if relevant.is_empty() {
                continue;
            }
            recommended_union.extend(recommended.iter().take(self.k).copied());

            let precision = self.calculate_precision_at_k(recommended, relevant);
            let recall = self.calculate_recall_at_k(recommended, relevant);
            metrics.precision_at_k += precision;
            metrics.recall_at_k += recall;
            metrics.ndcg_at_k += self.calculate_ndcg_at_k(recommended, relevant);
            metrics.users_evaluated += 1;
        }

        if metrics.users_evaluated > 0 {
            let n = metrics.users_evaluated as f64;
            metrics.precision_at_k /= n;
            metrics.recall_at_k /= n;
            metrics.ndcg_at_k /= n;
        }
        metrics.f1_score = self.calculate_f1_score(metrics.precision_at_k, metrics.recall_at_k);
        metrics.coverage = self.calculate_coverage(&recommended_union, catalog_size);
        metrics
    }

    fn hits(&self, recommended: &[ItemId], relevant: &HashSet<ItemId>) -> usize {
        recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant.contains(item))
            .count()
    }
}
