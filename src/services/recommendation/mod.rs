use crate::algorithms::pca::PcaProjector;
use crate::algorithms::ranker::Ranker;
use crate::algorithms::RecommendationAlgorithm;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::features::{qualified_users, IdIndex};
use crate::models::{
    EmbeddingProjection, Interaction, ItemId, RecommendationItem, RecommendationResponse, TrainingReport, UserId,
};
use crate::services::training::{ModelHandle, TrainingService};
use crate::utils::cosine_similarity;
use crate::utils::metrics::{MetricsCalculator, RankingMetrics};
use crate::utils::validation::validate_embedding;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// The model-facing entry point: id registration, training, rating
/// prediction, ranking with rated-item exclusion and embedding projection.
pub struct RecommendationService<M> {
    model: ModelHandle<M>,
    config: Arc<Config>,
    items: IdIndex,
    rated: HashMap<UserId, HashSet<ItemId>>,
    /// Distinct training interactions, keyed by (user, item, timestamp)
    history: Vec<Interaction>,
    seen: HashSet<(UserId, ItemId, i64)>,
}

impl<M: RecommendationAlgorithm> RecommendationService<M> {
    pub fn new(model: M, config: Arc<Config>) -> Self {
        Self {
            model: Arc::new(RwLock::new(model)),
            config,
            items: IdIndex::default(),
            rated: HashMap::new(),
            history: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn model(&self) -> ModelHandle<M> {
        Arc::clone(&self.model)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fixes the user and item sets. Must run before training.
    pub fn initialize(&mut self, user_ids: &[UserId], item_ids: &[ItemId]) -> Result<()> {
        self.model.write().initialize(user_ids, item_ids)?;
        self.items = IdIndex::from_ids(item_ids.iter().copied());
        self.rated.clear();
        self.history.clear();
        self.seen.clear();
        Ok(())
    }

    /// Registers every user and item that appears in `interactions`.
    pub fn initialize_from(&mut self, interactions: &[Interaction]) -> Result<()> {
        let users: Vec<UserId> = IdIndex::from_ids(interactions.iter().map(|i| i.user_id)).ids().to_vec();
        let items: Vec<ItemId> = IdIndex::from_ids(interactions.iter().map(|i| i.item_id)).ids().to_vec();
        self.initialize(&users, &items)
    }

    /// Training on the same records again does not grow the history.
    fn record_history(&mut self, interactions: &[Interaction]) {
        for interaction in interactions {
            self.rated
                .entry(interaction.user_id)
                .or_default()
                .insert(interaction.item_id);
            if self
                .seen
                .insert((interaction.user_id, interaction.item_id, interaction.timestamp))
            {
                self.history.push(*interaction);
            }
        }
    }

    /// Synchronous training; returns per-epoch mean loss.
    pub fn train(&mut self, interactions: &[Interaction], epochs: usize) -> Result<Vec<f32>> {
        let losses = self.model.write().train(interactions, epochs)?;
        self.record_history(interactions);
        Ok(losses)
    }

    /// Training through `TrainingService`, yielding between epochs
    pub async fn train_async(&mut self, interactions: &[Interaction], epochs: usize) -> Result<TrainingReport> {
        let report = TrainingService::new(self.model()).run(interactions, epochs).await?;
        self.record_history(interactions);
        Ok(report)
    }

    pub fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32> {
        self.model.read().predict(user_id, item_id)
    }

    pub fn rated_items(&self, user_id: UserId) -> Option<&HashSet<ItemId>> {
        self.rated.get(&user_id)
    }

    /// Best `top_k` candidates for `user_id`, excluding items the user rated
    /// during training. Equal scores keep candidate order.
    pub fn recommend(&self, user_id: UserId, candidates: &[ItemId], top_k: usize) -> Result<RecommendationResponse> {
        let model = self.model.read();
        if !model.is_initialized() {
            return Err(EngineError::UninitializedModel(format!(
                "{} model has not been initialized",
                model.name()
            )));
        }

        let empty = HashSet::new();
        let rated = self.rated.get(&user_id).unwrap_or(&empty);
        let recommendations = Ranker::new(top_k).rank(candidates, rated, |item_id| model.score(user_id, item_id))?;

        Ok(RecommendationResponse {
            user_id,
            recommendations,
            generated_at: Utc::now(),
        })
    }

    /// `recommend` over the whole registered catalog with the configured K
    pub fn recommend_all(&self, user_id: UserId) -> Result<RecommendationResponse> {
        self.recommend(user_id, self.items.ids(), self.config.recommendation.top_k)
    }

    /// Recommendations for every user with enough training interactions
    pub fn recommend_qualified(&self) -> Result<Vec<RecommendationResponse>> {
        let users = qualified_users(&self.history, self.config.recommendation.qualified_user_threshold);
        info!(users = users.len(), "Recommending for qualified users");
        users.into_iter().map(|user_id| self.recommend_all(user_id)).collect()
    }

    /// Ranking quality against held-out interactions
    pub fn evaluate(&self, held_out: &[Interaction], k: usize) -> Result<RankingMetrics> {
        let mut relevant: HashMap<UserId, HashSet<ItemId>> = HashMap::new();
        for interaction in held_out {
            relevant
                .entry(interaction.user_id)
                .or_default()
                .insert(interaction.item_id);
        }

        let mut users: Vec<UserId> = relevant.keys().copied().collect();
        users.sort_unstable();

        let mut per_user = Vec::with_capacity(users.len());
        for user_id in users {
            let response = self.recommend(user_id, self.items.ids(), k)?;
            let ids: Vec<ItemId> = response.recommendations.iter().map(|r| r.item_id).collect();
            per_user.push((user_id, ids));
        }

        let metrics = MetricsCalculator::new(k).evaluate(
            per_user
                .iter()
                .filter_map(|(user_id, ids)| relevant.get(user_id).map(|set| (ids.as_slice(), set))),
            self.items.len(),
        );
        info!(
            users = metrics.users_evaluated,
            precision = metrics.precision_at_k,
            recall = metrics.recall_at_k,
            ndcg = metrics.ndcg_at_k,
            coverage = metrics.coverage,
            "Offline evaluation finished"
        );
        Ok(metrics)
    }

    /// Projects arbitrary vectors onto their top `k` principal components
    pub fn project_embeddings(&self, vectors: &[Vec<f32>], k: usize) -> Result<Vec<Vec<f32>>> {
        Ok(self.projector().fit_project(vectors, k)?.coordinates)
    }

    /// PCA of the model's item embedding table, in item index order
    pub fn project_item_embeddings(&self, k: usize) -> Result<(Vec<ItemId>, EmbeddingProjection)> {
        let (ids, vectors): (Vec<ItemId>, Vec<Vec<f32>>) = self.item_vectors()?.into_iter().unzip();
        Ok((ids, self.projector().fit_project(&vectors, k)?))
    }

    /// Items nearest to `item_id` by cosine similarity of their embeddings,
    /// the item itself excluded
    pub fn similar_items(&self, item_id: ItemId, top_k: usize) -> Result<Vec<RecommendationItem>> {
        let table: HashMap<ItemId, Vec<f32>> = self.item_vectors()?.into_iter().collect();
        let query = table.get(&item_id).ok_or(EngineError::UnknownEntity {
            kind: "item",
            id: item_id,
        })?;

        let exclude: HashSet<ItemId> = std::iter::once(item_id).collect();
        Ranker::new(top_k).rank(self.items.ids(), &exclude, |candidate| {
            table
                .get(&candidate)
                .map(|vector| cosine_similarity(query, vector))
                .ok_or(EngineError::UnknownEntity {
                    kind: "item",
                    id: candidate,
                })
        })
    }

    fn item_vectors(&self) -> Result<Vec<(ItemId, Vec<f32>)>> {
        let model = self.model.read();
        let embeddings = model.as_embedding_model().ok_or_else(|| {
            EngineError::InvalidConfiguration(format!("{} model has no embedding tables", model.name()))
        })?;
        let dim = embeddings.embedding_dim();
        let vectors = embeddings.item_embeddings()?;
        for (_, vector) in &vectors {
            validate_embedding(vector, dim)?;
        }
        Ok(vectors)
    }

    fn projector(&self) -> PcaProjector {
        PcaProjector::from_config(&self.config.pca, self.config.training.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{BiasedMatrixFactorization, FeedForwardRegressor};
    use crate::config::{FactorizationConfig, RegressorConfig};
    use crate::features::HashedIdEncoder;

    fn interactions() -> Vec<Interaction> {
        let mut out = Vec::new();
        for u in 1..=4u32 {
            for i in 1..=6u32 {
                if (u + i) % 3 != 0 {
                    out.push(Interaction::new(u, i, ((u * i) % 5 + 1) as f32));
                }
            }
        }
        out
    }

    fn factorization_service() -> RecommendationService<BiasedMatrixFactorization> {
        let config = Arc::new(Config::default());
        let model = BiasedMatrixFactorization::new(
            FactorizationConfig {
                embedding_dim: 4,
                ..FactorizationConfig::default()
            },
            1,
            3,
        );
        RecommendationService::new(model, config)
    }

    #[test]
    fn test_recommend_before_initialize_fails() {
        let service = factorization_service();
        assert!(matches!(
            service.recommend(1, &[1, 2], 5),
            Err(EngineError::UninitializedModel(_))
        ));
    }

    #[test]
    fn test_recommend_excludes_rated_items() {
        let mut service = factorization_service();
        let data = interactions();
        service.initialize_from(&data).unwrap();
        service.train(&data, 5).unwrap();

        for user_id in 1..=4u32 {
            let rated = service.rated_items(user_id).unwrap().clone();
            let response = service.recommend_all(user_id).unwrap();
            assert!(response.recommendations.len() <= 10);
            for item in &response.recommendations {
                assert!(!rated.contains(&item.item_id));
            }
            assert!(response
                .recommendations
                .windows(2)
                .all(|w| w[0].score >= w[1].score));
        }
    }

    #[test]
    fn test_qualified_users_threshold() {
        let config = Config {
            recommendation: crate::config::RecommendationConfig {
                top_k: 3,
                qualified_user_threshold: 4,
            },
            ..Config::default()
        };
        let model = BiasedMatrixFactorization::new(FactorizationConfig::default(), 1, 3);
        let mut service = RecommendationService::new(model, Arc::new(config));
        let mut data = interactions();
        data.push(Interaction::new(9, 1, 4.0));
        service.initialize_from(&data).unwrap();
        service.train(&data, 2).unwrap();

        let responses = service.recommend_qualified().unwrap();
        assert_eq!(responses.len(), 4);
        assert!(responses.iter().all(|r| r.user_id != 9));
        assert!(responses.iter().all(|r| r.recommendations.len() <= 3));
    }

    #[test]
    fn test_retraining_does_not_inflate_qualified_users() {
        let config = Config {
            recommendation: crate::config::RecommendationConfig {
                top_k: 3,
                qualified_user_threshold: 10,
            },
            ..Config::default()
        };
        let model = BiasedMatrixFactorization::new(FactorizationConfig::default(), 1, 3);
        let mut service = RecommendationService::new(model, Arc::new(config));
        let data: Vec<Interaction> = (1..=4u32)
            .flat_map(|u| (1..=6u32).map(move |i| Interaction::new(u, i, ((u + i) % 5 + 1) as f32)))
            .collect();
        service.initialize_from(&data).unwrap();

        service.train(&data, 2).unwrap();
        assert!(service.recommend_qualified().unwrap().is_empty());

        service.train(&data, 2).unwrap();
        assert!(service.recommend_qualified().unwrap().is_empty());

        // genuinely new interactions still count
        let later: Vec<Interaction> = data
            .iter()
            .map(|i| Interaction {
                timestamp: i.timestamp + 1,
                ..*i
            })
            .collect();
        service.train(&later, 2).unwrap();
        assert_eq!(service.recommend_qualified().unwrap().len(), 4);
    }

    #[test]
    fn test_project_item_embeddings() {
        let mut service = factorization_service();
        let data = interactions();
        service.initialize_from(&data).unwrap();

        let (ids, projection) = service.project_item_embeddings(2).unwrap();
        assert_eq!(ids.len(), 6);
        assert_eq!(projection.coordinates.len(), 6);
        assert!(projection.coordinates.iter().all(|c| c.len() == 2));
    }

    #[test]
    fn test_similar_items_excludes_query() {
        let mut service = factorization_service();
        let data = interactions();
        service.initialize_from(&data).unwrap();
        service.train(&data, 3).unwrap();

        let similar = service.similar_items(2, 3).unwrap();
        assert_eq!(similar.len(), 3);
        assert!(similar.iter().all(|r| r.item_id != 2));
        assert!(similar.iter().all(|r| (-1.0..=1.0 + 1e-5).contains(&r.score)));
        assert!(similar.windows(2).all(|w| w[0].score >= w[1].score));

        assert!(matches!(
            service.similar_items(42, 3),
            Err(EngineError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn test_regressor_has_no_embedding_tables() {
        let model = FeedForwardRegressor::new(RegressorConfig::default(), 1, 1)
            .with_encoder(Box::new(HashedIdEncoder::new(16)));
        let mut service = RecommendationService::new(model, Arc::new(Config::default()));
        service.initialize(&[1], &[1, 2]).unwrap();
        assert!(matches!(
            service.project_item_embeddings(2),
            Err(EngineError::InvalidConfiguration(_))
        ));
        let p = service.predict(1, 2).unwrap();
        assert!((1.0..=5.0).contains(&p));
    }

    #[test]
    fn test_evaluate_reports_metrics() {
        let mut service = factorization_service();
        let data = interactions();
        let (train, test) = crate::dataset::temporal_split(&data, 1);
        service.initialize_from(&data).unwrap();
        service.train(&train, 3).unwrap();

        let metrics = service.evaluate(&test, 3).unwrap();
        assert_eq!(metrics.users_evaluated, 4);
        assert!((0.0..=1.0).contains(&metrics.precision_at_k));
        assert!((0.0..=1.0).contains(&metrics.coverage));
    }
}
