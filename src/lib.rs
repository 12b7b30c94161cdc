pub mod algorithms;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod models;
pub mod services;
pub mod utils;

pub use algorithms::{
    BiasedMatrixFactorization, EmbeddingModel, FeedForwardRegressor, PcaProjector, RecommendationAlgorithm,
    TwoTowerModel,
};
pub use config::Config;
pub use error::{EngineError, Result};
pub use models::*;
pub use services::{RecommendationService, TrainingService};

/// Installs the fmt subscriber with a filter taken from `RUST_LOG`.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
