use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use embedrec::algorithms::RecommendationAlgorithm;
use embedrec::config::TowerKind;
use embedrec::dataset::{self, CatalogItem};
use embedrec::features::{FeatureBuilder, FeatureConcatEncoder, HashedIdEncoder, InputEncoder, GENRE_COUNT};
use embedrec::utils::metrics::RankingMetrics;
use embedrec::{
    init_tracing, BiasedMatrixFactorization, Config, FeedForwardRegressor, Interaction, RecommendationResponse,
    RecommendationService, TrainingReport, TwoTowerModel,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModelKind {
    Factorization,
    Regressor,
    TwoTower,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Train an embedding model and print recommendations", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Tab-separated rating file; synthetic data is used when absent
    #[arg(short, long)]
    ratings: Option<PathBuf>,

    /// Pipe-separated catalog file with genre flags
    #[arg(short, long)]
    items: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value = "factorization")]
    model: ModelKind,

    /// Overrides training.epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Overrides recommendation.top_k
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Users, items and ratings per user for synthetic data
    #[arg(long, num_args = 3, value_names = ["USERS", "ITEMS", "PER_USER"], default_values_t = [200, 300, 40])]
    synthetic: Vec<u32>,
}

#[derive(Serialize)]
struct RunSummary {
    report: TrainingReport,
    metrics: RankingMetrics,
    recommendations: Vec<RecommendationResponse>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing();

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };
    if let Some(top_k) = args.top_k {
        config.recommendation.top_k = top_k;
    }
    config.validate()?;
    let epochs = args.epochs.unwrap_or(config.training.epochs);

    let interactions = match &args.ratings {
        Some(path) => dataset::load_ratings(path).with_context(|| format!("reading {}", path.display()))?,
        None => {
            let (users, items, per_user) = (args.synthetic[0], args.synthetic[1], args.synthetic[2]);
            info!(users, items, per_user, "Generating synthetic interactions");
            dataset::synthetic_interactions(users, items, per_user as usize, config.training.seed)
        }
    };
    let catalog: Vec<CatalogItem> = match &args.items {
        Some(path) => dataset::load_catalog(path).with_context(|| format!("reading {}", path.display()))?,
        None => Vec::new(),
    };

    let (train, held_out) = dataset::temporal_split(&interactions, config.training.holdout_per_user);
    info!(
        train = train.len(),
        held_out = held_out.len(),
        "Split interactions"
    );

    let mut features = FeatureBuilder::from_interactions(&train, GENRE_COUNT);
    for item in &catalog {
        features.set_item_genres(item.item_id, &item.genres);
    }
    let tables = features.build();

    let config = Arc::new(config);
    let seed = config.training.seed;
    let min_interactions = config.training.min_interactions;

    let summary = match args.model {
        ModelKind::Factorization => {
            let model = BiasedMatrixFactorization::new(config.factorization.clone(), min_interactions, seed);
            run(model, Arc::clone(&config), &interactions, &train, &held_out, epochs).await?
        }
        ModelKind::Regressor => {
            let encoder: Box<dyn InputEncoder> = if config.regressor.hashed_input_width > 0 {
                Box::new(HashedIdEncoder::new(config.regressor.hashed_input_width))
            } else {
                Box::new(FeatureConcatEncoder::new(Arc::clone(&tables)))
            };
            let model = FeedForwardRegressor::new(config.regressor.clone(), min_interactions, seed).with_encoder(encoder);
            run(model, Arc::clone(&config), &interactions, &train, &held_out, epochs).await?
        }
        ModelKind::TwoTower => {
            let mut model = TwoTowerModel::new(config.two_tower.clone(), min_interactions, seed);
            if config.two_tower.tower == TowerKind::Network {
                model = model.with_features(Arc::clone(&tables));
            }
            run(model, Arc::clone(&config), &interactions, &train, &held_out, epochs).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run<M: RecommendationAlgorithm>(
    model: M,
    config: Arc<Config>,
    all: &[Interaction],
    train: &[Interaction],
    held_out: &[Interaction],
    epochs: usize,
) -> Result<RunSummary> {
    let top_k = config.recommendation.top_k;
    let components = config.pca.components;
    let mut service = RecommendationService::new(model, config);
    service.initialize_from(all)?;

    let report = service.train_async(train, epochs).await?;
    for (epoch, loss) in report.epoch_losses.iter().enumerate() {
        info!(epoch, loss, "Loss");
    }

    let metrics = service.evaluate(held_out, top_k)?;

    match service.project_item_embeddings(components) {
        Ok((ids, projection)) => {
            info!(
                items = ids.len(),
                explained_variance = ?projection.explained_variance,
                ratio = ?projection.explained_variance_ratio(),
                "Item embedding projection"
            );
            if let Some(&first) = ids.first() {
                let neighbours: Vec<_> = service.similar_items(first, 5)?.iter().map(|r| r.item_id).collect();
                info!(item = first, ?neighbours, "Nearest items by embedding");
            }
        }
        Err(e) => warn!("Skipping embedding projection: {}", e),
    }

    let recommendations = service.recommend_qualified()?;
    Ok(RunSummary {
        report,
        metrics,
        recommendations,
    })
}
