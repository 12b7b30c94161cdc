use criterion::{black_box, criterion_group, criterion_main, Criterion};
use embedrec::algorithms::contrastive::{in_batch_softmax_loss, ContrastiveTrainer};
use embedrec::algorithms::network::{self, build_layers};
use embedrec::algorithms::optimizer::Adam;
use embedrec::algorithms::pca::project_embeddings;
use embedrec::algorithms::ranker::Ranker;
use embedrec::algorithms::tower::seeded_embedding_tower;
use embedrec::algorithms::initializer::seeded_rng;
use embedrec::config::FactorizationConfig;
use embedrec::dataset::synthetic_interactions;
use embedrec::*;
use nalgebra::{DMatrix, DVector};
use std::collections::HashSet;

fn benchmark_factorization(c: &mut Criterion) {
    let interactions = synthetic_interactions(100, 200, 30, 1);
    let users: Vec<UserId> = (1..=100).collect();
    let items: Vec<ItemId> = (1..=200).collect();

    c.bench_function("factorization_epoch", |b| {
        let mut model = BiasedMatrixFactorization::new(FactorizationConfig::default(), 10, 1);
        model.initialize(&users, &items).unwrap();
        model.begin_training(&interactions).unwrap();
        b.iter(|| black_box(model.train_epoch(&interactions).unwrap()));
    });

    c.bench_function("factorization_predict", |b| {
        let mut model = BiasedMatrixFactorization::new(FactorizationConfig::default(), 10, 1);
        model.initialize(&users, &items).unwrap();
        b.iter(|| black_box(model.predict(black_box(17), black_box(42)).unwrap()));
    });
}

fn benchmark_network(c: &mut Criterion) {
    let mut rng = seeded_rng(3);
    let layers = build_layers(&mut rng, &[22, 64, 32, 1]);
    let input = DVector::from_element(22, 0.3);

    c.bench_function("network_forward", |b| {
        b.iter(|| black_box(network::forward(&layers, &input, None).unwrap()));
    });

    c.bench_function("network_forward_backward", |b| {
        b.iter(|| {
            let pass = network::forward(&layers, &input, None).unwrap();
            let error = DVector::from_element(1, pass.output[0] - 0.5);
            black_box(network::backward(&layers, &pass, &error))
        });
    });
}

fn benchmark_contrastive(c: &mut Criterion) {
    let scores = DMatrix::from_fn(64, 64, |r, c| ((r * 7 + c * 3) % 11) as f32 / 11.0);
    c.bench_function("in_batch_softmax_loss_64", |b| {
        b.iter(|| black_box(in_batch_softmax_loss(&scores)));
    });

    c.bench_function("contrastive_step_64", |b| {
        let mut users = seeded_embedding_tower(1, 500, 32, 0.1).unwrap();
        let mut items = seeded_embedding_tower(2, 800, 32, 0.1).unwrap();
        let mut trainer = ContrastiveTrainer::with_optimizer(0.01, 0.001, Box::new(Adam::default()));
        let batch: Vec<(usize, usize)> = (0..64).map(|n| (n * 7 % 500, n * 11 % 800)).collect();
        b.iter(|| black_box(trainer.train_step(&mut users, &mut items, &batch).unwrap()));
    });
}

fn benchmark_pca(c: &mut Criterion) {
    let vectors: Vec<Vec<f32>> = (0..1000)
        .map(|n| (0..32).map(|d| ((n * 31 + d * 17) % 97) as f32 / 97.0).collect())
        .collect();

    c.bench_function("pca_project_1000x32_to_2", |b| {
        b.iter(|| black_box(project_embeddings(&vectors, 2, 10, 5).unwrap()));
    });
}

fn benchmark_ranking(c: &mut Criterion) {
    let candidates: Vec<ItemId> = (0..5000).collect();
    let rated: HashSet<ItemId> = (0..5000).step_by(7).collect();
    let ranker = Ranker::new(10);

    c.bench_function("rank_top10_of_5000", |b| {
        b.iter(|| {
            black_box(
                ranker
                    .rank(&candidates, &rated, |id| Ok((id.wrapping_mul(2_654_435_761) % 1000) as f32))
                    .unwrap(),
            )
        });
    });
}

criterion_group!(
    benches,
    benchmark_factorization,
    benchmark_network,
    benchmark_contrastive,
    benchmark_pca,
    benchmark_ranking
);
criterion_main!(benches);
