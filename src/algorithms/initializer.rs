use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Box-Muller sample from N(0, 1)
fn standard_normal<R: Rng>(rng: &mut R) -> f32 {
    // gen() is in [0, 1); keep u1 away from zero for the log.
    let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

pub fn normal<R: Rng>(rng: &mut R, size: usize, mean: f32, std_dev: f32) -> Vec<f32> {
    (0..size)
        .map(|_| standard_normal(rng) * std_dev + mean)
        .collect()
}

/// He initialisation: N(0, 2 / fan_in)
pub fn he_normal<R: Rng>(rng: &mut R, fan_in: usize, size: usize) -> Vec<f32> {
    let std_dev = (2.0 / fan_in.max(1) as f32).sqrt();
    normal(rng, size, 0.0, std_dev)
}

/// Unit vector whose coordinates are ±1/√dim with random signs
pub fn random_sign_unit<R: Rng>(rng: &mut R, dim: usize) -> Vec<f32> {
    let magnitude = 1.0 / (dim.max(1) as f32).sqrt();
    (0..dim)
        .map(|_| if rng.gen_bool(0.5) { magnitude } else { -magnitude })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub enum InitializationMethod {
    HeNormal { fan_in: usize },
    Normal { mean: f32, std_dev: f32 },
    Zeros,
}

impl InitializationMethod {
    pub fn initialize<R: Rng>(&self, rng: &mut R, size: usize) -> Vec<f32> {
        match *self {
            InitializationMethod::HeNormal { fan_in } => he_normal(rng, fan_in, size),
            InitializationMethod::Normal { mean, std_dev } => normal(rng, size, mean, std_dev),
            InitializationMethod::Zeros => vec![0.0; size],
        }
    }
}
