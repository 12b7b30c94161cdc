//! Towers map a dense entity index to an embedding, either by table lookup or
//! by running the entity's feature vector through dense layers.

use super::initializer::{self, InitializationMethod};
use super::network::{self, DenseLayer, ForwardPass, LayerGradient};
use super::optimizer::Optimizer;
use crate::error::{EngineError, Result};
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use rand::rngs::StdRng;

#[derive(Debug, Clone)]
pub enum Tower {
    Embedding(EmbeddingTower),
    Network(NetworkTower),
}

#[derive(Debug, Clone)]
pub struct EmbeddingTower {
    table: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct NetworkTower {
    layers: Vec<DenseLayer>,
    /// Input features by entity index
    features: Vec<DVector<f32>>,
}

/// Intermediates of a batched tower forward pass
#[derive(Debug, Clone)]
pub enum TowerCache {
    Embedding,
    Network(Vec<ForwardPass>),
}

#[derive(Debug, Clone)]
pub enum TowerGradient {
    Table(Array2<f32>),
    Layers(Vec<LayerGradient>),
}

impl TowerGradient {
    pub fn is_finite(&self) -> bool {
        match self {
            TowerGradient::Table(grad) => grad.iter().all(|v| v.is_finite()),
            TowerGradient::Layers(grads) => grads.iter().all(LayerGradient::is_finite),
        }
    }
}

impl EmbeddingTower {
    pub fn random(rng: &mut StdRng, rows: usize, dim: usize, init_std: f32) -> Result<Self> {
        let values = InitializationMethod::Normal {
            mean: 0.0,
            std_dev: init_std,
        }
        .initialize(rng, rows * dim);
        Self::from_table(Array2::from_shape_vec((rows, dim), values).map_err(|_| {
            EngineError::DimensionMismatch {
                expected: rows * dim,
                actual: 0,
            }
        })?)
    }

    pub fn from_table(table: Array2<f32>) -> Result<Self> {
        if !table.is_standard_layout() {
            return Err(EngineError::InvalidConfiguration(
                "embedding table must be row-major".to_string(),
            ));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &Array2<f32> {
        &self.table
    }
}

impl NetworkTower {
    pub fn new(rng: &mut StdRng, features: Vec<Vec<f32>>, hidden: &[usize], output_dim: usize) -> Result<Self> {
        let input_dim = features.first().map(Vec::len).ok_or(EngineError::InsufficientData {
            what: "entities with features",
            required: 1,
            actual: 0,
        })?;
        if let Some(bad) = features.iter().find(|f| f.len() != input_dim) {
            return Err(EngineError::DimensionMismatch {
                expected: input_dim,
                actual: bad.len(),
            });
        }

        let mut dims = Vec::with_capacity(hidden.len() + 2);
        dims.push(input_dim);
        dims.extend_from_slice(hidden);
        dims.push(output_dim);

        Ok(Self {
            layers: network::build_layers(rng, &dims),
            features: features.into_iter().map(DVector::from_vec).collect(),
        })
    }
}

impl Tower {
    pub fn rows(&self) -> usize {
        match self {
            Tower::Embedding(t) => t.table.nrows(),
            Tower::Network(t) => t.features.len(),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Tower::Embedding(t) => t.table.ncols(),
            Tower::Network(t) => t.layers.last().map(DenseLayer::fan_out).unwrap_or(0),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Tower::Network(_))
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.rows() {
            Ok(())
        } else {
            Err(EngineError::DimensionMismatch {
                expected: self.rows(),
                actual: index + 1,
            })
        }
    }

    /// Inference embedding for one entity
    pub fn embed(&self, index: usize) -> Result<Vec<f32>> {
        self.check_index(index)?;
        match self {
            Tower::Embedding(t) => Ok(t.table.row(index).to_vec()),
            Tower::Network(t) => {
                let pass = network::forward(&t.layers, &t.features[index], None)?;
                Ok(pass.output.iter().copied().collect())
            }
        }
    }

    /// Embeds a batch into a `B x D` matrix and keeps what `gradients` needs
    pub fn forward_batch(&self, indices: &[usize]) -> Result<(DMatrix<f32>, TowerCache)> {
        for &index in indices {
            self.check_index(index)?;
        }
        let dim = self.dim();

        match self {
            Tower::Embedding(t) => {
                let out = DMatrix::from_fn(indices.len(), dim, |r, c| t.table[[indices[r], c]]);
                Ok((out, TowerCache::Embedding))
            }
            Tower::Network(t) => {
                let passes = indices
                    .iter()
                    .map(|&index| network::forward(&t.layers, &t.features[index], None))
                    .collect::<Result<Vec<_>>>()?;
                let out = DMatrix::from_fn(indices.len(), dim, |r, c| passes[r].output[c]);
                Ok((out, TowerCache::Network(passes)))
            }
        }
    }

    /// Parameter gradient given dLoss/dEmbedding for each batch row.
    /// Repeated indices accumulate.
    pub fn gradients(&self, indices: &[usize], cache: &TowerCache, output_grad: &DMatrix<f32>) -> Result<TowerGradient> {
        match (self, cache) {
            (Tower::Embedding(t), TowerCache::Embedding) => {
                let mut grad = Array2::zeros(t.table.raw_dim());
                for (r, &index) in indices.iter().enumerate() {
                    for c in 0..t.table.ncols() {
                        grad[[index, c]] += output_grad[(r, c)];
                    }
                }
                Ok(TowerGradient::Table(grad))
            }
            (Tower::Network(t), TowerCache::Network(passes)) => {
                let mut total: Vec<LayerGradient> = t.layers.iter().map(LayerGradient::zeros_like).collect();
                for (r, pass) in passes.iter().enumerate() {
                    let row_grad = output_grad.row(r).transpose();
                    let grads = network::backward(&t.layers, pass, &row_grad);
                    network::accumulate(&mut total, &grads);
                }
                Ok(TowerGradient::Layers(total))
            }
            _ => Err(EngineError::InvalidConfiguration(
                "tower cache does not match tower kind".to_string(),
            )),
        }
    }

    /// Single optimizer update for every parameter block of the tower
    pub fn apply(&mut self, gradient: &TowerGradient, optimizer: &mut dyn Optimizer, key: &str, learning_rate: f32) -> Result<()> {
        match (self, gradient) {
            (Tower::Embedding(t), TowerGradient::Table(grad)) => {
                let grads = grad.as_slice().ok_or_else(|| {
                    EngineError::InvalidConfiguration("gradient table is not contiguous".to_string())
                })?;
                let params = t.table.as_slice_mut().ok_or_else(|| {
                    EngineError::InvalidConfiguration("embedding table is not contiguous".to_string())
                })?;
                optimizer.update(key, params, grads, learning_rate);
                Ok(())
            }
            (Tower::Network(t), TowerGradient::Layers(grads)) => {
                for (l, (layer, grad)) in t.layers.iter_mut().zip(grads).enumerate() {
                    optimizer.update(
                        &format!("{}.{}.weights", key, l),
                        layer.weights.as_mut_slice(),
                        grad.weights.as_slice(),
                        learning_rate,
                    );
                    optimizer.update(
                        &format!("{}.{}.biases", key, l),
                        layer.biases.as_mut_slice(),
                        grad.biases.as_slice(),
                        learning_rate,
                    );
                }
                Ok(())
            }
            _ => Err(EngineError::InvalidConfiguration(
                "gradient does not match tower kind".to_string(),
            )),
        }
    }
}

/// Table tower seeded from `seed`; convenience for callers without an rng
pub fn seeded_embedding_tower(seed: u64, rows: usize, dim: usize, init_std: f32) -> Result<Tower> {
    let mut rng = initializer::seeded_rng(seed);
    Ok(Tower::Embedding(EmbeddingTower::random(&mut rng, rows, dim, init_std)?))
}
