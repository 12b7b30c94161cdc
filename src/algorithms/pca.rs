//! Principal component projection by power iteration with deflation.
//!
//! Each component runs a fixed number of iterations from a random-sign start
//! vector of magnitude `1/sqrt(D)` per coordinate. There is no convergence
//! tolerance, so closely spaced eigenvalues give approximate components.
//! After each component is extracted its contribution `lambda * v v^T` is
//! removed from the covariance matrix.

use super::initializer;
use crate::config::PcaConfig;
use crate::error::{EngineError, Result};
use crate::models::EmbeddingProjection;
use crate::utils::normalize_vector;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use tracing::debug;

const MIN_NORM: f32 = 1e-12;

#[derive(Debug)]
pub struct PcaProjector {
    iterations: usize,
    rng: StdRng,
    mean: DVector<f32>,
    /// One unit row per component, strongest first
    components: Vec<DVector<f32>>,
    explained_variance: Vec<f32>,
}

impl PcaProjector {
    pub fn new(iterations: usize, seed: u64) -> Self {
        Self {
            iterations,
            rng: initializer::seeded_rng(seed),
            mean: DVector::zeros(0),
            components: Vec::new(),
            explained_variance: Vec::new(),
        }
    }

    pub fn from_config(config: &PcaConfig, seed: u64) -> Self {
        Self::new(config.iterations, seed)
    }

    pub fn is_fitted(&self) -> bool {
        !self.components.is_empty()
    }

    pub fn input_dim(&self) -> usize {
        self.mean.len()
    }

    pub fn components(&self) -> Vec<Vec<f32>> {
        self.components.iter().map(|c| c.iter().copied().collect()).collect()
    }

    /// Variance captured by each component (its eigenvalue estimate)
    pub fn explained_variance(&self) -> &[f32] {
        &self.explained_variance
    }

    /// Fits `k` components to `vectors`, which must all share one dimension.
    pub fn fit(&mut self, vectors: &[Vec<f32>], k: usize) -> Result<()> {
        let dim = vectors.first().map(Vec::len).ok_or(EngineError::InsufficientData {
            what: "vectors to project",
            required: 1,
            actual: 0,
        })?;
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(EngineError::DimensionMismatch {
                expected: dim,
                actual: bad.len(),
            });
        }
        if k == 0 || k > dim {
            return Err(EngineError::InvalidConfiguration(format!(
                "cannot extract {} components from {}-dimensional vectors",
                k, dim
            )));
        }

        let n = vectors.len() as f32;
        let mut mean = DVector::<f32>::zeros(dim);
        for v in vectors {
            mean += DVector::from_column_slice(v);
        }
        mean /= n;

        let mut covariance = DMatrix::<f32>::zeros(dim, dim);
        for v in vectors {
            let centered = DVector::from_column_slice(v) - &mean;
            covariance += &centered * centered.transpose();
        }
        covariance /= n;

        let mut components = Vec::with_capacity(k);
        let mut explained_variance = Vec::with_capacity(k);
        for component in 0..k {
            let v = self.dominant_eigenvector(&covariance);
            let eigenvalue = (v.transpose() * &covariance * &v)[(0, 0)].max(0.0);
            covariance -= (&v * v.transpose()) * eigenvalue;
            debug!(component, eigenvalue, "Extracted principal component");

            components.push(v);
            explained_variance.push(eigenvalue);
        }

        self.mean = mean;
        self.components = components;
        self.explained_variance = explained_variance;
        Ok(())
    }

    fn dominant_eigenvector(&mut self, covariance: &DMatrix<f32>) -> DVector<f32> {
        let dim = covariance.nrows();
        let mut v = DVector::from_vec(initializer::random_sign_unit(&mut self.rng, dim));

        for _ in 0..self.iterations {
            let mut next: Vec<f32> = (covariance * &v).iter().copied().collect();
            // zero or exhausted covariance: keep the current direction
            if !normalize_vector(&mut next, MIN_NORM) {
                break;
            }
            v = DVector::from_vec(next);
        }
        v
    }

    /// Coordinates of each vector on the fitted components, in input order
    pub fn project(&self, vectors: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        if !self.is_fitted() {
            return Err(EngineError::UninitializedModel(
                "projector has not been fitted".to_string(),
            ));
        }
        vectors
            .iter()
            .map(|v| {
                if v.len() != self.input_dim() {
                    return Err(EngineError::DimensionMismatch {
                        expected: self.input_dim(),
                        actual: v.len(),
                    });
                }
                let centered = DVector::from_column_slice(v) - &self.mean;
                Ok(self.components.iter().map(|c| c.dot(&centered)).collect())
            })
            .collect()
    }

    pub fn fit_project(&mut self, vectors: &[Vec<f32>], k: usize) -> Result<EmbeddingProjection> {
        self.fit(vectors, k)?;
        Ok(EmbeddingProjection {
            coordinates: self.project(vectors)?,
            components: self.components(),
            explained_variance: self.explained_variance.clone(),
        })
    }
}

/// One-shot fit and projection with a fresh projector
pub fn project_embeddings(vectors: &[Vec<f32>], k: usize, iterations: usize, seed: u64) -> Result<EmbeddingProjection> {
    PcaProjector::new(iterations, seed).fit_project(vectors, k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn anisotropic(n: usize) -> Vec<Vec<f32>> {
        let mut rng = initializer::seeded_rng(11);
        (0..n)
            .map(|_| {
                vec![
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-0.2..0.2),
                ]
            })
            .collect()
    }

    #[test]
    fn test_projection_keeps_order_and_shape() {
        let data = anisotropic(50);
        let projection = project_embeddings(&data, 2, 10, 1).unwrap();
        assert_eq!(projection.coordinates.len(), 50);
        assert!(projection.coordinates.iter().all(|c| c.len() == 2));
        assert_eq!(projection.components.len(), 2);
    }

    #[test]
    fn test_variance_ordering_with_full_rank() {
        let data = anisotropic(200);
        let mut pca = PcaProjector::new(10, 3);
        pca.fit(&data, 3).unwrap();

        let variance = pca.explained_variance();
        assert!(variance[0] >= variance[1]);
        assert!(variance[1] >= variance[2]);

        // top component lies along the widest axis
        let top = &pca.components()[0];
        assert!(top[0].abs() > 0.95);

        // projected coordinates carry the same ordering
        let coords = pca.project(&data).unwrap();
        let column_var = |c: usize| {
            let values: Vec<f32> = coords.iter().map(|row| row[c]).collect();
            crate::utils::std_dev(&values).powi(2)
        };
        assert!(column_var(0) >= column_var(1));
    }

    #[test]
    fn test_components_are_unit_length() {
        let data = anisotropic(100);
        let mut pca = PcaProjector::new(10, 5);
        pca.fit(&data, 2).unwrap();
        for component in pca.components() {
            let norm: f32 = component.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_degenerate_inputs_stay_finite() {
        let single = vec![vec![1.0, 2.0, 3.0]];
        let projection = project_embeddings(&single, 2, 10, 1).unwrap();
        assert!(projection.coordinates[0].iter().all(|&x| x == 0.0));

        let zeros = vec![vec![0.0; 4]; 5];
        let projection = project_embeddings(&zeros, 2, 10, 1).unwrap();
        assert!(projection.coordinates.iter().flatten().all(|x| x.is_finite()));
        assert!(projection.explained_variance.iter().all(|&v| v == 0.0));

        let scalar = vec![vec![1.0], vec![3.0]];
        let projection = project_embeddings(&scalar, 1, 10, 1).unwrap();
        assert!((projection.explained_variance[0] - 1.0).abs() < 1e-5);
        assert!((projection.coordinates[0][0].abs() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        assert!(matches!(
            project_embeddings(&[], 2, 10, 1),
            Err(EngineError::InsufficientData { .. })
        ));
        assert!(matches!(
            project_embeddings(&[vec![1.0, 2.0], vec![1.0]], 1, 10, 1),
            Err(EngineError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            project_embeddings(&[vec![1.0, 2.0]], 3, 10, 1),
            Err(EngineError::InvalidConfiguration(_))
        ));
        assert!(PcaProjector::new(10, 1).project(&[vec![1.0]]).is_err());
    }
}
