use crate::config::OptimizerKind;
use std::collections::HashMap;

/// Applies one gradient step to a flat parameter block. `key` identifies the
/// block so stateful optimizers can keep per-block moments.
pub trait Optimizer: Send + Sync + std::fmt::Debug {
    fn update(&mut self, key: &str, params: &mut [f32], gradients: &[f32], learning_rate: f32);
    fn reset(&mut self);
}

pub fn build_optimizer(kind: OptimizerKind) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Sgd => Box::new(SGD),
        OptimizerKind::Adam => Box::new(Adam::default()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct SGD;

impl Optimizer for SGD {
    fn update(&mut self, _key: &str, params: &mut [f32], gradients: &[f32], learning_rate: f32) {
        for (p, g) in params.iter_mut().zip(gradients) {
            *p -= learning_rate * g;
        }
    }

    fn reset(&mut self) {}
}

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

#[derive(Debug, Clone)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: HashMap<String, Moments>,
}

impl Adam {
    pub fn new(beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            epsilon,
            state: HashMap::new(),
        }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn update(&mut self, key: &str, params: &mut [f32], gradients: &[f32], learning_rate: f32) {
        let moments = self
            .state
            .entry(key.to_string())
            .or_insert_with(|| Moments {
                m: vec![0.0; params.len()],
                v: vec![0.0; params.len()],
                t: 0,
            });
        moments.t += 1;

        let bias1 = 1.0 - self.beta1.powi(moments.t);
        let bias2 = 1.0 - self.beta2.powi(moments.t);

        for (i, (p, &g)) in params.iter_mut().zip(gradients).enumerate() {
            moments.m[i] = self.beta1 * moments.m[i] + (1.0 - self.beta1) * g;
            moments.v[i] = self.beta2 * moments.v[i] + (1.0 - self.beta2) * g * g;

            let m_hat = moments.m[i] / bias1;
            let v_hat = moments.v[i] / bias2;
            *p -= learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    fn reset(&mut self) {
        self.state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_step() {
        let mut sgd = SGD;
        let mut params = vec![1.0, 2.0, 3.0];
        sgd.update("w", &mut params, &[0.1, 0.2, 0.3], 0.5);
        assert!((params[0] - 0.95).abs() < 1e-6);
        assert!((params[2] - 2.85).abs() < 1e-6);
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let mut adam = Adam::default();
        let mut params = vec![1.0, -1.0];
        adam.update("w", &mut params, &[0.5, -2.0], 0.1);
        assert!((params[0] - 0.9).abs() < 1e-4);
        assert!((params[1] + 0.9).abs() < 1e-4);
    }

    #[test]
    fn test_adam_keys_are_independent() {
        let mut adam = Adam::default();
        let mut a = vec![0.0];
        let mut b = vec![0.0];
        adam.update("a", &mut a, &[1.0], 0.1);
        adam.update("a", &mut a, &[1.0], 0.1);
        adam.update("b", &mut b, &[1.0], 0.1);
        assert!((b[0] + 0.1).abs() < 1e-4);
        assert!(a[0] < b[0]);

        adam.reset();
        let mut c = vec![0.0];
        adam.update("a", &mut c, &[1.0], 0.1);
        assert!((c[0] + 0.1).abs() < 1e-4);
    }
}
