//! Dense layers with hand-written forward and backward passes.
//!
//! A layer is plain data; `forward`, `backward` and `apply_gradients` are free
//! functions over a layer slice plus the cached intermediates of one pass.
//! Hidden layers use leaky ReLU in both directions. Dropout is inverted: kept
//! units are scaled by `1 / (1 - rate)` and the scaled mask is reused by the
//! backward pass. The output layer is linear.

use super::initializer;
use crate::error::{EngineError, Result};
use crate::utils::{leaky_relu, leaky_relu_derivative};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct DenseLayer {
    /// `fan_out x fan_in`
    pub weights: DMatrix<f32>,
    pub biases: DVector<f32>,
}

impl DenseLayer {
    pub fn he_initialized(rng: &mut StdRng, fan_in: usize, fan_out: usize) -> Self {
        let values = initializer::he_normal(rng, fan_in, fan_in * fan_out);
        Self {
            weights: DMatrix::from_vec(fan_out, fan_in, values),
            biases: DVector::zeros(fan_out),
        }
    }

    pub fn fan_in(&self) -> usize {
        self.weights.ncols()
    }

    pub fn fan_out(&self) -> usize {
        self.weights.nrows()
    }
}

/// Builds layers chaining `dims[0] -> dims[1] -> ... -> dims[n]`
pub fn build_layers(rng: &mut StdRng, dims: &[usize]) -> Vec<DenseLayer> {
    dims.windows(2)
        .map(|pair| DenseLayer::he_initialized(rng, pair[0], pair[1]))
        .collect()
}

pub struct Dropout<'a> {
    pub rate: f32,
    pub rng: &'a mut StdRng,
}

/// Everything the backward pass needs from one forward pass
#[derive(Debug, Clone)]
pub struct ForwardPass {
    pub output: DVector<f32>,
    /// `activations[l]` is the input to layer `l`; `activations[0]` is the raw input
    pub activations: Vec<DVector<f32>>,
    /// `pre_activations[l] = W_l a_l + b_l`
    pub pre_activations: Vec<DVector<f32>>,
    /// One mask per hidden layer; all ones outside training
    pub dropout_masks: Vec<DVector<f32>>,
}

#[derive(Debug, Clone)]
pub struct LayerGradient {
    pub weights: DMatrix<f32>,
    pub biases: DVector<f32>,
}

impl LayerGradient {
    pub fn zeros_like(layer: &DenseLayer) -> Self {
        Self {
            weights: DMatrix::zeros(layer.fan_out(), layer.fan_in()),
            biases: DVector::zeros(layer.fan_out()),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.weights.iter().chain(self.biases.iter()).all(|v| v.is_finite())
    }
}

pub fn forward(layers: &[DenseLayer], input: &DVector<f32>, mut dropout: Option<Dropout<'_>>) -> Result<ForwardPass> {
    let first = layers.first().ok_or_else(|| {
        EngineError::UninitializedModel("network has no layers".to_string())
    })?;
    if input.len() != first.fan_in() {
        return Err(EngineError::DimensionMismatch {
            expected: first.fan_in(),
            actual: input.len(),
        });
    }

    let last = layers.len() - 1;
    let mut activations = Vec::with_capacity(layers.len() + 1);
    let mut pre_activations = Vec::with_capacity(layers.len());
    let mut dropout_masks = Vec::with_capacity(last);
    activations.push(input.clone());

    for (l, layer) in layers.iter().enumerate() {
        let z = &layer.weights * &activations[l] + &layer.biases;

        if l == last {
            activations.push(z.clone());
        } else {
            let mut a = z.map(leaky_relu);
            let mask = match dropout.as_mut() {
                Some(d) if d.rate > 0.0 => {
                    let keep_scale = 1.0 / (1.0 - d.rate);
                    DVector::from_fn(a.len(), |_, _| {
                        if d.rng.gen::<f32>() < d.rate {
                            0.0
                        } else {
                            keep_scale
                        }
                    })
                }
                _ => DVector::from_element(a.len(), 1.0),
            };
            a.component_mul_assign(&mask);
            activations.push(a);
            dropout_masks.push(mask);
        }
        pre_activations.push(z);
    }

    Ok(ForwardPass {
        output: activations[layers.len()].clone(),
        activations,
        pre_activations,
        dropout_masks,
    })
}

/// Back-propagates `output_error` (dLoss/dOutput) and returns one gradient
/// per layer, in layer order. Parameters are not touched.
pub fn backward(layers: &[DenseLayer], pass: &ForwardPass, output_error: &DVector<f32>) -> Vec<LayerGradient> {
    let mut gradients = Vec::with_capacity(layers.len());
    let mut delta = output_error.clone();

    for l in (0..layers.len()).rev() {
        let weights = &delta * pass.activations[l].transpose();
        let biases = delta.clone();

        if l > 0 {
            let mut previous = layers[l].weights.tr_mul(&delta);
            previous.component_mul_assign(&pass.pre_activations[l - 1].map(leaky_relu_derivative));
            previous.component_mul_assign(&pass.dropout_masks[l - 1]);
            delta = previous;
        }

        gradients.push(LayerGradient { weights, biases });
    }

    gradients.reverse();
    gradients
}

/// Adds `other` into `into` layer by layer
pub fn accumulate(into: &mut [LayerGradient], other: &[LayerGradient]) {
    for (acc, grad) in into.iter_mut().zip(other) {
        acc.weights += &grad.weights;
        acc.biases += &grad.biases;
    }
}

/// `w -= lr * (grad + reg * w)`, `b -= lr * grad`
pub fn apply_gradients(layers: &mut [DenseLayer], gradients: &[LayerGradient], learning_rate: f32, regularization: f32) {
    for (layer, grad) in layers.iter_mut().zip(gradients) {
        let weight_step = (&grad.weights + &layer.weights * regularization) * learning_rate;
        layer.weights -= weight_step;
        let bias_step = &grad.biases * learning_rate;
        layer.biases -= bias_step;
    }
}
