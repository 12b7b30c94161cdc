//! Feed-forward pointwise rating regressor.
//!
//! Ratings are regressed in logit space: `target = logit((r - 1) / 4)` with
//! the probability clamped to `[eps, 1 - eps]`, so ratings of exactly 1 or 5
//! map to finite targets. Predictions map back through `1 + 4 * sigmoid(y)`.

use super::initializer;
use super::network::{self, DenseLayer, Dropout};
use super::{EarlyStopping, EpochOutcome, RecommendationAlgorithm};
use crate::config::RegressorConfig;
use crate::error::{EngineError, Result};
use crate::features::InputEncoder;
use crate::models::{Interaction, ItemId, UserId};
use crate::utils::validation::{self, MAX_RATING, MIN_RATING};
use crate::utils::{logit, sigmoid};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct FeedForwardRegressor {
    config: RegressorConfig,
    min_interactions: usize,
    encoder: Option<Box<dyn InputEncoder>>,
    layers: Vec<DenseLayer>,
    learning_rate: f32,
    previous_loss: Option<f32>,
    rng: StdRng,
}

impl FeedForwardRegressor {
    pub fn new(config: RegressorConfig, min_interactions: usize, seed: u64) -> Self {
        let learning_rate = config.learning_rate;
        Self {
            config,
            min_interactions,
            encoder: None,
            layers: Vec::new(),
            learning_rate,
            previous_loss: None,
            rng: initializer::seeded_rng(seed),
        }
    }

    pub fn with_encoder(mut self, encoder: Box<dyn InputEncoder>) -> Self {
        self.set_encoder(encoder);
        self
    }

    /// Swapping the encoder discards the network; call `initialize` again.
    pub fn set_encoder(&mut self, encoder: Box<dyn InputEncoder>) {
        self.encoder = Some(encoder);
        self.layers.clear();
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Logit-space regression target for a rating in [1, 5]
    pub fn rating_to_target(&self, rating: f32) -> Result<f32> {
        validation::validate_rating(rating)?;
        let eps = self.config.target_epsilon;
        let p = ((rating - MIN_RATING) / (MAX_RATING - MIN_RATING)).clamp(eps, 1.0 - eps);
        Ok(logit(p))
    }

    pub fn output_to_rating(output: f32) -> f32 {
        (MIN_RATING + (MAX_RATING - MIN_RATING) * sigmoid(output)).clamp(MIN_RATING, MAX_RATING)
    }

    fn encoder(&self) -> Result<&dyn InputEncoder> {
        self.encoder.as_deref().ok_or_else(|| {
            EngineError::UninitializedModel("regressor input features are not set".to_string())
        })
    }

    fn require_network(&self) -> Result<()> {
        if self.layers.is_empty() {
            Err(EngineError::UninitializedModel(
                "regressor network has not been initialized".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// One forward/backward pass with dropout; returns the squared error in
    /// logit space. Nothing is written when the error or a gradient is not finite.
    pub fn train_step(&mut self, user_id: UserId, item_id: ItemId, rating: f32) -> Result<f32> {
        self.require_network()?;
        let input = self.encoder()?.encode(user_id, item_id)?;
        let target = self.rating_to_target(rating)?;

        let pass = network::forward(
            &self.layers,
            &input,
            Some(Dropout {
                rate: self.config.dropout,
                rng: &mut self.rng,
            }),
        )?;
        let error = pass.output[0] - target;
        let squared_error = validation::ensure_finite("regressor step", error * error)?;

        let gradients = network::backward(&self.layers, &pass, &DVector::from_element(1, error));
        if !gradients.iter().all(|g| g.is_finite()) {
            return Err(EngineError::unstable("regressor gradient", f32::NAN));
        }
        network::apply_gradients(
            &mut self.layers,
            &gradients,
            self.learning_rate,
            self.config.regularization,
        );

        Ok(squared_error)
    }

    fn forward_output(&self, user_id: UserId, item_id: ItemId) -> Result<f32> {
        self.require_network()?;
        let input = self.encoder()?.encode(user_id, item_id)?;
        let pass = network::forward(&self.layers, &input, None)?;
        validation::ensure_finite("regressor prediction", pass.output[0])
    }
}

impl RecommendationAlgorithm for FeedForwardRegressor {
    fn name(&self) -> &'static str {
        "regressor"
    }

    /// The network shape depends only on the encoder; the id sets are not stored.
    fn initialize(&mut self, _user_ids: &[UserId], _item_ids: &[ItemId]) -> Result<()> {
        let input_dim = self.encoder()?.input_dim();

        let mut dims = Vec::with_capacity(self.config.hidden_layers.len() + 2);
        dims.push(input_dim);
        dims.extend(self.config.hidden_layers.iter().copied());
        dims.push(1);

        self.layers = network::build_layers(&mut self.rng, &dims);
        self.learning_rate = self.config.learning_rate;
        self.previous_loss = None;
        info!(?dims, "Initialized regressor network");
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        !self.layers.is_empty()
    }

    fn begin_training(&mut self, interactions: &[Interaction]) -> Result<()> {
        self.require_network()?;
        validation::validate_training_set(interactions, self.min_interactions)?;
        self.learning_rate = self.config.learning_rate;
        self.previous_loss = None;
        info!(interactions = interactions.len(), "Starting regressor training");
        Ok(())
    }

    /// One shuffled pass. The learning rate decays when the epoch ends worse
    /// than the one before it.
    fn train_epoch(&mut self, interactions: &[Interaction]) -> Result<EpochOutcome> {
        self.require_network()?;

        let mut order: Vec<usize> = (0..interactions.len()).collect();
        order.shuffle(&mut self.rng);

        let mut total = 0.0f64;
        let mut count = 0usize;
        let mut skipped = 0usize;

        for idx in order {
            let interaction = &interactions[idx];
            match self.train_step(interaction.user_id, interaction.item_id, interaction.rating) {
                Ok(squared_error) => {
                    total += squared_error as f64;
                    count += 1;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping regressor step: {}", e);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if count == 0 {
            return Err(EngineError::unstable("regressor epoch with no valid steps", f32::NAN));
        }
        let loss = (total / count as f64) as f32;

        if let Some(previous) = self.previous_loss {
            if loss > previous {
                self.learning_rate *= self.config.lr_decay;
                debug!(
                    loss,
                    previous,
                    learning_rate = self.learning_rate,
                    "Loss increased, decaying learning rate"
                );
            }
        }
        self.previous_loss = Some(loss);

        Ok(EpochOutcome {
            loss,
            skipped_steps: skipped,
        })
    }

    fn early_stopping(&self) -> EarlyStopping {
        EarlyStopping::new(self.config.min_epochs, self.config.tolerance)
    }

    fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<f32> {
        let output = self.forward_output(user_id, item_id)?;
        Ok(Self::output_to_rating(output))
    }

    fn score(&self, user_id: UserId, item_id: ItemId) -> Result<f32> {
        self.predict(user_id, item_id)
    }
}
