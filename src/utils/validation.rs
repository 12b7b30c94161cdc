use crate::error::{EngineError, Result};
use crate::models::Interaction;

pub const MIN_RATING: f32 = 1.0;
pub const MAX_RATING: f32 = 5.0;

/// Ratings must be finite and inside `[MIN_RATING, MAX_RATING]`
pub fn validate_rating(rating: f32) -> Result<()> {
    if !rating.is_finite() {
        return Err(EngineError::DegenerateTarget {
            rating,
            reason: "rating is not finite".to_string(),
        });
    }

    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(EngineError::DegenerateTarget {
            rating,
            reason: format!("rating outside [{}, {}]", MIN_RATING, MAX_RATING),
        });
    }

    Ok(())
}

/// Fails fast when the training set is too small to run a meaningful epoch loop.
/// Individual records are checked by each training step.
pub fn validate_training_set(interactions: &[Interaction], min_interactions: usize) -> Result<()> {
    if interactions.len() < min_interactions.max(1) {
        return Err(EngineError::InsufficientData {
            what: "interactions",
            required: min_interactions.max(1),
            actual: interactions.len(),
        });
    }

    Ok(())
}

pub fn validate_embedding(embedding: &[f32], expected_dim: usize) -> Result<()> {
    if embedding.len() != expected_dim {
        return Err(EngineError::DimensionMismatch {
            expected: expected_dim,
            actual: embedding.len(),
        });
    }

    if let Some(&bad) = embedding.iter().find(|v| !v.is_finite()) {
        return Err(EngineError::unstable("embedding validation", bad));
    }

    Ok(())
}

pub fn ensure_finite(context: &str, value: f32) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EngineError::unstable(context, value))
    }
}
