//! Error types for the embedding engine

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by training, inference and projection
#[derive(Debug, Error)]
pub enum EngineError {
    /// Inference or training attempted before parameters exist
    #[error("Model not initialized: {0}")]
    UninitializedModel(String),

    /// Rating cannot be turned into a regression target
    #[error("Rating {rating} cannot be used as a training target: {reason}")]
    DegenerateTarget {
        /// Offending rating
        rating: f32,
        /// Why it was rejected
        reason: String,
    },

    /// A loss, error or score became NaN or infinite
    #[error("Numeric instability during {context}: {value}")]
    NumericInstability {
        /// Where the value was produced
        context: String,
        /// The non-finite value
        value: f32,
    },

    /// Not enough data to run the requested operation
    #[error("Insufficient data: need at least {required} {what}, got {actual}")]
    InsufficientData {
        /// What was counted
        what: &'static str,
        /// Minimum required
        required: usize,
        /// Amount supplied
        actual: usize,
    },

    /// Vector or matrix shape does not match the model
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Entity id was never registered with the model
    #[error("Unknown {kind} id: {id}")]
    UnknownEntity {
        /// "user" or "item"
        kind: &'static str,
        /// Raw id
        id: u32,
    },

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Malformed rating or catalog record
    #[error("Invalid record at line {line}: {message}")]
    InvalidRecord {
        /// 1-based line number
        line: usize,
        /// Parse failure
        message: String,
    },

    /// Rating or catalog file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration source could not be read
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl EngineError {
    pub(crate) fn unstable(context: impl Into<String>, value: f32) -> Self {
        EngineError::NumericInstability {
            context: context.into(),
            value,
        }
    }

    /// Step-level failures that an epoch loop may skip and continue past
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::NumericInstability { .. }
                | EngineError::DegenerateTarget { .. }
                | EngineError::UnknownEntity { .. }
        )
    }
}
