//! Error types for variational factorization machines.

use thiserror::Error;

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, VfmError>;

/// Errors surfaced by model construction, training and scoring.
///
/// None of these are recovered from internally; a prediction is never
/// replaced by a default value.
#[derive(Debug, Error)]
pub enum VfmError {
    /// Feature index beyond the schema, or incompatible tensor shapes
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// NaN/Inf in a loss, gradient or parameter
    #[error("Numerical instability at epoch {epoch}, step {step}: non-finite {what}")]
    NumericalInstability {
        epoch: usize,
        step: usize,
        what: String,
    },

    /// Invalid configuration, rejected before any training
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The batch source ran out before the expected epoch boundary
    #[error("Data exhausted at epoch {epoch}, batch {batch}: {reason}")]
    DataExhaustion {
        epoch: usize,
        batch: usize,
        reason: String,
    },

    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl VfmError {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
