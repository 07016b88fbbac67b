//! Error types for the fairrec-ml crate.

use fairrec_core::CoreError;
use thiserror::Error;

/// Top-level error type for training and evaluation.
///
/// Algorithmic failures (divergence, state that cannot be bound, shape
/// mismatches) surface here and end the run. Policy-level irregularities such
/// as unknown optimizer names or a checkpoint written for another model are
/// logged and bypassed instead.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("training loss is not a number (epoch {epoch}, batch {batch})")]
    Divergence { epoch: usize, batch: usize },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl MlError {
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether this error is the fatal NaN-loss condition.
    pub fn is_divergence(&self) -> bool {
        matches!(self, Self::Divergence { .. })
    }
}
