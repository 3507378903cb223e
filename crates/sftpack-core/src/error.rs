//! Error types for sftpack.

use thiserror::Error;

/// Result type alias for sftpack operations.
pub type Result<T> = std::result::Result<T, SftPackError>;

/// Main error type for sftpack operations.
///
/// The variants follow the failure classes of the training core:
/// configuration problems are fatal before the first step, packing
/// problems are fatal for a single example, numeric problems are
/// recovered by skipping a step, and resource problems are surfaced to
/// the driver once retries are exhausted.
#[derive(Error, Debug)]
pub enum SftPackError {
    /// Invalid hyperparameters or schedule (fatal, raised before any step runs).
    #[error("Configuration error: {0}")]
    Config(String),

    /// An example could not be packed.
    #[error("Packing error: {0}")]
    Packing(String),

    /// Non-finite values in gradients or losses.
    #[error("Numeric error: {0}")]
    Numeric(String),

    /// Checkpoint or dataset I/O failed after all retries.
    #[error("Resource error during {operation} after {attempts} attempt(s): {message}")]
    Resource {
        /// What was being attempted (e.g. "checkpoint write").
        operation: String,
        /// Number of attempts made.
        attempts: usize,
        /// Last underlying failure.
        message: String,
    },

    /// Shape mismatch between parameters, gradients or state buffers.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Errors reported by the external model collaborator.
    #[error("Model error: {0}")]
    Model(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The run was stopped by an external signal.
    #[error("Training cancelled at step {step}")]
    Cancelled {
        /// Last committed optimizer step.
        step: usize,
    },
}

impl SftPackError {
    /// Whether the failure may succeed on a later attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Resource { .. })
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<serde_json::Error> for SftPackError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
