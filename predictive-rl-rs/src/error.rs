//! Error types for the predictive RL agent.

use thiserror::Error;

/// Result type for predictive RL operations.
pub type PredictiveResult<T> = Result<T, PredictiveError>;

/// Errors that can occur while building or training the agent.
///
/// Near-zero probabilities inside log terms never surface here: they are
/// absorbed by the configured `epsilon` floor. A user-requested stop is not an
/// error either, see [`crate::trainer::StopReason`].
#[derive(Debug, Error)]
pub enum PredictiveError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid or unsupported configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Parameter or input dimensions disagree with the configured widths
    #[error("Shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Parameter or input the mismatch was found in
        context: String,
        /// Expected shape or width
        expected: String,
        /// Actual shape or width
        got: String,
    },

    /// Environment collaborator failed during a rollout
    #[error("Environment error: {0}")]
    Environment(String),

    /// Training step failed
    #[error("Training error: {0}")]
    Training(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Config file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl PredictiveError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an environment error
    pub fn environment(msg: impl Into<String>) -> Self {
        Self::Environment(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}
