//! Error type of the joint model.

/// Result type alias using [`JvaeError`].
pub type Result<T> = std::result::Result<T, JvaeError>;

#[derive(Debug, thiserror::Error)]
pub enum JvaeError {
    /// Invalid model configuration or usage (e.g. a missing dataset mode
    /// while several datasets are registered).
    #[error("configuration: {0}")]
    Config(String),

    /// Tensor computation error, including shape mismatches.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),
}

impl JvaeError {
    pub fn config(msg: impl Into<String>) -> Self {
        JvaeError::Config(msg.into())
    }
}
