//! Error types for SIMS

/// Result type alias using SIMS's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for SIMS operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Model construction, training and inference errors
    #[error("model error: {0}")]
    Model(String),

    /// Model archive is unreadable or incomplete
    #[error("archive error: {0}")]
    Archive(String),

    /// Input matrix, label or gene alignment errors
    #[error("data error: {0}")]
    Data(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Errors raised by the tensor backend (shape, dtype, device mismatches)
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Filesystem errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new archive error
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a new data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the error reports a missing or corrupt archive member
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive(_))
    }
}
