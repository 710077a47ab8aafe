//! Error types for KAIKU

use thiserror::Error;

/// Result type alias for KAIKU operations
pub type Result<T> = std::result::Result<T, KaikuError>;

/// Main error type for KAIKU
#[derive(Error, Debug)]
pub enum KaikuError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Shared store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Event bus error
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Ingestion source error
    #[error("source error: {0}")]
    Source(String),

    /// One or more items in a poll batch failed
    #[error("batch had {failed} failed mention(s) out of {total}")]
    BatchFailed { failed: usize, total: usize },

    /// Classification error
    #[error("classifier error: {0}")]
    Classifier(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for shared-store operations
///
/// Backends differ (Redis in production, in-memory in tests), so errors are
/// carried as strings rather than backend-specific types.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend unavailable or command failed
    #[error("store backend error: {0}")]
    Backend(String),

    /// Stored value could not be decoded
    #[error("store decode error: {0}")]
    Decode(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Error type for event bus operations
#[derive(Error, Debug)]
pub enum BusError {
    /// Backend unavailable or command failed
    #[error("bus backend error: {0}")]
    Backend(String),

    /// Envelope could not be encoded/decoded
    #[error("envelope codec error: {0}")]
    Codec(String),
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Codec(err.to_string())
    }
}

/// Error returned by event and action handlers
///
/// Handlers are trait objects provided by callers; their failures are
/// opaque strings that end up in dead-letter tags and failure events.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<KaikuError> for HandlerError {
    fn from(err: KaikuError) -> Self {
        HandlerError(err.to_string())
    }
}
