//! Error types for the live query engine.

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid query options: {0}")]
    InvalidOptions(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Change feed closed for collection: {0}")]
    FeedClosed(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Document already exists: {0}")]
    DocumentExists(String),

    #[error("Registry has been shut down")]
    ShutDown,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LiveError {
    fn from(e: serde_json::Error) -> Self {
        LiveError::Serialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, LiveError>;
