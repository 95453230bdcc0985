//! Error types for sehat-core

use thiserror::Error;

/// Result type alias using sehat-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sehat-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input to the record store; rejected immediately, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Local durability failure; fatal to the calling operation
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport construction/configuration error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation not valid for the record's current sync state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}
