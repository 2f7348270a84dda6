//! Error types for cluster module

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Server at capacity: {0}")]
    AtCapacity(String),

    #[error("Too many connections for user: {0}")]
    TooManyConnections(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis error: {0}")]
    Redis(String),
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
