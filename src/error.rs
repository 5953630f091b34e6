//! Error types for the Bulwark service.

use thiserror::Error;

/// Main error type for Bulwark operations.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient failure of an underlying store; safe to retry
    #[error("Store error: {0}")]
    Store(String),

    /// The store is failing and the deployment is configured to fail closed
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The requested entity does not exist (e.g. no active ban to release)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BulwarkError {
    /// Whether the operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, BulwarkError::Store(_) | BulwarkError::Unavailable(_))
    }
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;
