//! Idempotency error types.

use thiserror::Error;

/// Idempotency error type.
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] broker_database::DatabaseError),

    /// Client supplied a malformed idempotency key
    #[error("Invalid idempotency key: expected source:flow:externalId, got {0:?}")]
    InvalidProvidedKey(String),
}

/// Result type alias using IdempotencyError.
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;
