//! DLQ error types.

use thiserror::Error;

/// DLQ error type.
#[derive(Error, Debug)]
pub enum DlqError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] broker_database::DatabaseError),
}

/// Result type alias using DlqError.
pub type DlqResult<T> = Result<T, DlqError>;
