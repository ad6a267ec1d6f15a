//! Processing error types.

use thiserror::Error;

/// Processing error type.
///
/// `StoredInDlq` is the one the ingress layer cares about: the message could
/// not be processed but is safely parked for replay, and the response should
/// carry the DLQ id. Everything in here is already sanitized.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// No flow matches the envelope: a client error, not a DLQ case.
    #[error("No flow configured for kind={kind}, type={message_type}")]
    FlowNotFound { kind: String, message_type: String },

    /// Client supplied a malformed idempotency key.
    #[error("Invalid idempotency key: expected source:flow:externalId, got {0:?}")]
    InvalidIdempotencyKey(String),

    /// Flow execution failed and the message was stored in the DLQ.
    #[error("Message stored in DLQ (id {dlq_id}): {safe_message}")]
    StoredInDlq {
        dlq_id: i64,
        idempotency_key: Option<String>,
        error_code: String,
        safe_message: String,
    },

    /// Flow execution failed and no DLQ entry was created (DLQ disabled, a
    /// replay run, or the DLQ write itself failed).
    #[error("Flow execution failed: {safe_message}")]
    FlowFailed {
        error_code: String,
        safe_message: String,
    },

    /// Database error on a read path
    #[error("Database error: {0}")]
    Database(#[from] broker_database::DatabaseError),
}

/// Result type alias using ProcessingError.
pub type ProcessingResult<T> = Result<T, ProcessingError>;
