//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Idempotency record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::InProgress,
        }
    }
}

/// Why a duplicate delivery was last skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkippedReason {
    Duplicate,
    Locked,
    Expired,
}

impl SkippedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Locked => "locked",
            Self::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "duplicate" => Some(Self::Duplicate),
            "locked" => Some(Self::Locked),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Idempotency record. Transitions are owned by the gate; rows are never
/// deleted so completed results stay available for late duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idem_key: String,
    pub strategy: String,
    pub status: IdempotencyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lock_until: Option<DateTime<Utc>>,
    /// Present iff status is `completed`.
    pub result_json: Option<String>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub skipped_reason: Option<SkippedReason>,
}

/// Inbound DLQ record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    /// Awaiting replay (or further replay attempts).
    Pending,
    /// Successfully replayed. Terminal.
    Replayed,
    /// Replay attempt limit exhausted. Terminal.
    Dead,
}

impl DlqStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Replayed => "replayed",
            Self::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "replayed" => Self::Replayed,
            "dead" => Self::Dead,
            _ => Self::Pending,
        }
    }
}

/// Inbound DLQ record, without the stored envelope blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub id: i64,
    pub status: DlqStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub kind: String,
    pub message_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub branch_id: Option<String>,
    pub user_id: Option<String>,
    pub idem_key: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub replayed_at: Option<DateTime<Utc>>,
}

/// Full DLQ row including the serialized envelope, for replay.
#[derive(Debug, Clone)]
pub struct DlqFullRecord {
    pub record: DlqRecord,
    pub headers_json: Option<String>,
    pub payload_json: Option<String>,
    pub source_meta_json: Option<String>,
    pub replay_result_json: Option<String>,
}

/// New DLQ row for insertion.
#[derive(Debug, Clone)]
pub struct NewDlqRecord {
    pub kind: String,
    pub message_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub branch_id: Option<String>,
    pub user_id: Option<String>,
    pub headers_json: Option<String>,
    pub payload_json: Option<String>,
    pub source_meta_json: Option<String>,
    pub idem_key: Option<String>,
    pub max_attempts: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Outbox record status, shared by both outbox variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sending,
    Sent,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "dead" => Self::Dead,
            _ => Self::Pending,
        }
    }
}

/// Messaging outbox record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingOutboxRecord {
    pub id: i64,
    pub status: OutboxStatus,
    pub provider: String,
    pub destination: String,
    pub message_key: Option<String>,
    pub headers_json: Option<String>,
    pub payload_json: Option<String>,
    pub source_message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub idem_key: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// New messaging outbox row for insertion.
#[derive(Debug, Clone)]
pub struct NewMessagingOutboxRecord {
    pub provider: String,
    pub destination: String,
    pub message_key: Option<String>,
    pub headers_json: Option<String>,
    pub payload_json: Option<String>,
    pub source_message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub idem_key: Option<String>,
    pub max_attempts: i64,
}

/// Messaging outbox list item (no payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingOutboxListItem {
    pub id: i64,
    pub status: OutboxStatus,
    pub provider: String,
    pub destination: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// HTTP outbox record.
///
/// `idempotency_key` is the value propagated to the downstream system as a
/// header; `idem_key` links back to the inbound admission record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpOutboxRecord {
    pub id: i64,
    pub status: OutboxStatus,
    pub http_method: String,
    pub url: String,
    pub connector_id: Option<String>,
    pub path: Option<String>,
    pub headers_json: Option<String>,
    pub body_json: Option<String>,
    pub idempotency_key: Option<String>,
    pub source_message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub idem_key: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub treat_4xx_as_success: Option<String>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub last_http_status: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// New HTTP outbox row for insertion.
#[derive(Debug, Clone)]
pub struct NewHttpOutboxRecord {
    pub http_method: String,
    pub url: String,
    pub connector_id: Option<String>,
    pub path: Option<String>,
    pub headers_json: Option<String>,
    pub body_json: Option<String>,
    pub idempotency_key: Option<String>,
    pub source_message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub idem_key: Option<String>,
    pub max_attempts: i64,
    pub treat_4xx_as_success: Option<String>,
}

/// HTTP outbox list item (no body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpOutboxListItem {
    pub id: i64,
    pub status: OutboxStatus,
    pub http_method: String,
    pub url: String,
    pub connector_id: Option<String>,
    pub path: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
