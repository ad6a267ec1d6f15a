//! Dead-letter persistence over the inbound_dlq table.

use crate::DlqResult;
use broker_core::{sanitize_headers, sanitize_text, InboundEnvelope};
use broker_database::{queries, AsyncDatabase, DlqRecord, DlqStatus, NewDlqRecord};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Full DLQ entry with the stored envelope parts parsed back out.
#[derive(Debug, Clone)]
pub struct DlqFull {
    pub record: DlqRecord,
    pub headers: HashMap<String, String>,
    pub payload: Value,
    pub source_meta: serde_json::Map<String, Value>,
    pub replay_result_json: Option<String>,
}

/// Listing filter. `source` is matched against the stored source meta
/// (`source`, then `sourceSystem`, then `system`) client-side, since it is
/// not an indexed column.
#[derive(Debug, Clone, Default)]
pub struct DlqListFilter {
    pub status: Option<DlqStatus>,
    pub message_type: Option<String>,
    pub source: Option<String>,
    pub branch_id: Option<String>,
}

/// Inbound dead-letter store.
#[derive(Clone)]
pub struct InboundDlqStore {
    db: AsyncDatabase,
}

impl InboundDlqStore {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    /// Persist a failed inbound message.
    ///
    /// Never fails outward: a store problem is logged and reported as None,
    /// because a DLQ write failure must not mask the original processing
    /// error. Returns the new record id otherwise.
    pub async fn put(
        &self,
        envelope: &InboundEnvelope,
        idem_key: Option<&str>,
        error_code: &str,
        error_message: &str,
        max_attempts: i64,
        sanitize: bool,
    ) -> Option<i64> {
        let headers = if sanitize {
            sanitize_headers(&envelope.headers)
        } else {
            envelope.headers.clone()
        };

        let record = NewDlqRecord {
            kind: envelope.kind.as_str().to_string(),
            message_type: Some(envelope.message_type.clone()),
            message_id: envelope.message_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            branch_id: envelope.branch_id.clone(),
            user_id: envelope.user_id.clone(),
            headers_json: to_json_safe(&headers),
            payload_json: to_json_safe(&envelope.payload),
            source_meta_json: to_json_safe(&envelope.source_meta),
            idem_key: idem_key.map(str::to_string),
            max_attempts: max_attempts.clamp(1, 100),
            error_code: Some(safe_short(&sanitize_text(error_code), 64)),
            error_message: Some(safe_short(&sanitize_text(error_message), 800)),
        };

        match self.db.call(move |conn| queries::insert_dlq(conn, &record)).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Failed to persist dead letter");
                None
            }
        }
    }

    /// Get a record without the stored envelope.
    pub async fn get(&self, id: i64) -> DlqResult<Option<DlqRecord>> {
        Ok(self.db.call(move |conn| queries::get_dlq(conn, id)).await?)
    }

    /// Get a record with the envelope parts needed for replay.
    pub async fn get_full(&self, id: i64) -> DlqResult<Option<DlqFull>> {
        let full = self.db.call(move |conn| queries::get_dlq_full(conn, id)).await?;
        Ok(full.map(|full| DlqFull {
            headers: parse_json_or_default(full.headers_json.as_deref()),
            payload: full
                .payload_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null),
            source_meta: parse_json_or_default(full.source_meta_json.as_deref()),
            replay_result_json: full.replay_result_json,
            record: full.record,
        }))
    }

    /// Diagnostic listing, newest first.
    pub async fn list(&self, filter: DlqListFilter, limit: i64) -> DlqResult<Vec<DlqRecord>> {
        let limit = limit.clamp(1, 200);
        let DlqListFilter {
            status,
            message_type,
            source,
            branch_id,
        } = filter;

        let rows = self
            .db
            .call(move |conn| {
                queries::list_dlq(conn, status, message_type.as_deref(), branch_id.as_deref(), limit)
            })
            .await?;

        let records = rows
            .into_iter()
            .filter(|(_, source_meta_json)| match &source {
                None => true,
                Some(wanted) => {
                    extract_source(source_meta_json.as_deref()).as_deref() == Some(wanted.as_str())
                }
            })
            .map(|(record, _)| record)
            .collect();
        Ok(records)
    }

    /// Terminal success transition after a replay.
    pub async fn mark_replayed(&self, id: i64, replay_result_json: &str) {
        let result = safe_short(replay_result_json, 50_000);
        if let Err(e) = self
            .db
            .call(move |conn| queries::mark_dlq_replayed(conn, id, &result))
            .await
        {
            warn!(dlq_id = id, error = %e, "Failed to mark dead letter replayed");
        }
    }

    /// Record a failed replay attempt: attempts += 1, DEAD at the limit,
    /// otherwise the record stays PENDING for a future replay.
    pub async fn mark_replay_failed(&self, id: i64, error_code: &str, error_message: &str) {
        let record = match self.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(dlq_id = id, error = %e, "Failed to read dead letter for replay bookkeeping");
                return;
            }
        };

        let attempts = record.attempts + 1;
        let dead = attempts >= record.max_attempts;
        let code = safe_short(&sanitize_text(error_code), 64);
        let message = safe_short(&sanitize_text(error_message), 800);

        if let Err(e) = self
            .db
            .call(move |conn| {
                queries::mark_dlq_replay_failed(conn, id, attempts, dead, &code, &message)
            })
            .await
        {
            warn!(dlq_id = id, error = %e, "Failed to record replay failure");
        }
    }

    /// Count records in one status.
    pub async fn count_by_status(&self, status: DlqStatus) -> DlqResult<i64> {
        Ok(self
            .db
            .call(move |conn| queries::count_dlq_by_status(conn, status))
            .await?)
    }
}

fn extract_source(source_meta_json: Option<&str>) -> Option<String> {
    let meta: serde_json::Map<String, Value> = parse_json_or_default(source_meta_json);
    ["source", "sourceSystem", "system"]
        .iter()
        .find_map(|key| meta.get(*key))
        .map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        })
}

fn to_json_safe<T: serde::Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}

fn parse_json_or_default<T: Default + serde::de::DeserializeOwned>(raw: Option<&str>) -> T {
    raw.and_then(|raw| serde_json::from_str(raw).ok()).unwrap_or_default()
}

fn safe_short(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}
