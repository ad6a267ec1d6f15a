//! Durable messaging outbox.

use crate::{MessagingProviderRegistry, OutboundMessage, OutboxResult, SendResult};
use broker_config::{DryRunState, MessagingOutboxConfig, OutboxMode};
use broker_core::{sanitize_headers, sanitize_text};
use broker_database::{
    queries, AsyncDatabase, MessagingOutboxListItem, MessagingOutboxRecord,
    NewMessagingOutboxRecord, OutboxStatus,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// One publish intent.
#[derive(Debug, Clone)]
pub struct MessagingPublish {
    pub provider_id: String,
    pub destination: String,
    pub message_key: Option<String>,
    pub headers: HashMap<String, String>,
    pub payload: Value,
    pub source_message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub idem_key: Option<String>,
}

/// Durable queue of "publish to message bus" intents.
#[derive(Clone)]
pub struct MessagingOutbox {
    db: AsyncDatabase,
    providers: Arc<MessagingProviderRegistry>,
    dry_run: Arc<DryRunState>,
}

impl MessagingOutbox {
    pub fn new(
        db: AsyncDatabase,
        providers: Arc<MessagingProviderRegistry>,
        dry_run: Arc<DryRunState>,
    ) -> Self {
        Self {
            db,
            providers,
            dry_run,
        }
    }

    /// Publish a message according to outbox policy.
    ///
    /// Returns the outbox row id, or 0 when the message was delivered
    /// directly (or suppressed by dry-run).
    pub async fn publish(&self, cfg: &MessagingOutboxConfig, publish: MessagingPublish) -> i64 {
        if self.dry_run.is_dry_run() {
            // In dry-run nothing is sent. ALWAYS mode still records the
            // intent durably; the dispatcher stays suppressed until dry-run
            // is lifted.
            if !cfg.enabled || cfg.mode == OutboxMode::OnFailure {
                return 0;
            }
            return self.enqueue(&publish, cfg.max_attempts).await;
        }

        if !cfg.enabled {
            // Queue disabled: direct send with the outbox as best-effort
            // fallback.
            let result = self.send_direct(&publish).await;
            if result.success {
                return 0;
            }
            return self.enqueue(&publish, cfg.max_attempts).await;
        }

        match cfg.mode {
            OutboxMode::Always => self.enqueue(&publish, cfg.max_attempts).await,
            OutboxMode::OnFailure => {
                let result = self.send_direct(&publish).await;
                if result.success {
                    0
                } else {
                    self.enqueue(&publish, cfg.max_attempts).await
                }
            }
        }
    }

    async fn send_direct(&self, publish: &MessagingPublish) -> SendResult {
        let provider = self.providers.get(&publish.provider_id);
        let message = OutboundMessage {
            destination: publish.destination.clone(),
            message_key: publish.message_key.clone(),
            headers: sanitize_headers(&publish.headers),
            payload_json: publish.payload.to_string(),
            correlation_id: publish.correlation_id.clone(),
            source_message_id: publish.source_message_id.clone(),
            idempotency_key: publish.idem_key.clone(),
        };
        provider.send(&message).await
    }

    /// Insert a pending outbox row due immediately.
    ///
    /// Best-effort: a store failure is logged and reported as 0. The outbox
    /// must not break the primary processing path.
    pub async fn enqueue(&self, publish: &MessagingPublish, max_attempts: i64) -> i64 {
        let record = NewMessagingOutboxRecord {
            provider: safe_short_or(&publish.provider_id, 64, "logging"),
            destination: safe_short_or(&publish.destination, 2000, "unknown"),
            message_key: opt_short(publish.message_key.as_deref(), 2000),
            headers_json: serde_json::to_string(&sanitize_headers(&publish.headers)).ok(),
            payload_json: Some(publish.payload.to_string()),
            source_message_id: opt_short(publish.source_message_id.as_deref(), 128),
            correlation_id: opt_short(publish.correlation_id.as_deref(), 128),
            idem_key: opt_short(publish.idem_key.as_deref(), 128),
            max_attempts: max_attempts.max(1),
        };

        match self
            .db
            .call(move |conn| queries::insert_messaging_outbox(conn, &record))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Failed to enqueue messaging outbox record");
                0
            }
        }
    }

    pub async fn get(&self, id: i64) -> OutboxResult<Option<MessagingOutboxRecord>> {
        Ok(self
            .db
            .call(move |conn| queries::get_messaging_outbox(conn, id))
            .await?)
    }

    /// List records (no payload), newest first.
    pub async fn list(
        &self,
        status: Option<OutboxStatus>,
        limit: i64,
    ) -> OutboxResult<Vec<MessagingOutboxListItem>> {
        let limit = limit.clamp(1, 200);
        Ok(self
            .db
            .call(move |conn| queries::list_messaging_outbox(conn, status, limit))
            .await?)
    }

    /// Due pending records, oldest id first.
    pub async fn pick_due(&self, limit: i64) -> OutboxResult<Vec<MessagingOutboxRecord>> {
        let limit = limit.clamp(1, 200);
        Ok(self
            .db
            .call(move |conn| queries::pick_due_messaging(conn, limit))
            .await?)
    }

    /// Claim a record for delivery; false means another worker won.
    pub async fn mark_sending(&self, id: i64) -> OutboxResult<bool> {
        Ok(self
            .db
            .call(move |conn| queries::mark_messaging_sending(conn, id))
            .await?)
    }

    pub async fn mark_sent(&self, id: i64) -> OutboxResult<()> {
        Ok(self
            .db
            .call(move |conn| queries::mark_messaging_sent(conn, id))
            .await?)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mark_failed(
        &self,
        id: i64,
        attempts: i64,
        max_attempts: i64,
        next_attempt_at: DateTime<Utc>,
        error_code: &str,
        error_message: &str,
        dead: bool,
    ) -> OutboxResult<()> {
        let code = safe_short_or(&sanitize_text(error_code), 64, "SEND_ERROR");
        let sanitized_message = sanitize_text(error_message);
        let message = opt_short(Some(sanitized_message.as_str()), 1000).unwrap_or_default();
        Ok(self
            .db
            .call(move |conn| {
                queries::mark_messaging_failed(
                    conn,
                    id,
                    attempts,
                    max_attempts,
                    next_attempt_at,
                    &code,
                    &message,
                    dead,
                )
            })
            .await?)
    }

    /// Operator re-arm, usable even on dead records.
    pub async fn replay(&self, id: i64, reset_attempts: bool) -> OutboxResult<bool> {
        Ok(self
            .db
            .call(move |conn| queries::replay_messaging_outbox(conn, id, reset_attempts))
            .await?)
    }

    pub async fn count_by_status(&self, status: OutboxStatus) -> OutboxResult<i64> {
        Ok(self
            .db
            .call(move |conn| queries::count_messaging_by_status(conn, status))
            .await?)
    }

    /// Parse a stored headers_json column.
    pub fn parse_headers(headers_json: Option<&str>) -> HashMap<String, String> {
        headers_json
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

fn safe_short_or(s: &str, max_chars: usize, default: &str) -> String {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return default.to_string();
    }
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

fn opt_short(s: Option<&str>, max_chars: usize) -> Option<String> {
    let trimmed = s.map(str::trim).filter(|s| !s.is_empty())?;
    Some(match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    })
}
