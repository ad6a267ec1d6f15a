//! Outbox dispatcher: the polling loop behind both queues.
//!
//! Each pass picks due PENDING records, claims them with the atomic
//! `pending -> sending` update, attempts delivery, and applies the
//! backoff / dead-letter policy on failure. A lost claim is not an error:
//! another dispatcher instance simply won the record.

use crate::{
    HttpOutbox, MessagingOutbox, MessagingProviderRegistry, OutboundMessage,
};
use broker_config::{DryRunState, RuntimeConfigStore};
use broker_database::{HttpOutboxRecord, MessagingOutboxRecord};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Exponential backoff delay: `base * 2^(attempts - 1)` seconds, capped.
pub fn compute_next_attempt(base_delay_sec: i64, max_delay_sec: i64, attempts: i64) -> Duration {
    let base = base_delay_sec.max(1);
    let max = max_delay_sec.max(base);

    // The shift is clamped so huge attempt counts cannot overflow.
    let shift = (attempts - 1).clamp(0, 20) as u32;
    let delay = (base << shift).min(max);
    Duration::seconds(delay)
}

/// Background dispatcher over both outbox queues.
pub struct OutboxDispatcher {
    config_store: Arc<RuntimeConfigStore>,
    messaging: MessagingOutbox,
    http: HttpOutbox,
    providers: Arc<MessagingProviderRegistry>,
    dry_run: Arc<DryRunState>,
}

impl OutboxDispatcher {
    pub fn new(
        config_store: Arc<RuntimeConfigStore>,
        messaging: MessagingOutbox,
        http: HttpOutbox,
        providers: Arc<MessagingProviderRegistry>,
        dry_run: Arc<DryRunState>,
    ) -> Self {
        Self {
            config_store,
            messaging,
            http,
            providers,
            dry_run,
        }
    }

    /// Spawn the fixed-interval polling task. The interval and the enabled
    /// flag are re-read from config every pass, so a config reload takes
    /// effect without a restart.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let cfg = self.config_store.effective();
                if cfg.dispatcher.enabled {
                    self.dispatch_messaging_once().await;
                    self.dispatch_http_once().await;
                }
                tokio::time::sleep(std::time::Duration::from_millis(
                    cfg.dispatcher.interval_ms.max(100),
                ))
                .await;
            }
        })
    }

    /// One messaging dispatch pass. Returns the number of claimed records.
    pub async fn dispatch_messaging_once(&self) -> usize {
        if self.dry_run.is_dry_run() {
            return 0;
        }
        let cfg = self.config_store.effective();
        let queue_cfg = &cfg.messaging_outbox;
        if !queue_cfg.enabled {
            return 0;
        }

        let due = match self.messaging.pick_due(queue_cfg.batch_size.max(1)).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Messaging dispatch: pick_due failed");
                return 0;
            }
        };

        let mut claimed = 0;
        for record in due {
            match self.messaging.mark_sending(record.id).await {
                Ok(true) => {}
                // Another worker claimed it between pick and claim; no error,
                // no retry bookkeeping.
                Ok(false) => continue,
                Err(e) => {
                    warn!(outbox_id = record.id, error = %e, "Messaging dispatch: claim failed");
                    continue;
                }
            }
            claimed += 1;

            let provider = self.providers.get(&record.provider);
            let message = OutboundMessage {
                destination: record.destination.clone(),
                message_key: record.message_key.clone(),
                headers: MessagingOutbox::parse_headers(record.headers_json.as_deref()),
                payload_json: record.payload_json.clone().unwrap_or_else(|| "null".to_string()),
                correlation_id: record.correlation_id.clone(),
                source_message_id: record.source_message_id.clone(),
                idempotency_key: record.idem_key.clone(),
            };

            let result = provider.send(&message).await;
            if result.success {
                debug!(outbox_id = record.id, destination = %record.destination, "Messaging record delivered");
                if let Err(e) = self.messaging.mark_sent(record.id).await {
                    warn!(outbox_id = record.id, error = %e, "Failed to mark messaging record sent");
                }
                continue;
            }

            self.on_messaging_failure(
                &record,
                queue_cfg.max_attempts,
                queue_cfg.base_delay_sec,
                queue_cfg.max_delay_sec,
                result.error_code.as_deref().unwrap_or("SEND_ERROR"),
                result.error_message.as_deref().unwrap_or(""),
            )
            .await;
        }
        claimed
    }

    async fn on_messaging_failure(
        &self,
        record: &MessagingOutboxRecord,
        max_attempts: i64,
        base_delay_sec: i64,
        max_delay_sec: i64,
        error_code: &str,
        error_message: &str,
    ) {
        let attempts = record.attempts + 1;
        let max_attempts = max_attempts.max(1);
        let dead = attempts >= max_attempts;
        let next_attempt_at =
            Utc::now() + compute_next_attempt(base_delay_sec, max_delay_sec, attempts);

        if let Err(e) = self
            .messaging
            .mark_failed(
                record.id,
                attempts,
                max_attempts,
                next_attempt_at,
                error_code,
                error_message,
                dead,
            )
            .await
        {
            warn!(outbox_id = record.id, error = %e, "Failed to record messaging delivery failure");
            return;
        }

        if dead {
            warn!(
                outbox_id = record.id,
                provider = %record.provider,
                destination = %record.destination,
                attempts,
                max_attempts,
                error_code,
                "Messaging record moved to dead"
            );
        }
    }

    /// One HTTP dispatch pass. Returns the number of claimed records.
    pub async fn dispatch_http_once(&self) -> usize {
        if self.dry_run.is_dry_run() {
            return 0;
        }
        let cfg = self.config_store.effective();
        let queue_cfg = &cfg.http_outbox;
        if !queue_cfg.base.enabled {
            return 0;
        }

        let due = match self.http.pick_due(queue_cfg.base.batch_size.max(1)).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "HTTP dispatch: pick_due failed");
                return 0;
            }
        };

        let mut claimed = 0;
        for record in due {
            match self.http.mark_sending(record.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(outbox_id = record.id, error = %e, "HTTP dispatch: claim failed");
                    continue;
                }
            }
            claimed += 1;

            let outcome = self
                .http
                .send_once(&record, &queue_cfg.idempotency_header_name, &cfg)
                .await;

            if outcome.success {
                debug!(outbox_id = record.id, http_status = outcome.http_status, "HTTP record delivered");
                if let Err(e) = self.http.mark_sent(record.id, outcome.http_status).await {
                    warn!(outbox_id = record.id, error = %e, "Failed to mark HTTP record sent");
                }
                continue;
            }

            self.on_http_failure(
                &record,
                queue_cfg.base.max_attempts,
                queue_cfg.base.base_delay_sec,
                queue_cfg.base.max_delay_sec,
                outcome.error_code.as_deref().unwrap_or("HTTP_ERROR"),
                outcome.error_message.as_deref().unwrap_or(""),
                outcome.http_status,
            )
            .await;
        }
        claimed
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_http_failure(
        &self,
        record: &HttpOutboxRecord,
        max_attempts: i64,
        base_delay_sec: i64,
        max_delay_sec: i64,
        error_code: &str,
        error_message: &str,
        http_status: i64,
    ) {
        let attempts = record.attempts + 1;
        let max_attempts = max_attempts.max(1);
        let dead = attempts >= max_attempts;
        let next_attempt_at =
            Utc::now() + compute_next_attempt(base_delay_sec, max_delay_sec, attempts);
        let http_status = (http_status >= 0).then_some(http_status);

        if let Err(e) = self
            .http
            .mark_failed(
                record.id,
                attempts,
                max_attempts,
                next_attempt_at,
                error_code,
                error_message,
                http_status,
                dead,
            )
            .await
        {
            warn!(outbox_id = record.id, error = %e, "Failed to record HTTP delivery failure");
            return;
        }

        if dead {
            warn!(
                outbox_id = record.id,
                method = %record.http_method,
                url = %record.url,
                attempts,
                max_attempts,
                ?http_status,
                error_code,
                "HTTP record moved to dead"
            );
        }
    }
}
