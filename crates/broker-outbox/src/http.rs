//! Durable HTTP outbox.

use crate::sender::{build_url, ConnectorAuthResolver, HttpSendOutcome, HttpSender};
use crate::OutboxResult;
use broker_config::{DryRunState, HttpOutboxConfig, OutboxMode, RuntimeConfig};
use broker_core::{sanitize_headers, sanitize_text};
use broker_database::{
    queries, AsyncDatabase, HttpOutboxListItem, HttpOutboxRecord, NewHttpOutboxRecord,
    OutboxStatus,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// One outbound HTTP intent.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    /// Idempotency key propagated to the downstream system as a header.
    pub idempotency_key: Option<String>,
    pub source_message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Inbound admission key, kept for correlation with the gate.
    pub idem_key: Option<String>,
}

/// Durable queue of "call external HTTP endpoint" intents.
#[derive(Clone)]
pub struct HttpOutbox {
    db: AsyncDatabase,
    sender: Arc<dyn HttpSender>,
    auth: Arc<ConnectorAuthResolver>,
    dry_run: Arc<DryRunState>,
}

impl HttpOutbox {
    pub fn new(
        db: AsyncDatabase,
        sender: Arc<dyn HttpSender>,
        auth: Arc<ConnectorAuthResolver>,
        dry_run: Arc<DryRunState>,
    ) -> Self {
        Self {
            db,
            sender,
            auth,
            dry_run,
        }
    }

    /// Execute an HTTP call against an absolute URL according to outbox
    /// policy. Returns the outbox row id, or 0 when the call was delivered
    /// directly (or suppressed by dry-run).
    ///
    /// Direct sends use the sanitized header set; auth belongs in a
    /// connector, not in caller headers.
    pub async fn call(&self, cfg: &HttpOutboxConfig, url: &str, call: HttpCall) -> i64 {
        self.call_inner(cfg, url, None, None, HashMap::new(), call).await
    }

    /// Execute an HTTP call through a configured connector.
    ///
    /// The connector supplies the base URL and auth headers; the outbox row
    /// stores only the connector id and relative path, so auth is resolved
    /// again from live config on every dispatch retry.
    pub async fn call_via_connector(
        &self,
        effective: &RuntimeConfig,
        cfg: &HttpOutboxConfig,
        connector_id: &str,
        path: &str,
        call: HttpCall,
    ) -> i64 {
        let connector = effective.connector(connector_id);
        let url = build_url(connector.map(|c| c.base_url.as_str()), Some(path));
        let auth_headers = match connector {
            Some(connector) => self.auth.resolve_headers(&connector.auth).await,
            None => HashMap::new(),
        };

        self.call_inner(
            cfg,
            &url,
            Some(connector_id),
            Some(path),
            auth_headers,
            call,
        )
        .await
    }

    async fn call_inner(
        &self,
        cfg: &HttpOutboxConfig,
        url: &str,
        connector_id: Option<&str>,
        path: Option<&str>,
        auth_headers: HashMap<String, String>,
        call: HttpCall,
    ) -> i64 {
        if self.dry_run.is_dry_run() {
            // Nothing is sent in dry-run; ALWAYS mode still records the
            // intent durably for dispatch after dry-run is lifted.
            if !cfg.base.enabled || cfg.base.mode == OutboxMode::OnFailure {
                return 0;
            }
            return self.enqueue(cfg, url, connector_id, path, &call).await;
        }

        if !cfg.base.enabled {
            let outcome = self.send_direct(cfg, url, &auth_headers, &call).await;
            if outcome.success
                || treat_4xx_as_success(Some(cfg.treat_4xx_as_success.as_str()), outcome.http_status)
            {
                return 0;
            }
            return self.enqueue(cfg, url, connector_id, path, &call).await;
        }

        match cfg.base.mode {
            OutboxMode::Always => self.enqueue(cfg, url, connector_id, path, &call).await,
            OutboxMode::OnFailure => {
                let outcome = self.send_direct(cfg, url, &auth_headers, &call).await;
                if outcome.success
                    || treat_4xx_as_success(
                        Some(cfg.treat_4xx_as_success.as_str()),
                        outcome.http_status,
                    )
                {
                    0
                } else {
                    self.enqueue(cfg, url, connector_id, path, &call).await
                }
            }
        }
    }

    async fn send_direct(
        &self,
        cfg: &HttpOutboxConfig,
        url: &str,
        auth_headers: &HashMap<String, String>,
        call: &HttpCall,
    ) -> HttpSendOutcome {
        let mut headers = sanitize_headers(&call.headers);
        headers.extend(auth_headers.clone());

        let body_json = call.body.as_ref().map(Value::to_string);
        self.sender
            .send(
                &call.method,
                url,
                &headers,
                body_json.as_deref(),
                &cfg.idempotency_header_name,
                call.idempotency_key.as_deref(),
            )
            .await
    }

    /// Insert a pending outbox row due immediately. Best-effort; a store
    /// failure is logged and reported as 0.
    async fn enqueue(
        &self,
        cfg: &HttpOutboxConfig,
        url: &str,
        connector_id: Option<&str>,
        path: Option<&str>,
        call: &HttpCall,
    ) -> i64 {
        let record = NewHttpOutboxRecord {
            http_method: safe_short_or(&call.method, 16, "POST"),
            url: safe_short_or(url, 4000, ""),
            connector_id: opt_short(connector_id, 100),
            path: opt_short(path, 2000),
            headers_json: serde_json::to_string(&sanitize_headers(&call.headers)).ok(),
            body_json: call.body.as_ref().map(Value::to_string),
            idempotency_key: opt_short(call.idempotency_key.as_deref(), 128),
            source_message_id: opt_short(call.source_message_id.as_deref(), 128),
            correlation_id: opt_short(call.correlation_id.as_deref(), 128),
            idem_key: opt_short(call.idem_key.as_deref(), 128),
            max_attempts: cfg.base.max_attempts.max(1),
            treat_4xx_as_success: opt_short(Some(cfg.treat_4xx_as_success.as_str()), 200),
        };

        match self
            .db
            .call(move |conn| queries::insert_http_outbox(conn, &record))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Failed to enqueue HTTP outbox record");
                0
            }
        }
    }

    /// One delivery attempt for a stored record, used by the dispatcher.
    ///
    /// Connector-bound records resolve base URL and auth from the live
    /// config at this moment, and the 4xx-as-success set stored with the
    /// record is honored here as well.
    pub async fn send_once(
        &self,
        record: &HttpOutboxRecord,
        idempotency_header_name: &str,
        effective: &RuntimeConfig,
    ) -> HttpSendOutcome {
        let stored_headers: HashMap<String, String> =
            Self::parse_headers(record.headers_json.as_deref());

        let (url, auth_headers) = match record.connector_id.as_deref().filter(|id| !id.is_empty()) {
            Some(connector_id) => {
                let connector = effective.connector(connector_id);
                let url = build_url(
                    connector.map(|c| c.base_url.as_str()),
                    record.path.as_deref(),
                );
                let auth_headers = match connector {
                    Some(connector) => self.auth.resolve_headers(&connector.auth).await,
                    None => HashMap::new(),
                };
                (url, auth_headers)
            }
            None => (record.url.clone(), HashMap::new()),
        };

        let mut headers = stored_headers;
        headers.extend(auth_headers);

        let outcome = self
            .sender
            .send(
                &record.http_method,
                &url,
                &headers,
                record.body_json.as_deref(),
                idempotency_header_name,
                record.idempotency_key.as_deref(),
            )
            .await;

        if !outcome.success
            && treat_4xx_as_success(record.treat_4xx_as_success.as_deref(), outcome.http_status)
        {
            return HttpSendOutcome::ok(outcome.http_status);
        }
        outcome
    }

    pub async fn get(&self, id: i64) -> OutboxResult<Option<HttpOutboxRecord>> {
        Ok(self.db.call(move |conn| queries::get_http_outbox(conn, id)).await?)
    }

    /// List records (no body), newest first.
    pub async fn list(
        &self,
        status: Option<OutboxStatus>,
        limit: i64,
    ) -> OutboxResult<Vec<HttpOutboxListItem>> {
        let limit = limit.clamp(1, 200);
        Ok(self
            .db
            .call(move |conn| queries::list_http_outbox(conn, status, limit))
            .await?)
    }

    /// Due pending records, oldest id first.
    pub async fn pick_due(&self, limit: i64) -> OutboxResult<Vec<HttpOutboxRecord>> {
        let limit = limit.clamp(1, 200);
        Ok(self.db.call(move |conn| queries::pick_due_http(conn, limit)).await?)
    }

    /// Claim a record for delivery; false means another worker won.
    pub async fn mark_sending(&self, id: i64) -> OutboxResult<bool> {
        Ok(self.db.call(move |conn| queries::mark_http_sending(conn, id)).await?)
    }

    pub async fn mark_sent(&self, id: i64, http_status: i64) -> OutboxResult<()> {
        Ok(self
            .db
            .call(move |conn| queries::mark_http_sent(conn, id, http_status))
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
        http_status: Option<i64>,
        dead: bool,
    ) -> OutboxResult<()> {
        let code = safe_short_or(&sanitize_text(error_code), 64, "HTTP_ERROR");
        let sanitized_message = sanitize_text(error_message);
        let message = opt_short(Some(sanitized_message.as_str()), 1000).unwrap_or_default();
        Ok(self
            .db
            .call(move |conn| {
                queries::mark_http_failed(
                    conn,
                    id,
                    attempts,
                    max_attempts,
                    next_attempt_at,
                    &code,
                    &message,
                    http_status,
                    dead,
                )
            })
            .await?)
    }

    /// Operator re-arm, usable even on dead records.
    pub async fn replay(&self, id: i64, reset_attempts: bool) -> OutboxResult<bool> {
        Ok(self
            .db
            .call(move |conn| queries::replay_http_outbox(conn, id, reset_attempts))
            .await?)
    }

    pub async fn count_by_status(&self, status: OutboxStatus) -> OutboxResult<i64> {
        Ok(self
            .db
            .call(move |conn| queries::count_http_by_status(conn, status))
            .await?)
    }

    /// Parse a stored headers_json column.
    pub fn parse_headers(headers_json: Option<&str>) -> HashMap<String, String> {
        headers_json
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Whether a 4xx status is in the configured logical-success set.
fn treat_4xx_as_success(set: Option<&str>, http_status: i64) -> bool {
    let Some(set) = set else { return false };
    if !(400..500).contains(&http_status) {
        return false;
    }
    set.split(',')
        .map(str::trim)
        .any(|code| code.parse::<i64>() == Ok(http_status))
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
