//! Admission gate backed by the idempotency table.

use crate::key::{derive_key, validate_provided_key};
use crate::IdempotencyResult;
use broker_config::IdempotencyConfig;
use broker_core::{sanitize_text, InboundEnvelope};
use broker_database::{
    queries, AsyncDatabase, IdempotencyRecord, IdempotencyStatus, SkippedReason,
};
use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};

/// Admission decision for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The message should be processed.
    Process,
    /// Already completed: skip and return the cached result.
    SkipCompleted,
    /// Another processing run holds the lock. Not a poison condition.
    Locked,
}

/// Outcome of [`IdempotencyGate::decide`].
#[derive(Debug, Clone)]
pub struct GateDecision {
    /// Derived key, None when the gate is disabled.
    pub idem_key: Option<String>,
    pub decision: Decision,
    /// Cached result, present for SkipCompleted when one was stored.
    pub existing_result_json: Option<String>,
    pub skipped_reason: Option<SkippedReason>,
}

impl GateDecision {
    fn process(idem_key: Option<String>) -> Self {
        Self {
            idem_key,
            decision: Decision::Process,
            existing_result_json: None,
            skipped_reason: None,
        }
    }

    fn locked(idem_key: String) -> Self {
        Self {
            idem_key: Some(idem_key),
            decision: Decision::Locked,
            existing_result_json: None,
            skipped_reason: Some(SkippedReason::Locked),
        }
    }
}

/// Idempotency gate.
///
/// Owns every transition of the idempotency table. The decide path treats
/// store outages as a reason to process (availability over duplicate
/// suppression); the bookkeeping writes never fail the caller.
#[derive(Clone)]
pub struct IdempotencyGate {
    db: AsyncDatabase,
}

impl IdempotencyGate {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    /// Decide whether to process an inbound message.
    ///
    /// The only error is a malformed client-provided key; store trouble
    /// degrades to PROCESS (first insert path) or LOCKED (reclaim path)
    /// with a warning, never an error.
    pub async fn decide(
        &self,
        envelope: &InboundEnvelope,
        config: &IdempotencyConfig,
    ) -> IdempotencyResult<GateDecision> {
        if !config.enabled {
            return Ok(GateDecision::process(None));
        }

        validate_provided_key(envelope)?;

        let idem_key = derive_key(envelope, config.strategy);
        let lock_ttl = Duration::seconds(config.lock_ttl_sec.max(1));
        let lock_until = Utc::now() + lock_ttl;
        let strategy = config.strategy.as_str();

        // 1) Try to create a fresh record; the unique key is the dedupe.
        let inserted = {
            let key = idem_key.clone();
            self.db
                .call(move |conn| queries::try_insert_idempotency(conn, &key, strategy, lock_until))
                .await
        };
        match inserted {
            Ok(true) => return Ok(GateDecision::process(Some(idem_key))),
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Idempotency insert failed; processing without dedupe");
                return Ok(GateDecision::process(Some(idem_key)));
            }
        }

        // 2) Key exists: inspect the row.
        let row = {
            let key = idem_key.clone();
            self.db.call(move |conn| queries::get_idempotency(conn, &key)).await
        };
        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => {
                // Only possible under a delete race; processing is the safe call.
                return Ok(GateDecision::process(Some(idem_key)));
            }
            Err(e) => {
                warn!(error = %e, "Idempotency read failed; processing without dedupe");
                return Ok(GateDecision::process(Some(idem_key)));
            }
        };

        if row.status == IdempotencyStatus::Completed {
            self.record_skip(&idem_key, SkippedReason::Duplicate).await;
            return Ok(GateDecision {
                idem_key: Some(idem_key),
                decision: Decision::SkipCompleted,
                existing_result_json: row.result_json,
                skipped_reason: Some(SkippedReason::Duplicate),
            });
        }

        let now = Utc::now();
        if row.status == IdempotencyStatus::InProgress
            && row.lock_until.is_some_and(|until| until > now)
        {
            self.record_skip(&idem_key, SkippedReason::Locked).await;
            return Ok(GateDecision::locked(idem_key));
        }

        // 3) Failed, or in-progress with an expired lock: try to reclaim.
        // The update is conditional on the row still being reclaimable, so a
        // lost race comes back as LOCKED.
        let reclaimed = {
            let key = idem_key.clone();
            self.db
                .call(move |conn| queries::reclaim_idempotency(conn, &key, lock_until))
                .await
        };
        match reclaimed {
            Ok(true) => {
                debug!(idem_key = %idem_key, "Reclaimed idempotency record");
                Ok(GateDecision::process(Some(idem_key)))
            }
            Ok(false) => {
                self.record_skip(&idem_key, SkippedReason::Locked).await;
                Ok(GateDecision::locked(idem_key))
            }
            Err(e) => {
                warn!(error = %e, "Idempotency reclaim failed");
                Ok(GateDecision::locked(idem_key))
            }
        }
    }

    /// Record a completed run and its result. Best-effort: bookkeeping must
    /// never become the reason the primary flow fails.
    pub async fn mark_completed(&self, idem_key: Option<&str>, result: &Value) {
        let Some(idem_key) = idem_key else { return };

        let result_json = serde_json::to_string(result)
            .unwrap_or_else(|_| r#"{"note":"result not serializable"}"#.to_string());

        let key = idem_key.to_string();
        if let Err(e) = self
            .db
            .call(move |conn| queries::mark_idempotency_completed(conn, &key, &result_json))
            .await
        {
            warn!(idem_key, error = %e, "Failed to mark idempotency completed");
        }
    }

    /// Record a failed run. Best-effort; the stored text is sanitized.
    pub async fn mark_failed(&self, idem_key: Option<&str>, error_code: &str, error_message: &str) {
        let Some(idem_key) = idem_key else { return };

        let code = safe_short(&sanitize_text(error_code), 64);
        let message = safe_short(&sanitize_text(error_message), 500);

        let key = idem_key.to_string();
        if let Err(e) = self
            .db
            .call(move |conn| queries::mark_idempotency_failed(conn, &key, &code, &message))
            .await
        {
            warn!(idem_key, error = %e, "Failed to mark idempotency failed");
        }
    }

    /// Operator escape hatch: force a stuck in-progress record to failed.
    /// The stored payload and result are untouched; the action is audited in
    /// the error message field.
    pub async fn manual_unlock(&self, idem_key: &str, actor: &str, reason: &str) -> bool {
        let idem_key = idem_key.trim();
        if idem_key.is_empty() {
            return false;
        }

        let audit = format!(
            "manualUnlock actor={}; reason={}",
            safe_short(actor, 120),
            safe_short(&sanitize_text(reason), 500)
        );

        let key = idem_key.to_string();
        match self
            .db
            .call(move |conn| queries::manual_unlock_idempotency(conn, &key, &audit))
            .await
        {
            Ok(unlocked) => unlocked,
            Err(e) => {
                warn!(idem_key, error = %e, "Manual unlock failed");
                false
            }
        }
    }

    /// Fetch one record for diagnostics.
    pub async fn get(&self, idem_key: &str) -> IdempotencyResult<Option<IdempotencyRecord>> {
        let key = idem_key.to_string();
        Ok(self.db.call(move |conn| queries::get_idempotency(conn, &key)).await?)
    }

    /// List records for diagnostics, newest first.
    pub async fn list(
        &self,
        status: Option<IdempotencyStatus>,
        limit: i64,
    ) -> IdempotencyResult<Vec<IdempotencyRecord>> {
        let limit = limit.clamp(1, 200);
        Ok(self
            .db
            .call(move |conn| queries::list_idempotency(conn, status, limit))
            .await?)
    }

    /// Count records in one status.
    pub async fn count_by_status(&self, status: IdempotencyStatus) -> IdempotencyResult<i64> {
        Ok(self
            .db
            .call(move |conn| queries::count_idempotency_by_status(conn, status))
            .await?)
    }

    async fn record_skip(&self, idem_key: &str, reason: SkippedReason) {
        let key = idem_key.to_string();
        if let Err(e) = self
            .db
            .call(move |conn| queries::set_idempotency_skipped_reason(conn, &key, reason))
            .await
        {
            warn!(idem_key, error = %e, "Failed to record skipped reason");
        }
    }
}

fn safe_short(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}
