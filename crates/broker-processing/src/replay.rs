//! Operator-triggered replay of dead letters.
//!
//! Replay reconstructs the original envelope from the stored DLQ row, tags
//! it with the replay marker, and pushes it back through the normal
//! processing pipeline. It is never scheduled automatically.

use crate::ProcessingService;
use broker_core::{sanitize_text, EnvelopeKind, InboundEnvelope, DLQ_REPLAY_META_KEY};
use broker_database::DlqStatus;
use broker_dlq::{DlqFull, DlqListFilter, InboundDlqStore};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

/// Result of replaying one DLQ record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    /// PROCESSED / SKIP_COMPLETED / LOCKED / FAILED / DEAD / NOT_FOUND.
    pub outcome: String,
    pub dlq_id: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub output: Option<Map<String, Value>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Tallied result of a batch replay.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayBatchReport {
    pub scanned: usize,
    pub ok: usize,
    pub locked: usize,
    pub failed: usize,
    pub dead: usize,
    pub items: Vec<ReplayReport>,
}

/// Batch replay selection. Defaults to PENDING records.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    pub status: Option<DlqStatus>,
    pub message_type: Option<String>,
    pub source: Option<String>,
    pub branch_id: Option<String>,
}

/// Replays dead letters through the processing pipeline.
pub struct DlqReplayService {
    dlq: InboundDlqStore,
    processing: Arc<ProcessingService>,
}

impl DlqReplayService {
    pub fn new(dlq: InboundDlqStore, processing: Arc<ProcessingService>) -> Self {
        Self { dlq, processing }
    }

    /// Replay one record.
    ///
    /// DEAD records are refused (the attempt limit is exhausted; an operator
    /// has to resolve the underlying problem first). A LOCKED outcome leaves
    /// the record untouched for a later replay.
    pub async fn replay(&self, dlq_id: i64) -> ReplayReport {
        let full = match self.dlq.get_full(dlq_id).await {
            Ok(Some(full)) => full,
            Ok(None) => {
                return ReplayReport {
                    outcome: "NOT_FOUND".to_string(),
                    dlq_id,
                    attempts: 0,
                    max_attempts: 0,
                    output: None,
                    error_code: Some("DLQ_NOT_FOUND".to_string()),
                    error_message: Some("No such dead letter".to_string()),
                }
            }
            Err(e) => {
                return ReplayReport {
                    outcome: "FAILED".to_string(),
                    dlq_id,
                    attempts: 0,
                    max_attempts: 0,
                    output: None,
                    error_code: Some("DLQ_READ_ERROR".to_string()),
                    error_message: Some(sanitize_text(&e.to_string())),
                }
            }
        };

        if full.record.status == DlqStatus::Dead {
            return ReplayReport {
                outcome: "DEAD".to_string(),
                dlq_id,
                attempts: full.record.attempts,
                max_attempts: full.record.max_attempts,
                output: None,
                error_code: Some("DLQ_DEAD".to_string()),
                error_message: Some("Attempt limit exhausted".to_string()),
            };
        }

        let envelope = reconstruct_envelope(&full, dlq_id);

        match self.processing.process(&envelope).await {
            Ok(report) if report.outcome == crate::ProcessingOutcome::Locked => ReplayReport {
                outcome: report.outcome.as_str().to_string(),
                dlq_id,
                attempts: full.record.attempts,
                max_attempts: full.record.max_attempts,
                output: Some(report.output),
                error_code: None,
                error_message: None,
            },
            Ok(report) => {
                let replay_result = serde_json::to_string(&report)
                    .unwrap_or_else(|_| json!({"outcome": report.outcome.as_str()}).to_string());
                self.dlq.mark_replayed(dlq_id, &replay_result).await;
                info!(dlq_id, outcome = report.outcome.as_str(), "Dead letter replayed");
                ReplayReport {
                    outcome: report.outcome.as_str().to_string(),
                    dlq_id,
                    attempts: full.record.attempts,
                    max_attempts: full.record.max_attempts,
                    output: Some(report.output),
                    error_code: None,
                    error_message: None,
                }
            }
            Err(e) => {
                let safe_message = sanitize_text(&e.to_string());
                self.dlq
                    .mark_replay_failed(dlq_id, "REPLAY_FAILED", &safe_message)
                    .await;
                ReplayReport {
                    outcome: "FAILED".to_string(),
                    dlq_id,
                    attempts: full.record.attempts + 1,
                    max_attempts: full.record.max_attempts,
                    output: None,
                    error_code: Some("REPLAY_FAILED".to_string()),
                    error_message: Some(safe_message),
                }
            }
        }
    }

    /// Replay all records matching the filter, tallying the outcomes.
    pub async fn replay_batch(&self, filter: ReplayFilter, limit: i64) -> ReplayBatchReport {
        let status = filter.status.unwrap_or(DlqStatus::Pending);
        let records = self
            .dlq
            .list(
                DlqListFilter {
                    status: Some(status),
                    message_type: filter.message_type,
                    source: filter.source,
                    branch_id: filter.branch_id,
                },
                limit.clamp(1, 200),
            )
            .await
            .unwrap_or_default();

        let mut report = ReplayBatchReport {
            scanned: records.len(),
            ok: 0,
            locked: 0,
            failed: 0,
            dead: 0,
            items: Vec::with_capacity(records.len()),
        };

        for record in records {
            let item = self.replay(record.id).await;
            match item.outcome.as_str() {
                "PROCESSED" | "SKIP_COMPLETED" | "REPLAYED" => report.ok += 1,
                "LOCKED" => report.locked += 1,
                "DEAD" => report.dead += 1,
                "FAILED" => report.failed += 1,
                _ => {}
            }
            report.items.push(item);
        }
        report
    }
}

/// Rebuild the inbound envelope from a stored dead letter, tagged with the
/// replay marker so a renewed failure updates this record instead of
/// creating a new one.
fn reconstruct_envelope(full: &DlqFull, dlq_id: i64) -> InboundEnvelope {
    let mut source_meta = full.source_meta.clone();
    source_meta.insert(DLQ_REPLAY_META_KEY.to_string(), json!(dlq_id));

    InboundEnvelope {
        kind: EnvelopeKind::from_str(&full.record.kind),
        message_type: full.record.message_type.clone().unwrap_or_default(),
        payload: full.payload.clone(),
        headers: full.headers.clone(),
        message_id: full.record.message_id.clone(),
        correlation_id: full.record.correlation_id.clone(),
        branch_id: full.record.branch_id.clone(),
        user_id: full.record.user_id.clone(),
        source_meta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigFlowResolver, FlowExecutionError, FlowExecutor, ProcessingError};
    use async_trait::async_trait;
    use broker_config::{RuntimeConfig, RuntimeConfigStore};
    use broker_database::AsyncDatabase;
    use broker_idempotency::IdempotencyGate;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SwitchableExecutor {
        fail: AtomicBool,
    }

    #[async_trait]
    impl FlowExecutor for SwitchableExecutor {
        async fn execute(
            &self,
            _envelope: &InboundEnvelope,
            _flow: &broker_config::FlowConfig,
            _meta: &Map<String, Value>,
        ) -> Result<Map<String, Value>, FlowExecutionError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(FlowExecutionError::new("downstream unavailable"))
            } else {
                let mut output = Map::new();
                output.insert("status".to_string(), json!("done"));
                Ok(output)
            }
        }
    }

    fn runtime_config(max_attempts: i64) -> RuntimeConfig {
        serde_json::from_value(json!({
            "flows": [
                {"id": "visit-flow", "selector": {"kind": "EVENT", "type": "visit.created"}}
            ],
            "inboundDlq": {"enabled": true, "maxAttempts": max_attempts, "sanitizeHeaders": true}
        }))
        .unwrap()
    }

    fn envelope(message_id: &str) -> InboundEnvelope {
        InboundEnvelope {
            kind: EnvelopeKind::Event,
            message_type: "visit.created".to_string(),
            payload: json!({"visitId": 7}),
            headers: HashMap::new(),
            message_id: Some(message_id.to_string()),
            correlation_id: Some("c1".to_string()),
            branch_id: None,
            user_id: None,
            source_meta: Map::new(),
        }
    }

    struct Fixture {
        replay: DlqReplayService,
        dlq: InboundDlqStore,
        processing: Arc<ProcessingService>,
        executor: Arc<SwitchableExecutor>,
    }

    async fn fixture(max_attempts: i64) -> Fixture {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let executor = Arc::new(SwitchableExecutor {
            fail: AtomicBool::new(true),
        });
        let dlq = InboundDlqStore::new(db.clone());
        let processing = Arc::new(ProcessingService::new(
            Arc::new(RuntimeConfigStore::new(runtime_config(max_attempts))),
            Arc::new(ConfigFlowResolver),
            executor.clone(),
            IdempotencyGate::new(db),
            dlq.clone(),
        ));
        Fixture {
            replay: DlqReplayService::new(dlq.clone(), processing.clone()),
            dlq,
            processing,
            executor,
        }
    }

    async fn park_message(f: &Fixture, message_id: &str) -> i64 {
        let err = f.processing.process(&envelope(message_id)).await.unwrap_err();
        match err {
            ProcessingError::StoredInDlq { dlq_id, .. } => dlq_id,
            other => panic!("expected StoredInDlq, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_replay_marks_record_replayed() {
        let f = fixture(5).await;
        let dlq_id = park_message(&f, "m1").await;

        // The downstream is healthy again.
        f.executor.fail.store(false, Ordering::SeqCst);

        let report = f.replay.replay(dlq_id).await;
        assert_eq!(report.outcome, "PROCESSED");
        assert_eq!(report.dlq_id, dlq_id);

        let full = f.dlq.get_full(dlq_id).await.unwrap().unwrap();
        assert_eq!(full.record.status, DlqStatus::Replayed);
        let stored: Value =
            serde_json::from_str(full.replay_result_json.as_deref().unwrap()).unwrap();
        assert_eq!(stored["outcome"], json!("PROCESSED"));
    }

    #[tokio::test]
    async fn failed_replay_increments_same_record() {
        let f = fixture(3).await;
        let dlq_id = park_message(&f, "m1").await;

        let report = f.replay.replay(dlq_id).await;
        assert_eq!(report.outcome, "FAILED");
        assert_eq!(report.attempts, 1);

        // Same record id, one row total: the replay marker prevented a
        // second dead letter.
        let record = f.dlq.get(dlq_id).await.unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.status, DlqStatus::Pending);
        assert_eq!(
            f.dlq.list(DlqListFilter::default(), 50).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn replay_reaches_dead_and_refuses_further_attempts() {
        let f = fixture(2).await;
        let dlq_id = park_message(&f, "m1").await;

        assert_eq!(f.replay.replay(dlq_id).await.outcome, "FAILED");
        assert_eq!(f.replay.replay(dlq_id).await.outcome, "FAILED");

        let record = f.dlq.get(dlq_id).await.unwrap().unwrap();
        assert_eq!(record.status, DlqStatus::Dead);
        assert_eq!(record.attempts, 2);

        // Dead records are refused without running the flow.
        let report = f.replay.replay(dlq_id).await;
        assert_eq!(report.outcome, "DEAD");
        assert_eq!(report.error_code.as_deref(), Some("DLQ_DEAD"));
        let record = f.dlq.get(dlq_id).await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn replay_missing_record_reports_not_found() {
        let f = fixture(3).await;
        let report = f.replay.replay(12345).await;
        assert_eq!(report.outcome, "NOT_FOUND");
        assert_eq!(report.error_code.as_deref(), Some("DLQ_NOT_FOUND"));
    }

    #[tokio::test]
    async fn batch_replay_tallies_outcomes() {
        let f = fixture(5).await;
        let first = park_message(&f, "m1").await;
        let second = park_message(&f, "m2").await;

        f.executor.fail.store(false, Ordering::SeqCst);

        let report = f.replay.replay_batch(ReplayFilter::default(), 50).await;
        assert_eq!(report.scanned, 2);
        assert_eq!(report.ok, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.items.len(), 2);

        for id in [first, second] {
            let record = f.dlq.get(id).await.unwrap().unwrap();
            assert_eq!(record.status, DlqStatus::Replayed);
        }

        // Nothing pending is left to scan.
        let report = f.replay.replay_batch(ReplayFilter::default(), 50).await;
        assert_eq!(report.scanned, 0);
    }
}
