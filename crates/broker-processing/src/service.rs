//! The inbound processing orchestrator.

use crate::{FlowExecutor, FlowResolver, ProcessingError, ProcessingResult};
use broker_config::{RuntimeConfig, RuntimeConfigStore};
use broker_core::{sanitize_text, InboundEnvelope};
use broker_dlq::InboundDlqStore;
use broker_idempotency::{Decision, IdempotencyError, IdempotencyGate};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const FLOW_ERROR_CODE: &str = "FLOW_EXECUTION_ERROR";

/// How an inbound message ended up.
///
/// LOCKED and SKIP_COMPLETED are success-shaped outcomes for the ingress
/// layer, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingOutcome {
    Processed,
    SkipCompleted,
    Locked,
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "PROCESSED",
            Self::SkipCompleted => "SKIP_COMPLETED",
            Self::Locked => "LOCKED",
        }
    }
}

/// Result of processing one envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingReport {
    pub outcome: ProcessingOutcome,
    pub idempotency_key: Option<String>,
    pub output: Map<String, Value>,
}

/// Sequences gate -> flow executor -> bookkeeping for every inbound message.
pub struct ProcessingService {
    config_store: Arc<RuntimeConfigStore>,
    resolver: Arc<dyn FlowResolver>,
    executor: Arc<dyn FlowExecutor>,
    gate: IdempotencyGate,
    dlq: InboundDlqStore,
}

impl ProcessingService {
    pub fn new(
        config_store: Arc<RuntimeConfigStore>,
        resolver: Arc<dyn FlowResolver>,
        executor: Arc<dyn FlowExecutor>,
        gate: IdempotencyGate,
        dlq: InboundDlqStore,
    ) -> Self {
        Self {
            config_store,
            resolver,
            executor,
            gate,
            dlq,
        }
    }

    /// Process one inbound envelope.
    ///
    /// Fails fast when no flow matches (client error, nothing is enqueued).
    /// Flow failures are recorded on the idempotency record and escalated to
    /// the DLQ when enabled, unless the envelope is itself a DLQ replay, in
    /// which case the existing record is the one to update and the error
    /// propagates directly.
    pub async fn process(&self, envelope: &InboundEnvelope) -> ProcessingResult<ProcessingReport> {
        let cfg = self.config_store.effective();

        let Some(flow) = self.resolver.resolve(envelope, &cfg) else {
            return Err(ProcessingError::FlowNotFound {
                kind: envelope.kind.as_str().to_string(),
                message_type: envelope.message_type.clone(),
            });
        };

        // Idempotency applies at the door, before the flow runs.
        let decision = self
            .gate
            .decide(envelope, &cfg.idempotency)
            .await
            .map_err(|e| match e {
                IdempotencyError::InvalidProvidedKey(key) => {
                    ProcessingError::InvalidIdempotencyKey(key)
                }
                IdempotencyError::Database(e) => ProcessingError::Database(e),
            })?;

        match decision.decision {
            Decision::SkipCompleted => {
                let mut output = restore_cached_output(decision.existing_result_json.as_deref());
                output.insert(
                    "note".to_string(),
                    json!("Message was already processed (SKIP_COMPLETED)"),
                );
                debug!(
                    idem_key = decision.idem_key.as_deref().unwrap_or(""),
                    "Duplicate delivery skipped"
                );
                Ok(ProcessingReport {
                    outcome: ProcessingOutcome::SkipCompleted,
                    idempotency_key: decision.idem_key,
                    output,
                })
            }
            Decision::Locked => {
                let mut output = Map::new();
                output.insert(
                    "note".to_string(),
                    json!("Message is being processed elsewhere (LOCKED)"),
                );
                Ok(ProcessingReport {
                    outcome: ProcessingOutcome::Locked,
                    idempotency_key: decision.idem_key,
                    output,
                })
            }
            Decision::Process => {
                self.run_flow(envelope, &cfg, &flow, decision.idem_key).await
            }
        }
    }

    async fn run_flow(
        &self,
        envelope: &InboundEnvelope,
        cfg: &RuntimeConfig,
        flow: &broker_config::FlowConfig,
        idem_key: Option<String>,
    ) -> ProcessingResult<ProcessingReport> {
        let meta = build_meta(envelope, cfg, idem_key.as_deref());

        match self.executor.execute(envelope, flow, &meta).await {
            Ok(output) => {
                self.gate
                    .mark_completed(idem_key.as_deref(), &Value::Object(output.clone()))
                    .await;
                info!(
                    flow_id = %flow.id,
                    message_type = %envelope.message_type,
                    "Inbound message processed"
                );
                Ok(ProcessingReport {
                    outcome: ProcessingOutcome::Processed,
                    idempotency_key: idem_key,
                    output,
                })
            }
            Err(e) => {
                let safe_message = sanitize_text(&e.message);
                self.gate
                    .mark_failed(idem_key.as_deref(), FLOW_ERROR_CODE, &safe_message)
                    .await;

                // A failed replay must increment the existing DLQ record,
                // never create a second one.
                if cfg.inbound_dlq.enabled && !envelope.is_dlq_replay() {
                    if let Some(dlq_id) = self
                        .dlq
                        .put(
                            envelope,
                            idem_key.as_deref(),
                            FLOW_ERROR_CODE,
                            &safe_message,
                            cfg.inbound_dlq.max_attempts,
                            cfg.inbound_dlq.sanitize_headers,
                        )
                        .await
                    {
                        warn!(
                            dlq_id,
                            flow_id = %flow.id,
                            message_type = %envelope.message_type,
                            "Flow failed; message stored in DLQ"
                        );
                        return Err(ProcessingError::StoredInDlq {
                            dlq_id,
                            idempotency_key: idem_key,
                            error_code: FLOW_ERROR_CODE.to_string(),
                            safe_message,
                        });
                    }
                }

                Err(ProcessingError::FlowFailed {
                    error_code: FLOW_ERROR_CODE.to_string(),
                    safe_message,
                })
            }
        }
    }
}

fn build_meta(
    envelope: &InboundEnvelope,
    cfg: &RuntimeConfig,
    idem_key: Option<&str>,
) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("revision".to_string(), json!(cfg.revision));
    meta.insert("kind".to_string(), json!(envelope.kind.as_str()));
    meta.insert("type".to_string(), json!(envelope.message_type));
    meta.insert("messageId".to_string(), json!(envelope.message_id));
    meta.insert("correlationId".to_string(), json!(envelope.correlation_id));
    meta.insert("branchId".to_string(), json!(envelope.branch_id));
    meta.insert("userId".to_string(), json!(envelope.user_id));
    if let Some(idem_key) = idem_key {
        meta.insert("idempotencyKey".to_string(), json!(idem_key));
    }
    meta
}

fn restore_cached_output(result_json: Option<&str>) -> Map<String, Value> {
    let Some(raw) = result_json else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert("resultJson".to_string(), json!(raw));
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigFlowResolver, FlowExecutionError};
    use async_trait::async_trait;
    use broker_core::{EnvelopeKind, DLQ_REPLAY_META_KEY};
    use broker_database::{AsyncDatabase, DlqStatus, IdempotencyStatus};
    use broker_dlq::DlqListFilter;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedExecutor {
        fail: AtomicBool,
        executions: AtomicUsize,
        last_meta: Mutex<Option<Map<String, Value>>>,
    }

    impl ScriptedExecutor {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                executions: AtomicUsize::new(0),
                last_meta: Mutex::new(None),
            })
        }

        fn failing() -> Arc<Self> {
            let executor = Self::succeeding();
            executor.fail.store(true, Ordering::SeqCst);
            executor
        }
    }

    #[async_trait]
    impl FlowExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _envelope: &InboundEnvelope,
            _flow: &broker_config::FlowConfig,
            meta: &Map<String, Value>,
        ) -> Result<Map<String, Value>, FlowExecutionError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            *self.last_meta.lock().unwrap() = Some(meta.clone());
            if self.fail.load(Ordering::SeqCst) {
                Err(FlowExecutionError::new("downstream rejected the request"))
            } else {
                let mut output = Map::new();
                output.insert("status".to_string(), json!("done"));
                Ok(output)
            }
        }
    }

    fn runtime_config() -> RuntimeConfig {
        serde_json::from_value(json!({
            "revision": "r7",
            "flows": [
                {"id": "visit-flow", "selector": {"kind": "EVENT", "type": "visit.created"}}
            ],
            "inboundDlq": {"enabled": true, "maxAttempts": 2, "sanitizeHeaders": true}
        }))
        .unwrap()
    }

    fn envelope(message_id: &str) -> InboundEnvelope {
        InboundEnvelope {
            kind: EnvelopeKind::Event,
            message_type: "visit.created".to_string(),
            payload: json!({"visitId": 1}),
            headers: HashMap::new(),
            message_id: Some(message_id.to_string()),
            correlation_id: None,
            branch_id: None,
            user_id: None,
            source_meta: Map::new(),
        }
    }

    struct Fixture {
        service: ProcessingService,
        executor: Arc<ScriptedExecutor>,
        gate: IdempotencyGate,
        dlq: InboundDlqStore,
    }

    async fn fixture(executor: Arc<ScriptedExecutor>) -> Fixture {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let gate = IdempotencyGate::new(db.clone());
        let dlq = InboundDlqStore::new(db);
        let service = ProcessingService::new(
            Arc::new(RuntimeConfigStore::new(runtime_config())),
            Arc::new(ConfigFlowResolver),
            executor.clone(),
            gate.clone(),
            dlq.clone(),
        );
        Fixture {
            service,
            executor,
            gate,
            dlq,
        }
    }

    #[tokio::test]
    async fn successful_flow_is_processed_and_completed() {
        let f = fixture(ScriptedExecutor::succeeding()).await;

        let report = f.service.process(&envelope("m1")).await.unwrap();
        assert_eq!(report.outcome, ProcessingOutcome::Processed);
        assert_eq!(report.output["status"], json!("done"));

        let key = report.idempotency_key.unwrap();
        let record = f.gate.get(&key).await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Completed);

        // The executor received the broker context including the key.
        let meta = f.executor.last_meta.lock().unwrap().clone().unwrap();
        assert_eq!(meta["revision"], json!("r7"));
        assert_eq!(meta["type"], json!("visit.created"));
        assert_eq!(meta["idempotencyKey"], json!(key));
    }

    #[tokio::test]
    async fn unresolved_flow_is_rejected_without_side_effects() {
        let f = fixture(ScriptedExecutor::succeeding()).await;
        let mut env = envelope("m1");
        env.message_type = "unknown.type".to_string();

        let err = f.service.process(&env).await.unwrap_err();
        assert!(matches!(err, ProcessingError::FlowNotFound { .. }));
        assert_eq!(f.executor.executions.load(Ordering::SeqCst), 0);
        // Nothing recorded anywhere.
        assert_eq!(
            f.gate.count_by_status(IdempotencyStatus::InProgress).await.unwrap(),
            0
        );
        assert_eq!(f.dlq.count_by_status(DlqStatus::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_returns_cached_output() {
        let f = fixture(ScriptedExecutor::succeeding()).await;

        let first = f.service.process(&envelope("m1")).await.unwrap();
        let duplicate = f.service.process(&envelope("m1")).await.unwrap();

        assert_eq!(duplicate.outcome, ProcessingOutcome::SkipCompleted);
        assert_eq!(duplicate.idempotency_key, first.idempotency_key);
        assert_eq!(duplicate.output["status"], json!("done"));
        assert!(duplicate.output.contains_key("note"));
        // The flow ran exactly once.
        assert_eq!(f.executor.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_message_reports_locked() {
        let f = fixture(ScriptedExecutor::succeeding()).await;

        // Another processing run holds the lock.
        let cfg = runtime_config();
        let held = f.gate.decide(&envelope("m1"), &cfg.idempotency).await.unwrap();
        assert_eq!(held.decision, broker_idempotency::Decision::Process);

        let report = f.service.process(&envelope("m1")).await.unwrap();
        assert_eq!(report.outcome, ProcessingOutcome::Locked);
        assert_eq!(f.executor.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flow_failure_goes_to_dlq() {
        let f = fixture(ScriptedExecutor::failing()).await;

        let err = f.service.process(&envelope("m1")).await.unwrap_err();
        let ProcessingError::StoredInDlq {
            dlq_id,
            idempotency_key,
            error_code,
            ..
        } = err
        else {
            panic!("expected StoredInDlq, got {err:?}");
        };
        assert_eq!(error_code, "FLOW_EXECUTION_ERROR");

        let full = f.dlq.get_full(dlq_id).await.unwrap().unwrap();
        assert_eq!(full.record.status, DlqStatus::Pending);
        assert_eq!(full.record.max_attempts, 2);
        assert_eq!(full.record.idem_key, idempotency_key);
        assert_eq!(full.payload, json!({"visitId": 1}));

        let record = f.gate.get(idempotency_key.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Failed);
    }

    #[tokio::test]
    async fn replay_failure_does_not_create_second_dlq_row() {
        let f = fixture(ScriptedExecutor::failing()).await;

        let mut env = envelope("m1");
        env.source_meta.insert(DLQ_REPLAY_META_KEY.to_string(), json!(42));

        let err = f.service.process(&env).await.unwrap_err();
        assert!(matches!(err, ProcessingError::FlowFailed { .. }));
        assert_eq!(
            f.dlq.list(DlqListFilter::default(), 50).await.unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn dlq_disabled_propagates_flow_failure() {
        let executor = ScriptedExecutor::failing();
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let mut cfg = runtime_config();
        cfg.inbound_dlq.enabled = false;

        let service = ProcessingService::new(
            Arc::new(RuntimeConfigStore::new(cfg)),
            Arc::new(ConfigFlowResolver),
            executor,
            IdempotencyGate::new(db.clone()),
            InboundDlqStore::new(db.clone()),
        );

        let err = service.process(&envelope("m1")).await.unwrap_err();
        assert!(matches!(err, ProcessingError::FlowFailed { .. }));
        assert_eq!(
            InboundDlqStore::new(db)
                .count_by_status(DlqStatus::Pending)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn failed_message_can_be_retried_after_failure() {
        let f = fixture(ScriptedExecutor::failing()).await;

        let err = f.service.process(&envelope("m1")).await.unwrap_err();
        assert!(matches!(err, ProcessingError::StoredInDlq { .. }));

        // The flow is fixed; the same message id gets through because the
        // failed idempotency record is reclaimed.
        f.executor.fail.store(false, Ordering::SeqCst);
        let report = f.service.process(&envelope("m1")).await.unwrap();
        assert_eq!(report.outcome, ProcessingOutcome::Processed);
    }

    #[tokio::test]
    async fn sanitizes_flow_error_text() {
        let executor = ScriptedExecutor::failing();
        let f = fixture(executor).await;

        // The executor error carries a token; it must not survive into the
        // stored error message.
        struct LeakyExecutor;
        #[async_trait]
        impl FlowExecutor for LeakyExecutor {
            async fn execute(
                &self,
                _envelope: &InboundEnvelope,
                _flow: &broker_config::FlowConfig,
                _meta: &Map<String, Value>,
            ) -> Result<Map<String, Value>, FlowExecutionError> {
                Err(FlowExecutionError::new(
                    "call failed: Authorization: Bearer leak-me",
                ))
            }
        }

        let service = ProcessingService::new(
            Arc::new(RuntimeConfigStore::new(runtime_config())),
            Arc::new(ConfigFlowResolver),
            Arc::new(LeakyExecutor),
            f.gate.clone(),
            f.dlq.clone(),
        );

        let err = service.process(&envelope("m2")).await.unwrap_err();
        let ProcessingError::StoredInDlq { safe_message, dlq_id, .. } = err else {
            panic!("expected StoredInDlq");
        };
        assert!(safe_message.contains("Bearer ***"));
        assert!(!safe_message.contains("leak-me"));

        let record = f.dlq.get(dlq_id).await.unwrap().unwrap();
        assert!(!record.error_message.unwrap().contains("leak-me"));
    }
}
