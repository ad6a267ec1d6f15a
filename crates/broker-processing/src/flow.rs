//! Flow resolver and executor seams.
//!
//! The broker core never inspects orchestration logic. It resolves a flow
//! definition for an envelope and hands both to the executor, then judges
//! only the outcome.

use async_trait::async_trait;
use broker_config::{FlowConfig, RuntimeConfig};
use broker_core::InboundEnvelope;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by the flow executor.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct FlowExecutionError {
    pub message: String,
}

impl FlowExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Executes a resolved flow. External collaborator.
#[async_trait]
pub trait FlowExecutor: Send + Sync {
    /// Run the flow for an envelope. `meta` carries the broker context
    /// (revision, ids, idempotency key) so downstream outbound calls can
    /// reuse the key.
    async fn execute(
        &self,
        envelope: &InboundEnvelope,
        flow: &FlowConfig,
        meta: &serde_json::Map<String, Value>,
    ) -> Result<serde_json::Map<String, Value>, FlowExecutionError>;
}

/// Resolves the flow definition for an envelope. Absence is a client error,
/// not a DLQ case.
pub trait FlowResolver: Send + Sync {
    fn resolve(&self, envelope: &InboundEnvelope, config: &RuntimeConfig) -> Option<FlowConfig>;
}

/// Resolver over the runtime config's `"KIND:type"` flow index.
pub struct ConfigFlowResolver;

impl FlowResolver for ConfigFlowResolver {
    fn resolve(&self, envelope: &InboundEnvelope, config: &RuntimeConfig) -> Option<FlowConfig> {
        let key = format!("{}:{}", envelope.kind.as_str(), envelope.message_type);
        config.flow_index().get(&key).map(|flow| (*flow).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::EnvelopeKind;
    use serde_json::json;
    use std::collections::HashMap;

    fn envelope(kind: EnvelopeKind, message_type: &str) -> InboundEnvelope {
        InboundEnvelope {
            kind,
            message_type: message_type.to_string(),
            payload: json!({}),
            headers: HashMap::new(),
            message_id: None,
            correlation_id: None,
            branch_id: None,
            user_id: None,
            source_meta: serde_json::Map::new(),
        }
    }

    #[test]
    fn resolves_by_kind_and_type() {
        let config: RuntimeConfig = serde_json::from_value(json!({
            "flows": [
                {"id": "visit-flow", "selector": {"kind": "EVENT", "type": "visit.created"}},
                {"id": "call-flow", "selector": {"kind": "COMMAND", "type": "ticket.call"}},
                {"id": "off", "enabled": false, "selector": {"kind": "EVENT", "type": "visit.closed"}}
            ]
        }))
        .unwrap();

        let resolver = ConfigFlowResolver;
        let flow = resolver
            .resolve(&envelope(EnvelopeKind::Event, "visit.created"), &config)
            .unwrap();
        assert_eq!(flow.id, "visit-flow");

        let flow = resolver
            .resolve(&envelope(EnvelopeKind::Command, "ticket.call"), &config)
            .unwrap();
        assert_eq!(flow.id, "call-flow");

        // Kind matters: the same type under the other kind does not match.
        assert!(resolver
            .resolve(&envelope(EnvelopeKind::Command, "visit.created"), &config)
            .is_none());
        // Disabled flows are invisible.
        assert!(resolver
            .resolve(&envelope(EnvelopeKind::Event, "visit.closed"), &config)
            .is_none());
    }
}
