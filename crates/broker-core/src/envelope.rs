//! Normalized inbound envelope.
//!
//! Every inbound channel (REST, message bus consumers, pollers) must map its
//! input to this contract before handing it to the processing pipeline. The
//! idempotency gate, DLQ and replay all operate on this shape only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Source-meta key marking an envelope as a DLQ replay.
///
/// A failed replay must increment the existing DLQ record instead of
/// creating a second one; this marker is how the orchestrator knows.
pub const DLQ_REPLAY_META_KEY: &str = "dlqReplayId";

/// Whether the inbound message is an event or a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvelopeKind {
    Event,
    Command,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "EVENT",
            Self::Command => "COMMAND",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "COMMAND" => Self::Command,
            _ => Self::Event,
        }
    }
}

/// Normalized inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    /// Event or command.
    pub kind: EnvelopeKind,
    /// Message type, e.g. `visit.created` or `ticket.call.requested`.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Payload as received (JSON). Kept verbatim for replay; never logged.
    pub payload: Value,
    /// Normalized headers/attributes.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Unique message id, ideally globally unique.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Correlation id for end-to-end tracing.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Branch/office id, if applicable.
    #[serde(default)]
    pub branch_id: Option<String>,
    /// User/operator id, if applicable.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Source bookkeeping (channel, source system, partition/offset, ...).
    #[serde(default)]
    pub source_meta: serde_json::Map<String, Value>,
}

impl InboundEnvelope {
    /// Case-insensitive header lookup, skipping blank values.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, v)| k.eq_ignore_ascii_case(name) && !v.trim().is_empty())
            .map(|(_, v)| v.trim())
    }

    /// True when this envelope was reconstructed from a DLQ record for replay.
    pub fn is_dlq_replay(&self) -> bool {
        self.source_meta.contains_key(DLQ_REPLAY_META_KEY)
    }

    /// DLQ record id this envelope is replaying, if any.
    pub fn dlq_replay_id(&self) -> Option<i64> {
        self.source_meta.get(DLQ_REPLAY_META_KEY).and_then(Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> InboundEnvelope {
        InboundEnvelope {
            kind: EnvelopeKind::Event,
            message_type: "visit.created".to_string(),
            payload: json!({"visitId": 42}),
            headers: HashMap::from([
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Request-Id".to_string(), "req-1".to_string()),
                ("Empty".to_string(), "   ".to_string()),
            ]),
            message_id: Some("m1".to_string()),
            correlation_id: Some("c1".to_string()),
            branch_id: None,
            user_id: None,
            source_meta: serde_json::Map::new(),
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let env = envelope();
        assert_eq!(env.header("content-type"), Some("application/json"));
        assert_eq!(env.header("X-REQUEST-ID"), Some("req-1"));
        assert_eq!(env.header("missing"), None);
    }

    #[test]
    fn blank_header_values_are_skipped() {
        let env = envelope();
        assert_eq!(env.header("Empty"), None);
    }

    #[test]
    fn replay_marker_detection() {
        let mut env = envelope();
        assert!(!env.is_dlq_replay());
        assert_eq!(env.dlq_replay_id(), None);

        env.source_meta
            .insert(DLQ_REPLAY_META_KEY.to_string(), json!(17));
        assert!(env.is_dlq_replay());
        assert_eq!(env.dlq_replay_id(), Some(17));
    }

    #[test]
    fn kind_round_trip() {
        assert_eq!(EnvelopeKind::from_str("EVENT"), EnvelopeKind::Event);
        assert_eq!(EnvelopeKind::from_str("command"), EnvelopeKind::Command);
        // Unknown defaults to Event
        assert_eq!(EnvelopeKind::from_str("other"), EnvelopeKind::Event);
        assert_eq!(EnvelopeKind::Command.as_str(), "COMMAND");
    }

    #[test]
    fn serde_uses_wire_names() {
        let env = envelope();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["kind"], "EVENT");
        assert_eq!(value["type"], "visit.created");
        assert_eq!(value["messageId"], "m1");

        let parsed: InboundEnvelope = serde_json::from_value(json!({
            "kind": "COMMAND",
            "type": "ticket.call.requested",
            "payload": {"ticket": "A-1"},
        }))
        .unwrap();
        assert_eq!(parsed.kind, EnvelopeKind::Command);
        assert_eq!(parsed.message_type, "ticket.call.requested");
        assert!(parsed.headers.is_empty());
        assert_eq!(parsed.message_id, None);
    }
}
