//! Runtime configuration types.
//!
//! The structure is deliberately conservative: every section has safe
//! defaults so a partial config file still yields a working broker, and
//! `normalize()` clamps operator-provided numbers into sane ranges.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Effective broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Revision label of this configuration (shown in processing meta).
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Flow definitions, matched by kind + type.
    #[serde(default)]
    pub flows: Vec<FlowConfig>,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub inbound_dlq: InboundDlqConfig,
    #[serde(default)]
    pub messaging_outbox: MessagingOutboxConfig,
    #[serde(default)]
    pub http_outbox: HttpOutboxConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// HTTP connectors by id. Secrets live here only; they are resolved at
    /// send time and never written to outbox rows.
    #[serde(default)]
    pub connectors: HashMap<String, ConnectorConfig>,
}

fn default_revision() -> String {
    "unknown".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            revision: default_revision(),
            flows: Vec::new(),
            idempotency: IdempotencyConfig::default(),
            inbound_dlq: InboundDlqConfig::default(),
            messaging_outbox: MessagingOutboxConfig::default(),
            http_outbox: HttpOutboxConfig::default(),
            dispatcher: DispatcherConfig::default(),
            connectors: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Clamp operator-provided numbers into workable ranges.
    pub fn normalize(mut self) -> Self {
        self.idempotency.lock_ttl_sec = self.idempotency.lock_ttl_sec.max(1);
        self.inbound_dlq.max_attempts = self.inbound_dlq.max_attempts.clamp(1, 100);
        self.messaging_outbox.normalize_limits();
        self.http_outbox.base.normalize_limits();
        self.dispatcher.interval_ms = self.dispatcher.interval_ms.max(100);
        self
    }

    /// Index of enabled flows keyed by `"KIND:type"`; first definition wins.
    pub fn flow_index(&self) -> HashMap<String, &FlowConfig> {
        let mut index = HashMap::new();
        for flow in self.flows.iter().filter(|f| f.enabled) {
            index
                .entry(format!("{}:{}", flow.selector.kind, flow.selector.message_type))
                .or_insert(flow);
        }
        index
    }

    /// Look up a connector by id.
    pub fn connector(&self, id: &str) -> Option<&ConnectorConfig> {
        self.connectors.get(id.trim())
    }
}

/// Flow definition: what to run for a matching inbound message.
///
/// The execution itself lives behind the flow-executor seam; the broker core
/// only needs the selector and opaque metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub selector: FlowSelector,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

/// Selector matching an inbound envelope to a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSelector {
    /// `EVENT` or `COMMAND`.
    pub kind: String,
    /// Message type, e.g. `visit.created`.
    #[serde(rename = "type")]
    pub message_type: String,
}

/// Idempotency key derivation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStrategy {
    MessageId,
    CorrelationId,
    PayloadHash,
    #[default]
    Auto,
}

impl IdempotencyStrategy {
    /// Name used both as the stored strategy column and the key prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageId => "MESSAGE_ID",
            Self::CorrelationId => "CORRELATION_ID",
            Self::PayloadHash => "PAYLOAD_HASH",
            Self::Auto => "AUTO",
        }
    }
}

/// Idempotency gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: IdempotencyStrategy,
    /// How long an in-progress lock is honored before it may be reclaimed.
    #[serde(default = "default_lock_ttl_sec")]
    pub lock_ttl_sec: i64,
}

fn default_lock_ttl_sec() -> i64 {
    60
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: IdempotencyStrategy::Auto,
            lock_ttl_sec: 60,
        }
    }
}

/// Inbound dead-letter settings.
///
/// Enabled by default: in closed environments losing messages is worse than
/// growing a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundDlqConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_true")]
    pub sanitize_headers: bool,
}

impl Default for InboundDlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            sanitize_headers: true,
        }
    }
}

/// Outbox delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxMode {
    /// Try direct delivery first; enqueue only on failure.
    #[default]
    OnFailure,
    /// Always enqueue durably; the dispatcher does every delivery.
    Always,
}

/// Messaging outbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingOutboxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: OutboxMode,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_base_delay_sec")]
    pub base_delay_sec: i64,
    #[serde(default = "default_max_delay_sec")]
    pub max_delay_sec: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

fn default_max_attempts() -> i64 {
    10
}

fn default_base_delay_sec() -> i64 {
    5
}

fn default_max_delay_sec() -> i64 {
    600
}

fn default_batch_size() -> i64 {
    50
}

impl Default for MessagingOutboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: OutboxMode::OnFailure,
            max_attempts: 10,
            base_delay_sec: 5,
            max_delay_sec: 600,
            batch_size: 50,
        }
    }
}

impl MessagingOutboxConfig {
    pub(crate) fn normalize_limits(&mut self) {
        self.max_attempts = self.max_attempts.max(1);
        self.base_delay_sec = self.base_delay_sec.max(1);
        self.max_delay_sec = self.max_delay_sec.max(self.base_delay_sec);
        self.batch_size = self.batch_size.clamp(1, 200);
    }
}

/// HTTP outbox settings: the shared queue knobs plus the idempotency header
/// name and the 4xx-as-success set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpOutboxConfig {
    #[serde(flatten)]
    pub base: MessagingOutboxConfig,
    /// Header carrying the idempotency key to the downstream system.
    #[serde(default = "default_idempotency_header_name")]
    pub idempotency_header_name: String,
    /// Comma-separated 4xx status codes treated as logical success
    /// (e.g. `409` for "already exists" semantics).
    #[serde(default = "default_treat_4xx_as_success")]
    pub treat_4xx_as_success: String,
}

fn default_idempotency_header_name() -> String {
    "Idempotency-Key".to_string()
}

fn default_treat_4xx_as_success() -> String {
    "409".to_string()
}

impl Default for HttpOutboxConfig {
    fn default() -> Self {
        Self {
            base: MessagingOutboxConfig::default(),
            idempotency_header_name: "Idempotency-Key".to_string(),
            treat_4xx_as_success: "409".to_string(),
        }
    }
}

/// Dispatcher polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    2000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 2000,
        }
    }
}

/// HTTP connector: base URL plus authentication, resolved at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth: ConnectorAuth,
}

/// Connector authentication. Values here are sensitive: they must never be
/// logged or written into outbox rows.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorAuth {
    #[serde(rename = "type", default)]
    pub auth_type: ConnectorAuthType,
    /// Header name for `API_KEY_HEADER`; defaults to `X-API-Key`.
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub basic_username: Option<String>,
    #[serde(default)]
    pub basic_password: Option<String>,
    /// OAuth2 client-credentials parameters.
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

/// Connector authentication kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorAuthType {
    #[default]
    None,
    Basic,
    Bearer,
    ApiKeyHeader,
    Oauth2ClientCredentials,
}

fn default_true() -> bool {
    true
}
