//! Messaging provider seam.
//!
//! Adding a broker backend (Kafka, RabbitMQ, NATS, ...) means implementing
//! [`MessagingProvider`] and registering it by id; the core never changes.
//! The `logging` provider ships as the safe default so development and
//! closed environments work without an external broker.

use async_trait::async_trait;
use broker_core::{sanitize_headers, sanitize_text};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Normalized message ready for an external broker.
///
/// The payload is a JSON string; providers decide how to map it onto their
/// wire format.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub destination: String,
    pub message_key: Option<String>,
    pub headers: HashMap<String, String>,
    pub payload_json: String,
    pub correlation_id: Option<String>,
    pub source_message_id: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Result of one send attempt.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl SendResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_code: None,
            error_message: None,
        }
    }

    /// Failed send. Code and message are sanitized on the way in so provider
    /// implementations cannot leak secrets into stored error fields.
    pub fn fail(code: &str, message: &str) -> Self {
        Self {
            success: false,
            error_code: Some(sanitize_text(code)),
            error_message: Some(sanitize_text(message)),
        }
    }
}

/// Provider availability report.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub ok: bool,
    pub message: Option<String>,
}

impl ProviderHealth {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: None,
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            ok: false,
            message: Some(sanitize_text(message)),
        }
    }
}

/// Outbound broker backend.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Provider id, e.g. `kafka`, `rabbitmq`, `nats`, `logging`.
    fn id(&self) -> &str;

    /// Send one message.
    async fn send(&self, message: &OutboundMessage) -> SendResult;

    /// Lightweight availability probe. Real brokers should override this
    /// with a connection check that sends no business messages.
    async fn health_check(&self) -> ProviderHealth {
        ProviderHealth::ok()
    }
}

/// Id-keyed provider registry with a guaranteed `logging` fallback.
pub struct MessagingProviderRegistry {
    by_id: HashMap<String, Arc<dyn MessagingProvider>>,
}

impl MessagingProviderRegistry {
    /// Build a registry. The `logging` provider is added automatically when
    /// no registered provider claims that id.
    pub fn new(providers: Vec<Arc<dyn MessagingProvider>>) -> Self {
        let mut by_id: HashMap<String, Arc<dyn MessagingProvider>> = HashMap::new();
        for provider in providers {
            let id = provider.id().trim().to_string();
            if !id.is_empty() {
                by_id.insert(id, provider);
            }
        }
        by_id
            .entry("logging".to_string())
            .or_insert_with(|| Arc::new(LoggingMessagingProvider));
        Self { by_id }
    }

    /// Get a provider by id, falling back to `logging` for unknown ids so a
    /// misconfigured provider never breaks dispatch.
    pub fn get(&self, id: &str) -> Arc<dyn MessagingProvider> {
        self.by_id
            .get(id.trim())
            .or_else(|| self.by_id.get("logging"))
            .cloned()
            .expect("logging provider is always registered")
    }

    /// Get a provider strictly by id.
    pub fn get_exact(&self, id: &str) -> Option<Arc<dyn MessagingProvider>> {
        self.by_id.get(id.trim()).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id.trim())
    }

    /// Registered provider ids.
    pub fn ids(&self) -> Vec<String> {
        self.by_id.keys().cloned().collect()
    }
}

impl Default for MessagingProviderRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// The `logging` provider: pretends to send and writes a safe log line.
///
/// Header values and payload content never reach the log, only key names
/// and sizes.
pub struct LoggingMessagingProvider;

#[async_trait]
impl MessagingProvider for LoggingMessagingProvider {
    fn id(&self) -> &str {
        "logging"
    }

    async fn send(&self, message: &OutboundMessage) -> SendResult {
        let safe_headers = sanitize_headers(&message.headers);
        let mut header_keys: Vec<&String> = safe_headers.keys().collect();
        header_keys.sort();

        info!(
            destination = %message.destination,
            correlation_id = message.correlation_id.as_deref().unwrap_or(""),
            source_message_id = message.source_message_id.as_deref().unwrap_or(""),
            header_keys = ?header_keys,
            payload_size = message.payload_json.len(),
            "Messaging send (logging provider)"
        );
        SendResult::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider {
        id: &'static str,
    }

    #[async_trait]
    impl MessagingProvider for StubProvider {
        fn id(&self) -> &str {
            self.id
        }

        async fn send(&self, _message: &OutboundMessage) -> SendResult {
            SendResult::fail("STUB", "always fails")
        }
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            destination: "events.visits".to_string(),
            message_key: None,
            headers: HashMap::new(),
            payload_json: "{}".to_string(),
            correlation_id: Some("c1".to_string()),
            source_message_id: Some("m1".to_string()),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn registry_falls_back_to_logging() {
        let registry = MessagingProviderRegistry::new(vec![Arc::new(StubProvider { id: "kafka" })]);

        assert_eq!(registry.get("kafka").id(), "kafka");
        assert_eq!(registry.get("unknown").id(), "logging");
        assert_eq!(registry.get("").id(), "logging");
        assert!(registry.contains("kafka"));
        assert!(registry.contains("logging"));
        assert!(registry.get_exact("unknown").is_none());
    }

    #[tokio::test]
    async fn registered_logging_provider_is_not_overwritten() {
        let registry =
            MessagingProviderRegistry::new(vec![Arc::new(StubProvider { id: "logging" })]);
        // The stub claimed "logging", so it stays.
        let result = registry.get("logging").send(&message()).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn logging_provider_accepts_everything() {
        let result = LoggingMessagingProvider.send(&message()).await;
        assert!(result.success);
        assert!(LoggingMessagingProvider.health_check().await.ok);
    }

    #[test]
    fn send_result_sanitizes_failure_text() {
        let result = SendResult::fail("E", "denied for Bearer secret-token");
        assert!(result.error_message.unwrap().contains("Bearer ***"));
    }
}
