//! Idempotency key derivation.

use crate::{IdempotencyError, IdempotencyResult};
use broker_config::IdempotencyStrategy;
use broker_core::InboundEnvelope;
use sha2::{Digest, Sha256};

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 hex of the canonical payload serialization.
///
/// `serde_json::Value` serializes object keys in sorted order, so equal
/// payloads hash equally regardless of the order they arrived in.
fn payload_hash(envelope: &InboundEnvelope) -> String {
    match serde_json::to_vec(&envelope.payload) {
        Ok(bytes) => sha256_hex(&bytes),
        Err(_) => String::new(),
    }
}

/// Derive the stored idempotency key for an envelope.
///
/// The chosen raw material is prefixed with the strategy name before
/// hashing, so two strategies can never collide on the same raw value, and
/// the stored key stays length-bounded.
pub fn derive_key(envelope: &InboundEnvelope, strategy: IdempotencyStrategy) -> String {
    let raw = match strategy {
        IdempotencyStrategy::MessageId => envelope.message_id.clone().unwrap_or_default(),
        IdempotencyStrategy::CorrelationId => envelope.correlation_id.clone().unwrap_or_default(),
        IdempotencyStrategy::PayloadHash => payload_hash(envelope),
        IdempotencyStrategy::Auto => {
            let message_id = envelope.message_id.as_deref().unwrap_or("").trim();
            if !message_id.is_empty() {
                message_id.to_string()
            } else {
                let correlation_id = envelope.correlation_id.as_deref().unwrap_or("").trim();
                if !correlation_id.is_empty() {
                    correlation_id.to_string()
                } else {
                    payload_hash(envelope)
                }
            }
        }
    };

    let material = format!("{}:{}", strategy.as_str(), raw);
    sha256_hex(material.as_bytes())
}

/// Validate a client-provided idempotency key, if any.
///
/// A key may arrive in the `Idempotency-Key`/`X-Idempotency-Key` header or
/// as `idempotencyKey` in source meta, and must then match the
/// `source:flow:externalId` shape: three non-empty segments, no further
/// colons, no whitespace. Absence is fine (the derived key is used either
/// way; a malformed key is a client error caught before any store write.
pub fn validate_provided_key(envelope: &InboundEnvelope) -> IdempotencyResult<()> {
    let provided = resolve_provided_key(envelope);
    let Some(provided) = provided else {
        return Ok(());
    };

    let segments: Vec<&str> = provided.split(':').collect();
    let well_formed = segments.len() == 3
        && segments
            .iter()
            .all(|s| !s.is_empty() && !s.contains(char::is_whitespace));

    if well_formed {
        Ok(())
    } else {
        Err(IdempotencyError::InvalidProvidedKey(provided))
    }
}

fn resolve_provided_key(envelope: &InboundEnvelope) -> Option<String> {
    if let Some(value) = envelope
        .header("Idempotency-Key")
        .or_else(|| envelope.header("X-Idempotency-Key"))
    {
        return Some(value.to_string());
    }

    envelope
        .source_meta
        .get("idempotencyKey")
        .or_else(|| envelope.source_meta.get("idempotency_key"))
        .map(|v| match v.as_str() {
            Some(s) => s.trim().to_string(),
            None => v.to_string(),
        })
}
