//! Shared types for the integration broker core.
//!
//! This crate provides:
//! - InboundEnvelope: the normalized contract every ingress channel maps to
//! - Sensitive-data sanitizer for headers and diagnostic text

mod envelope;
mod sanitizer;

pub use envelope::{EnvelopeKind, InboundEnvelope, DLQ_REPLAY_META_KEY};
pub use sanitizer::{sanitize_headers, sanitize_text, MASK};
