//! Idempotency gate for inbound processing.
//!
//! This crate provides:
//! - Deterministic idempotency key derivation (strategy-prefixed SHA-256)
//! - IdempotencyGate: decides whether an inbound message is processed,
//!   skipped as a completed duplicate, or locked by a concurrent delivery
//!
//! A LOCKED decision is not a poison condition; it is the normal outcome of
//! concurrent delivery or parallel retries from upstream producers.

mod error;
mod gate;
mod key;

pub use error::{IdempotencyError, IdempotencyResult};
pub use gate::{Decision, GateDecision, IdempotencyGate};
pub use key::{derive_key, validate_provided_key};
