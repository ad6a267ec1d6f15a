//! Durable outbound delivery for the integration broker.
//!
//! This crate provides:
//! - MessagingOutbox / HttpOutbox: durable queues of outbound intents with
//!   ALWAYS / ON_FAILURE admission and operator replay
//! - MessagingProvider registry with a no-op-safe `logging` default
//! - HttpSender with connector-based auth resolved at send time
//! - OutboxDispatcher: the polling loop that claims due records and applies
//!   backoff / dead-letter policy
//!
//! Concurrency safety comes from the store's `pending -> sending`
//! conditional update, never from in-process locks, so any number of broker
//! instances can dispatch against the same database.

mod dispatcher;
mod error;
mod http;
mod messaging;
mod provider;
mod sender;

pub use dispatcher::{compute_next_attempt, OutboxDispatcher};
pub use error::{OutboxError, OutboxResult};
pub use http::{HttpCall, HttpOutbox};
pub use messaging::{MessagingOutbox, MessagingPublish};
pub use provider::{
    LoggingMessagingProvider, MessagingProvider, MessagingProviderRegistry, OutboundMessage,
    ProviderHealth, SendResult,
};
pub use sender::{
    build_url, ConnectorAuthResolver, HttpSendOutcome, HttpSender, ReqwestHttpSender,
};
