//! SQLite persistence layer for the integration broker.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread
//! - Database migrations for the four reliability tables
//!   (idempotency, inbound DLQ, messaging outbox, HTTP outbox)
//! - Model types and status enums
//! - Query helpers, including the conditional status updates used as the
//!   broker's only cross-instance claim primitive
//!
//! # Architecture
//!
//! The `AsyncDatabase` uses a single dedicated thread for all SQLite
//! operations. Queries are sent through a channel and executed in FIFO
//! order:
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let due = db.call(|conn| queries::pick_due_messaging(conn, 50)).await?;
//! ```
//!
//! Only SQL should run inside `db.call()`; network calls and heavy
//! computation happen outside, or they starve every other query.

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::run_migrations;
pub use models::*;
