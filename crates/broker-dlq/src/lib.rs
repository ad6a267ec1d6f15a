//! Inbound dead-letter store.
//!
//! Persists inbound messages whose processing failed, with attempt counters
//! and everything needed to reconstruct the original envelope for replay.
//! Replay is always operator- or API-triggered, never automatic: automatic
//! retry storms on systemic failures are worse than a growing table.

mod error;
mod store;

pub use error::{DlqError, DlqResult};
pub use store::{DlqFull, DlqListFilter, InboundDlqStore};
