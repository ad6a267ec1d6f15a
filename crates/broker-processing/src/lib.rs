//! Inbound processing orchestrator.
//!
//! This crate provides:
//! - ProcessingService: flow resolution -> idempotency gate -> flow
//!   execution -> outcome bookkeeping, with the dead-letter fallback
//! - The flow resolver/executor seams (the orchestration logic itself is an
//!   external collaborator)
//! - DlqReplayService: operator-triggered replay of dead letters

mod error;
mod flow;
mod replay;
mod service;

pub use error::{ProcessingError, ProcessingResult};
pub use flow::{ConfigFlowResolver, FlowExecutionError, FlowExecutor, FlowResolver};
pub use replay::{DlqReplayService, ReplayBatchReport, ReplayFilter, ReplayReport};
pub use service::{ProcessingOutcome, ProcessingReport, ProcessingService};
