//! Runtime configuration for the integration broker.
//!
//! This crate provides:
//! - Configuration types with conservative defaults (`RuntimeConfig` and
//!   the per-component sections)
//! - `RuntimeConfigStore`: an injected handle holding the effective
//!   configuration snapshot, replaceable at runtime
//! - `DryRunState`: runtime-togglable outbound dry-run switch
//! - Logging initialization

mod dry_run;
mod error;
mod logging;
mod runtime;
mod store;

pub use dry_run::DryRunState;
pub use error::{ConfigError, ConfigResult};
pub use logging::init_logging;
pub use runtime::{
    ConnectorAuth, ConnectorAuthType, ConnectorConfig, DispatcherConfig, FlowConfig,
    FlowSelector, HttpOutboxConfig, IdempotencyConfig, IdempotencyStrategy, InboundDlqConfig,
    MessagingOutboxConfig, OutboxMode, RuntimeConfig,
};
pub use store::RuntimeConfigStore;
