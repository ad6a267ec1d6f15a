//! Logging initialization for broker services.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// The `RUST_LOG` environment variable takes precedence; otherwise the
/// provided default level applies to all broker crates.
///
/// # Example
///
/// ```ignore
/// init_logging("info");
/// tracing::info!("Broker started");
/// ```
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
