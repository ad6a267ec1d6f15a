//! Runtime configuration store.

use crate::{ConfigResult, RuntimeConfig};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Holds the effective configuration snapshot.
///
/// Readers take a cheap `Arc` clone of the current snapshot; a config reload
/// replaces the snapshot atomically, so in-flight processing keeps the
/// revision it started with.
pub struct RuntimeConfigStore {
    current: RwLock<Arc<RuntimeConfig>>,
}

impl RuntimeConfigStore {
    /// Create a store with the given initial configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config.normalize())),
        }
    }

    /// Load the initial configuration from a JSON file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&content)?;
        info!(path = %path.display(), revision = %config.revision, "Loaded runtime config");
        Ok(Self::new(config))
    }

    /// Current effective configuration snapshot.
    pub fn effective(&self) -> Arc<RuntimeConfig> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Install a new configuration revision.
    pub fn replace(&self, config: RuntimeConfig) {
        let config = Arc::new(config.normalize());
        info!(revision = %config.revision, "Runtime config replaced");
        *self.current.write().expect("config lock poisoned") = config;
    }
}

impl Default for RuntimeConfigStore {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}
