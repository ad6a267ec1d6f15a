//! Runtime-togglable outbound dry-run switch.

use std::sync::RwLock;
use tracing::info;

/// Outbound dry-run state.
///
/// When dry-run is effective, direct sends and both dispatch loops are
/// suppressed. The configured default comes from startup configuration; an
/// operator override can be set and reset at runtime without a restart.
pub struct DryRunState {
    configured_default: bool,
    override_value: RwLock<Option<bool>>,
}

impl DryRunState {
    pub fn new(configured_default: bool) -> Self {
        Self {
            configured_default,
            override_value: RwLock::new(None),
        }
    }

    /// Effective dry-run flag: the override wins over the configured default.
    pub fn is_dry_run(&self) -> bool {
        self.override_value
            .read()
            .expect("dry-run lock poisoned")
            .unwrap_or(self.configured_default)
    }

    pub fn configured_default(&self) -> bool {
        self.configured_default
    }

    pub fn override_value(&self) -> Option<bool> {
        *self.override_value.read().expect("dry-run lock poisoned")
    }

    /// Set the runtime override.
    pub fn set_override(&self, enabled: bool) {
        info!(enabled, "Outbound dry-run override set");
        *self.override_value.write().expect("dry-run lock poisoned") = Some(enabled);
    }

    /// Clear the override, falling back to the configured default.
    pub fn reset_override(&self) {
        info!("Outbound dry-run override reset");
        *self.override_value.write().expect("dry-run lock poisoned") = None;
    }
}

impl Default for DryRunState {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_configured_default() {
        assert!(!DryRunState::new(false).is_dry_run());
        assert!(DryRunState::new(true).is_dry_run());
    }

    #[test]
    fn override_wins_and_resets() {
        let state = DryRunState::new(false);
        state.set_override(true);
        assert!(state.is_dry_run());
        assert_eq!(state.override_value(), Some(true));

        state.reset_override();
        assert!(!state.is_dry_run());
        assert_eq!(state.override_value(), None);

        let state = DryRunState::new(true);
        state.set_override(false);
        assert!(!state.is_dry_run());
        assert!(state.configured_default());
    }
}
