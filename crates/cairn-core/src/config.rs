//! Runtime configuration
//!
//! Controls how lenient the runtime is when a store is requested with no
//! active session, and whether every mutation is traced.
//!
//! The configuration is per thread, matching the single-threaded execution
//! model of sessions and stores.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// What to do when a store is requested and no session is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingSessionPolicy {
    /// Emit a descriptive `tracing` warning, then fail with `NoActiveSession`
    Warn,
    /// Fail with `NoActiveSession` without logging
    Silent,
}

impl Default for MissingSessionPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            MissingSessionPolicy::Warn
        } else {
            MissingSessionPolicy::Silent
        }
    }
}

/// Configuration for the store runtime
///
/// # Example
///
/// ```
/// use cairn_core::{MissingSessionPolicy, RuntimeConfig};
///
/// let config = RuntimeConfig::from_ron("(missing_session: Silent, trace_mutations: true)").unwrap();
/// assert_eq!(config.missing_session, MissingSessionPolicy::Silent);
/// assert!(config.trace_mutations);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Policy applied by `active_session()` when nothing is active
    pub missing_session: MissingSessionPolicy,
    /// Emit a `trace!` event for every committed mutation
    pub trace_mutations: bool,
}

impl RuntimeConfig {
    /// Parse a configuration from RON text
    ///
    /// Missing fields take their default values.
    pub fn from_ron(text: &str) -> Result<Self> {
        ron::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize this configuration to RON text
    pub fn to_ron(&self) -> Result<String> {
        ron::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Builder-style policy override
    pub fn with_missing_session(mut self, policy: MissingSessionPolicy) -> Self {
        self.missing_session = policy;
        self
    }
}

thread_local! {
    static CONFIG: RefCell<RuntimeConfig> = RefCell::new(RuntimeConfig::default());
}

/// Replace the runtime configuration for the current thread
pub fn set_runtime_config(config: RuntimeConfig) {
    CONFIG.with(|c| *c.borrow_mut() = config);
}

/// Get a copy of the current thread's runtime configuration
pub fn runtime_config() -> RuntimeConfig {
    CONFIG.with(|c| c.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_follows_build_profile() {
        let config = RuntimeConfig::default();
        if cfg!(debug_assertions) {
            assert_eq!(config.missing_session, MissingSessionPolicy::Warn);
        } else {
            assert_eq!(config.missing_session, MissingSessionPolicy::Silent);
        }
        assert!(!config.trace_mutations);
    }

    #[test]
    fn test_ron_roundtrip() {
        let config = RuntimeConfig::default().with_missing_session(MissingSessionPolicy::Silent);
        let text = config.to_ron().unwrap();
        assert_eq!(RuntimeConfig::from_ron(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let config = RuntimeConfig::from_ron("(trace_mutations: true)").unwrap();
        assert!(config.trace_mutations);
        assert_eq!(config.missing_session, MissingSessionPolicy::default());
    }

    #[test]
    fn test_invalid_ron_is_config_error() {
        let err = RuntimeConfig::from_ron("(missing_session: Loud)").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_set_runtime_config() {
        set_runtime_config(RuntimeConfig {
            missing_session: MissingSessionPolicy::Silent,
            trace_mutations: true,
        });
        assert!(runtime_config().trace_mutations);
        set_runtime_config(RuntimeConfig::default());
        assert!(!runtime_config().trace_mutations);
    }
}
