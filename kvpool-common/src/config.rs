//! # Configuration
//!
//! Purpose: Describe the tunables of the pool, the scheduler and the gate in
//! one serde document with sensible defaults.
//!
//! ## Design Principles
//! 1. **Defaults First**: Every field has a default; an empty document is valid.
//! 2. **Plain Units**: Durations are stored as milliseconds for readable JSON.
//! 3. **Validate Once**: Loading rejects values the runtime cannot honour.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::PoolKey;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvPoolConfig {
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub gate: GateConfig,
}

impl KvPoolConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: KvPoolConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Rejects values that would stall the scheduler or the gate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("pool.endpoint must not be empty".to_string()));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.tick_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.gate.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "gate.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default endpoint and idle timeout used for pooled handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Endpoint descriptor, e.g. "127.0.0.1:6379".
    pub endpoint: String,
    /// Idle timeout in milliseconds; 0 disables idle expiry.
    pub idle_timeout_ms: u64,
}

impl PoolConfig {
    /// Idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Pool key for the configured endpoint and timeout.
    pub fn key(&self) -> PoolKey {
        PoolKey::new(self.endpoint.clone(), self.idle_timeout())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            endpoint: "127.0.0.1:6379".to_string(),
            idle_timeout_ms: 60_000,
        }
    }
}

/// Round-robin scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Timer period in milliseconds.
    pub tick_interval_ms: u64,
    /// Start the timer thread on first registration.
    ///
    /// When false the owner drives `tick` by hand.
    pub auto_start: bool,
    /// Thread name prefix for drain jobs.
    pub drain_thread_name: String,
}

impl SchedulerConfig {
    /// Timer period as a `Duration`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_interval_ms: 1,
            auto_start: true,
            drain_thread_name: "kvpool-drain".to_string(),
        }
    }
}

/// Mutual-exclusion gate settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Poll interval used by blocking and async waits, in milliseconds.
    pub poll_interval_ms: u64,
}

impl GateConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig { poll_interval_ms: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = KvPoolConfig::from_json_str("{}").unwrap();
        assert_eq!(config, KvPoolConfig::default());
        assert_eq!(config.scheduler.tick_interval(), Duration::from_millis(1));
        assert!(config.scheduler.auto_start);
    }

    #[test]
    fn partial_document_overrides_fields() {
        let raw = r#"{ "pool": { "endpoint": "cache:6380", "idle_timeout_ms": 100 } }"#;
        let config = KvPoolConfig::from_json_str(raw).unwrap();
        assert_eq!(
            config.pool.key(),
            PoolKey::new("cache:6380", Duration::from_millis(100))
        );
        assert_eq!(config.gate, GateConfig::default());
    }

    #[test]
    fn zero_tick_interval_is_rejected() {
        let raw = r#"{ "scheduler": { "tick_interval_ms": 0 } }"#;
        let err = KvPoolConfig::from_json_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = KvPoolConfig::from_json_str("{ pool: ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
