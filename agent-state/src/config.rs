//! Tracker configuration
//!
//! Every optional behavior of the tracker is enumerated here and fixed at
//! construction. Sources, lowest precedence first: `Default`, a TOML file,
//! `AGENT_STATE_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Whether façade writes serialize on agent locks or use optimistic CAS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    /// Transitions and data updates run under an exclusive lock.
    #[default]
    Enabled,
    /// Writes use bounded compare-and-swap retries; checkpoint and rollback
    /// still lock internally.
    Disabled,
}

/// TTL read cache over committed agent data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            max_entries: 1024,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// zlib compression of persisted snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// zlib level, 0-9.
    pub level: u32,
    /// Payloads smaller than this are stored uncompressed.
    pub min_size_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: 6,
            min_size_bytes: 1024,
        }
    }
}

/// Durable snapshot settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Bound on each backend call.
    pub timeout_ms: u64,
    /// History entries kept per snapshot (most recent).
    pub history_cap: usize,
    /// Expiry handed to the backend, if any.
    pub ttl_secs: Option<u64>,
    pub key_prefix: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            history_cap: 50,
            ttl_secs: None,
            key_prefix: "agent_state".to_string(),
        }
    }
}

impl PersistenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// Configuration of one `AgentStateTracker`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub locking: LockingMode,
    /// Default wait bound for lock acquisition.
    pub lock_timeout_ms: u64,
    /// Locks not released within their lease are treated as released.
    pub lock_lease_ms: u64,
    /// Attempts per façade write when locking is disabled.
    pub max_cas_retries: u32,
    pub cache: Option<CacheConfig>,
    pub compression: Option<CompressionConfig>,
    pub persistence: PersistenceConfig,
    /// Broadcast channel capacity of the event bus.
    pub event_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            locking: LockingMode::Enabled,
            lock_timeout_ms: 3_000,
            lock_lease_ms: 30_000,
            max_cas_retries: 16,
            cache: None,
            compression: None,
            persistence: PersistenceConfig::default(),
            event_capacity: 256,
        }
    }
}

impl TrackerConfig {
    pub fn with_locking(mut self, locking: LockingMode) -> Self {
        self.locking = locking;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> StateResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| StateError::validation(format!("invalid tracker config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            StateError::validation(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    /// Defaults overlaid with `AGENT_STATE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Overlay variables from `lookup`. Unparseable values are ignored.
    pub fn overlay_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(val) = lookup("AGENT_STATE_LOCKING") {
            match val.to_lowercase().as_str() {
                "enabled" | "true" | "1" => self.locking = LockingMode::Enabled,
                "disabled" | "false" | "0" => self.locking = LockingMode::Disabled,
                _ => {}
            }
        }
        if let Some(ms) = parsed("AGENT_STATE_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = ms;
        }
        if let Some(ms) = parsed("AGENT_STATE_LOCK_LEASE_MS") {
            self.lock_lease_ms = ms;
        }
        if let Some(n) = parsed("AGENT_STATE_MAX_CAS_RETRIES") {
            self.max_cas_retries = n.min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = parsed("AGENT_STATE_CACHE_TTL_MS") {
            self.cache.get_or_insert_with(CacheConfig::default).ttl_ms = ms;
        }
        if let Some(level) = parsed("AGENT_STATE_COMPRESSION_LEVEL") {
            self.compression
                .get_or_insert_with(CompressionConfig::default)
                .level = level.min(9) as u32;
        }
        if let Some(ms) = parsed("AGENT_STATE_PERSIST_TIMEOUT_MS") {
            self.persistence.timeout_ms = ms;
        }
        if let Some(cap) = parsed("AGENT_STATE_HISTORY_CAP") {
            self.persistence.history_cap = cap as usize;
        }
        if let Some(ttl) = parsed("AGENT_STATE_TTL_SECS") {
            self.persistence.ttl_secs = Some(ttl);
        }
        if let Some(prefix) = lookup("AGENT_STATE_KEY_PREFIX") {
            self.persistence.key_prefix = prefix;
        }

        self
    }

    /// Reject settings the tracker cannot operate with.
    pub fn validate(&self) -> StateResult<()> {
        if self.lock_timeout_ms == 0 {
            return Err(StateError::validation("lock_timeout_ms must be positive"));
        }
        if self.lock_lease_ms == 0 {
            return Err(StateError::validation("lock_lease_ms must be positive"));
        }
        if self.max_cas_retries == 0 {
            return Err(StateError::validation("max_cas_retries must be positive"));
        }
        if self.persistence.timeout_ms == 0 {
            return Err(StateError::validation("persistence.timeout_ms must be positive"));
        }
        if self.persistence.history_cap == 0 {
            return Err(StateError::validation("persistence.history_cap must be positive"));
        }
        if self.persistence.key_prefix.is_empty() {
            return Err(StateError::validation("persistence.key_prefix must not be empty"));
        }
        if self.event_capacity == 0 {
            return Err(StateError::validation("event_capacity must be positive"));
        }
        if let Some(cache) = &self.cache {
            if cache.ttl_ms == 0 || cache.max_entries == 0 {
                return Err(StateError::validation(
                    "cache ttl_ms and max_entries must be positive",
                ));
            }
        }
        if let Some(compression) = &self.compression {
            if compression.level > 9 {
                return Err(StateError::validation("compression level must be 0-9"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.locking, LockingMode::Enabled);
        assert_eq!(config.lock_timeout(), Duration::from_secs(3));
        assert_eq!(config.persistence.history_cap, 50);
        assert!(config.cache.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml_partial() {
        let config = TrackerConfig::from_toml_str(
            r#"
            locking = "disabled"
            lock_timeout_ms = 500

            [cache]
            ttl_ms = 1000

            [compression]
            min_size_bytes = 64

            [persistence]
            history_cap = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.locking, LockingMode::Disabled);
        assert_eq!(config.lock_timeout_ms, 500);
        assert_eq!(config.cache.as_ref().unwrap().ttl_ms, 1000);
        assert_eq!(config.cache.as_ref().unwrap().max_entries, 1024);
        assert_eq!(config.compression.as_ref().unwrap().level, 6);
        assert_eq!(config.persistence.history_cap, 10);
        assert_eq!(config.persistence.timeout_ms, 5_000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = TrackerConfig::from_toml_str("lock_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, StateError::Validation { .. }));

        let err = TrackerConfig::from_toml_str("[persistence]\nhistory_cap = 0").unwrap_err();
        assert!(matches!(err, StateError::Validation { .. }));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("AGENT_STATE_LOCKING", "disabled"),
            ("AGENT_STATE_LOCK_TIMEOUT_MS", "250"),
            ("AGENT_STATE_CACHE_TTL_MS", "100"),
            ("AGENT_STATE_HISTORY_CAP", "not-a-number"),
            ("AGENT_STATE_KEY_PREFIX", "test"),
        ]
        .into_iter()
        .collect();

        let config = TrackerConfig::default()
            .overlay_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.locking, LockingMode::Disabled);
        assert_eq!(config.lock_timeout_ms, 250);
        assert_eq!(config.cache.unwrap().ttl_ms, 100);
        assert_eq!(config.persistence.history_cap, 50);
        assert_eq!(config.persistence.key_prefix, "test");
    }
}
