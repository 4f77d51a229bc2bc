//! Manager configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `RECALLDB_*` environment variables (e.g. `RECALLDB_MAX_CONNECTIONS=16`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What happens to the operations of a batch that failed to commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushFailurePolicy {
    /// Discard them (at-most-once). The failure is logged and counted.
    #[default]
    Drop,
    /// Put them back at the front of the pending list for the next flush.
    Requeue,
}

/// Configuration for [`crate::ConcurrentMemoryManager`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Connections created eagerly by `initialize()`
    pub min_connections: usize,

    /// Upper bound on live connections
    pub max_connections: usize,

    /// How long `acquire()` waits before failing with `PoolExhausted`
    pub acquire_timeout_ms: u64,

    /// Bound on read/write lock waits (0 waits forever)
    pub lock_timeout_ms: u64,

    /// SQLite busy handler timeout
    pub busy_timeout_ms: u64,

    /// Entry cache capacity (number of entries)
    pub cache_max_size: usize,

    /// Default time-to-live of cached entries
    pub cache_ttl_secs: u64,

    /// Pending operations that trigger a flush
    pub batch_size: usize,

    /// Maximum delay between flushes
    pub flush_interval_ms: u64,

    /// Run a background task that flushes when the interval elapses
    pub background_flush: bool,

    /// Worker threads for serialization and compression
    pub codec_threads: usize,

    pub flush_failure_policy: FlushFailurePolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/recalldb/memory.db"),
            min_connections: 2,
            max_connections: 10,
            acquire_timeout_ms: 5_000,
            lock_timeout_ms: 30_000,
            busy_timeout_ms: 5_000,
            cache_max_size: 1_000,
            cache_ttl_secs: 3_600,
            batch_size: 100,
            flush_interval_ms: 1_000,
            background_flush: true,
            codec_threads: 4,
            flush_failure_policy: FlushFailurePolicy::Drop,
        }
    }
}

impl ManagerConfig {
    /// Default settings pointing at `database_path`
    pub fn new<P: AsRef<Path>>(database_path: P) -> Self {
        Self {
            database_path: database_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load defaults, then `file` (if any), then `RECALLDB_*` environment variables
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&Self::default())
            .map_err(|e| Error::Config(format!("Failed to encode defaults: {}", e)))?;

        let mut builder = ::config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("RECALLDB")
                .prefix_separator("_")
                .try_parsing(true),
        );

        let loaded: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the components cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.cache_max_size == 0 {
            return Err(Error::Config("cache_max_size must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.codec_threads == 0 {
            return Err(Error::Config("codec_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_ms > 0).then(|| Duration::from_millis(self.lock_timeout_ms))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(config.lock_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.flush_failure_policy, FlushFailurePolicy::Drop);
    }

    #[test]
    fn test_zero_lock_timeout_disables_bound() {
        let config = ManagerConfig {
            lock_timeout_ms: 0,
            ..ManagerConfig::default()
        };
        assert_eq!(config.lock_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_inverted_pool_bounds() {
        let config = ManagerConfig {
            min_connections: 8,
            max_connections: 4,
            ..ManagerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_toml_file() -> Result<()> {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .map_err(|e| Error::Internal(e.to_string()))?;
        writeln!(
            file,
            "database_path = \"/tmp/recall.db\"\nmax_connections = 3\nmin_connections = 1\nflush_failure_policy = \"requeue\""
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let config = ManagerConfig::load(Some(file.path()))?;
        assert_eq!(config.database_path, PathBuf::from("/tmp/recall.db"));
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.flush_failure_policy, FlushFailurePolicy::Requeue);
        // Untouched keys keep their defaults
        assert_eq!(config.batch_size, 100);
        Ok(())
    }

    #[test]
    fn test_config_roundtrips_through_toml() {
        let config = ManagerConfig::new("memory.db");
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ManagerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.database_path, PathBuf::from("memory.db"));
        assert_eq!(parsed.cache_max_size, config.cache_max_size);
    }
}
