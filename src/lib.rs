// RecallDB - Concurrent access layer for assistant memory stores
// Pooled SQLite connections, a TTL+LRU entry cache and batched writes

#![warn(rust_2018_idioms)]

pub mod backend;
pub mod codec;
pub mod config;
pub mod entry;
pub mod manager;
pub mod stats;
pub mod storage;

// Re-exports for convenience
pub use backend::MemoryBackend;
pub use config::{FlushFailurePolicy, ManagerConfig};
pub use entry::{Entry, RetrieveOptions, StoreOptions};
pub use manager::{ConcurrentMemoryManager, ManagerState};
pub use stats::PerformanceStats;
pub use storage::FlushReport;

/// RecallDB error types
pub mod error {
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Connection pool exhausted: no connection available within {0:?}")]
        PoolExhausted(Duration),

        #[error("Connection pool is closed")]
        PoolClosed,

        #[error("Timed out acquiring {0} lock")]
        LockTimeout(&'static str),

        #[error("Serialization failure: {0}")]
        SerializationFailure(String),

        #[error("Flush failed for {operations} pending operation(s): {reason}")]
        FlushFailure { operations: usize, reason: String },

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Memory manager is not initialized")]
        NotInitialized,

        #[error("Memory manager is closed")]
        Closed,

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl From<rusqlite::Error> for Error {
        fn from(e: rusqlite::Error) -> Self {
            Error::Storage(e.to_string())
        }
    }

    impl From<serde_json::Error> for Error {
        fn from(e: serde_json::Error) -> Self {
            Error::SerializationFailure(e.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::Error;
    use std::time::Duration;

    #[test]
    fn test_error_messages() {
        let err = Error::PoolExhausted(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));

        let err = Error::FlushFailure {
            operations: 3,
            reason: "disk I/O error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Flush failed for 3 pending operation(s): disk I/O error"
        );
    }

    #[test]
    fn test_rusqlite_error_maps_to_storage() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::Storage(_)));
    }
}
