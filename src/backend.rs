//! Caller-facing storage abstraction
//!
//! Higher layers (semantic search, conversation memory) hold an
//! `Arc<dyn MemoryBackend>` instead of the concrete manager.

use crate::entry::StoreOptions;
use crate::error::Result;
use crate::manager::ConcurrentMemoryManager;
use crate::stats::PerformanceStats;
use crate::storage::FlushReport;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Store a value, returning the new entry id
    async fn store(&self, key: &str, value: Value, options: StoreOptions) -> Result<String>;

    /// Value for `key`, or `default` when absent
    async fn retrieve(&self, key: &str, default: Option<Value>) -> Result<Option<Value>>;

    /// Persist everything pending
    async fn flush(&self) -> Result<FlushReport>;

    fn stats(&self) -> PerformanceStats;
}

#[async_trait]
impl MemoryBackend for ConcurrentMemoryManager {
    async fn store(&self, key: &str, value: Value, options: StoreOptions) -> Result<String> {
        self.store_owned(key, value, options).await
    }

    async fn retrieve(&self, key: &str, default: Option<Value>) -> Result<Option<Value>> {
        ConcurrentMemoryManager::retrieve(self, key, default).await
    }

    async fn flush(&self) -> Result<FlushReport> {
        self.flush_all().await
    }

    fn stats(&self) -> PerformanceStats {
        self.get_performance_stats()
    }
}
