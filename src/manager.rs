//! Concurrent memory manager
//!
//! Façade over the connection pool, read-write coordinator, entry cache and
//! batch writer. One instance is shared (it is cheap to clone) by every task
//! that reads or writes memories.
//!
//! ```text
//! store(key, value)                 retrieve(key)
//!   │ encode (codec pool)             │ cache ──hit──→ value
//!   │ Insert → BatchWriter            │ miss
//!   │ write-through cache             │ pending insert? ──→ value
//!   ▼                                 │ read lock → connection → SELECT
//! entry_id                            │ UpdateAccess → BatchWriter
//!                                     ▼ repopulate cache → value
//! ```

use crate::codec::CodecPool;
use crate::config::{FlushFailurePolicy, ManagerConfig};
use crate::entry::{cache_key, Entry, RetrieveOptions, StoreOptions};
use crate::error::{Error, Result};
use crate::stats::{MemoryMetrics, PerformanceStats};
use crate::storage::sqlite::{self, EntryCounts};
use crate::storage::{
    BatchOptions, BatchWriter, ConnectionPool, EntryCache, FlushReport, PendingOperation,
    PoolOptions, PoolStatus, RwCoordinator,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Lifecycle of a [`ConcurrentMemoryManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initialized,
    Closed,
}

#[derive(Clone)]
pub struct ConcurrentMemoryManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    state: RwLock<ManagerState>,
    // Serializes initialize() and close(); holds the background ticker
    lifecycle: tokio::sync::Mutex<Option<FlushTicker>>,
    pool: ConnectionPool,
    coordinator: Arc<RwCoordinator>,
    cache: EntryCache<Value>,
    batch: Arc<BatchWriter>,
    codec: CodecPool,
    metrics: MemoryMetrics,
}

/// Background task flushing the batch writer once the interval elapses
struct FlushTicker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl FlushTicker {
    fn spawn(batch: Arc<BatchWriter>, flush_interval: Duration) -> Self {
        let period = (flush_interval / 2).max(Duration::from_millis(10));
        let (shutdown, mut stop) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        if let Err(e) = batch.flush_if_due().await {
                            warn!(error = %e, "Background flush failed");
                        }
                    }
                }
            }
            debug!("Flush ticker stopped");
        });

        Self { shutdown, handle }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Flush ticker ended abnormally");
        }
    }
}

impl ConcurrentMemoryManager {
    /// Build a manager without touching the database. Call `initialize()`
    /// before use.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let pool = ConnectionPool::new(PoolOptions {
            path: config.database_path.clone(),
            min_connections: config.min_connections,
            max_connections: config.max_connections,
            acquire_timeout: config.acquire_timeout(),
            busy_timeout: config.busy_timeout(),
        });
        let coordinator = Arc::new(RwCoordinator::new(config.lock_timeout()));
        let batch = Arc::new(BatchWriter::new(
            pool.clone(),
            Arc::clone(&coordinator),
            BatchOptions {
                batch_size: config.batch_size,
                flush_interval: config.flush_interval(),
                failure_policy: config.flush_failure_policy,
            },
        ));
        let default_ttl = Some(config.cache_ttl()).filter(|ttl| !ttl.is_zero());

        Ok(Self {
            inner: Arc::new(ManagerInner {
                cache: EntryCache::new(config.cache_max_size, default_ttl),
                codec: CodecPool::new(config.codec_threads)?,
                state: RwLock::new(ManagerState::Uninitialized),
                lifecycle: tokio::sync::Mutex::new(None),
                metrics: MemoryMetrics::new(),
                pool,
                coordinator,
                batch,
                config,
            }),
        })
    }

    /// `new()` followed by `initialize()`
    pub async fn open(config: ManagerConfig) -> Result<Self> {
        let manager = Self::new(config)?;
        manager.initialize().await?;
        Ok(manager)
    }

    /// Open the pool, create the schema and start background flushing.
    ///
    /// Calling it again on an initialized manager is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        let mut ticker = self.inner.lifecycle.lock().await;
        let state = *self.inner.state.read();
        match state {
            ManagerState::Initialized => return Ok(()),
            ManagerState::Closed => return Err(Error::Closed),
            ManagerState::Uninitialized => {}
        }

        self.inner.pool.warm_up().await?;
        {
            let mut conn = self.inner.pool.acquire().await?;
            conn.interact(|c| sqlite::create_schema(c)).await?;
        }

        if self.inner.config.background_flush {
            *ticker = Some(FlushTicker::spawn(
                Arc::clone(&self.inner.batch),
                self.inner.config.flush_interval(),
            ));
        }
        *self.inner.state.write() = ManagerState::Initialized;

        info!(
            path = ?self.inner.config.database_path,
            min_connections = self.inner.config.min_connections,
            max_connections = self.inner.config.max_connections,
            "Memory manager initialized"
        );
        Ok(())
    }

    /// Queue `value` under `key` and return the new entry id.
    ///
    /// The value is visible to `retrieve()` immediately; it reaches the
    /// database with the next flush. The JSON tree is built from the borrow
    /// on the calling task; byte encoding and compression run on the codec
    /// pool. `store_owned()` moves all of it to the pool.
    pub async fn store<T>(&self, key: &str, value: &T, options: StoreOptions) -> Result<String>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_ready()?;
        let started = Instant::now();

        let value = serde_json::to_value(value)?;
        let encoded = self.inner.codec.encode(value.clone(), options.compress).await?;
        self.queue_insert(key, value, encoded, options, started).await
    }

    /// `store()` for owned values, serialized entirely on the codec pool
    pub async fn store_owned<T>(&self, key: &str, value: T, options: StoreOptions) -> Result<String>
    where
        T: Serialize + Send + 'static,
    {
        self.ensure_ready()?;
        let started = Instant::now();

        let (value, encoded) = self.inner.codec.serialize(value, options.compress).await?;
        self.queue_insert(key, value, encoded, options, started).await
    }

    async fn queue_insert(
        &self,
        key: &str,
        value: Value,
        encoded: Vec<u8>,
        options: StoreOptions,
        started: Instant,
    ) -> Result<String> {
        let entry = Entry::new(key, encoded, options.compress, &options);
        let entry_id = entry.entry_id.clone();
        let size_bytes = entry.size_bytes;
        let slot = cache_key(key);

        if let Err(e) = self
            .inner
            .batch
            .add_operation(PendingOperation::Insert(entry))
            .await
        {
            match self.inner.config.flush_failure_policy {
                FlushFailurePolicy::Requeue => {
                    self.inner.cache.set(slot, value, options.ttl);
                }
                FlushFailurePolicy::Drop => {
                    self.inner.cache.remove(&slot);
                }
            }
            return Err(e);
        }

        self.inner.cache.set(slot, value, options.ttl);
        self.inner.metrics.record_write(started.elapsed());

        debug!(
            key,
            entry_id = %entry_id,
            size_bytes,
            compressed = options.compress,
            "Stored entry"
        );
        Ok(entry_id)
    }

    /// Value for `key`, or `default` when absent or expired
    pub async fn retrieve(&self, key: &str, default: Option<Value>) -> Result<Option<Value>> {
        self.retrieve_with(key, default, RetrieveOptions::default())
            .await
    }

    pub async fn retrieve_with(
        &self,
        key: &str,
        default: Option<Value>,
        options: RetrieveOptions,
    ) -> Result<Option<Value>> {
        self.ensure_ready()?;
        let started = Instant::now();
        let slot = cache_key(key);

        if let Some(value) = self.inner.cache.get(&slot) {
            self.inner.metrics.record_read(true, started.elapsed());
            debug!(key, "Cache hit");
            return Ok(Some(value));
        }

        let found = self.load(key, slot, options).await?;
        self.inner.metrics.record_read(false, started.elapsed());
        debug!(key, found = found.is_some(), "Cache miss");
        Ok(found.or(default))
    }

    /// Typed `retrieve()`; `None` when the key is absent
    pub async fn retrieve_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.retrieve(key, None).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Most recently accessed persisted entry for `key`, bypassing the cache
    pub async fn retrieve_entry(&self, key: &str) -> Result<Option<Entry>> {
        self.ensure_ready()?;
        self.load_latest(key).await
    }

    /// Commit every pending operation now
    pub async fn flush_all(&self) -> Result<FlushReport> {
        self.ensure_ready()?;
        self.inner.batch.force_flush().await
    }

    /// Delete persisted entries whose TTL has elapsed
    pub async fn purge_expired(&self) -> Result<usize> {
        self.ensure_ready()?;
        let _write = self.inner.coordinator.write_lock().await?;
        let mut conn = self.inner.pool.acquire().await?;
        let removed = conn
            .interact(|c| sqlite::delete_expired(c, Utc::now()))
            .await?;

        info!(removed, "Purged expired entries");
        Ok(removed)
    }

    /// Persisted row counts, including expired rows not yet purged
    pub async fn entry_counts(&self) -> Result<EntryCounts> {
        self.ensure_ready()?;
        let _read = self.inner.coordinator.read_lock().await?;
        let mut conn = self.inner.pool.acquire().await?;
        conn.interact(|c| sqlite::entry_counts(c, Utc::now())).await
    }

    /// Drop the cached slot for `key`
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.cache.remove(&cache_key(key))
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    pub fn get_performance_stats(&self) -> PerformanceStats {
        let metrics = &self.inner.metrics;
        let pool = self.inner.pool.status();
        let batch = self.inner.batch.stats();

        PerformanceStats {
            reads: metrics.reads(),
            writes: metrics.writes(),
            cache_hits: metrics.cache_hits(),
            cache_misses: metrics.cache_misses(),
            cache_hit_ratio: metrics.cache_hit_ratio(),
            cache_size: self.inner.cache.len(),
            pending_ops: self.inner.batch.pending_count(),
            avg_response_time_ms: metrics.avg_response_ms(),
            pool_size: pool.size,
            pool_available: pool.available,
            flushes: batch.flushes,
            failed_flushes: batch.failed_flushes,
            dropped_operations: batch.dropped_operations,
        }
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.read()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Stop background flushing, flush what is pending and release all
    /// connections.
    ///
    /// Cleanup always completes; a failed final flush is reported afterwards.
    pub async fn close(&self) -> Result<()> {
        let mut ticker = self.inner.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *self.inner.state.write(), ManagerState::Closed);
        if previous == ManagerState::Closed {
            return Ok(());
        }

        if let Some(ticker) = ticker.take() {
            ticker.stop().await;
        }

        let flushed = match previous {
            ManagerState::Initialized => self.inner.batch.force_flush().await.map(|report| {
                debug!(operations = report.operations, "Final flush complete");
            }),
            _ => Ok(()),
        };
        if let Err(e) = &flushed {
            warn!(error = %e, "Final flush failed");
        }

        self.inner.pool.close_all().await;
        self.inner.cache.clear();

        info!("Memory manager closed");
        flushed
    }

    fn ensure_ready(&self) -> Result<()> {
        match *self.inner.state.read() {
            ManagerState::Initialized => Ok(()),
            ManagerState::Uninitialized => Err(Error::NotInitialized),
            ManagerState::Closed => Err(Error::Closed),
        }
    }

    async fn load(
        &self,
        key: &str,
        slot: String,
        options: RetrieveOptions,
    ) -> Result<Option<Value>> {
        let now = Utc::now();

        // Queued but not yet flushed
        let entry = match self.inner.batch.latest_pending_insert(key) {
            Some(entry) => entry,
            None => match self.load_latest(key).await? {
                Some(entry) => entry,
                None => return Ok(None),
            },
        };

        if entry.is_expired(now) {
            debug!(key, entry_id = %entry.entry_id, "Entry expired");
            return Ok(None);
        }

        let ttl = remaining_ttl(&entry, now);
        let value = self
            .inner
            .codec
            .decode(entry.value, entry.compressed)
            .await?;

        if options.update_access {
            self.schedule_access_update(entry.entry_id);
        }
        self.inner.cache.set_if_absent(slot, value.clone(), ttl);
        Ok(Some(value))
    }

    async fn load_latest(&self, key: &str) -> Result<Option<Entry>> {
        let _read = self.inner.coordinator.read_lock().await?;
        let mut conn = self.inner.pool.acquire().await?;
        let key = key.to_string();
        conn.interact(move |c| sqlite::latest_entry(c, &key)).await
    }

    fn schedule_access_update(&self, entry_id: String) {
        let due = self.inner.batch.enqueue(PendingOperation::UpdateAccess {
            entry_id,
            accessed_at: Utc::now(),
        });
        if due {
            let batch = Arc::clone(&self.inner.batch);
            tokio::spawn(async move {
                if let Err(e) = batch.flush_if_due().await {
                    warn!(error = %e, "Flush after access update failed");
                }
            });
        }
    }
}

/// Time left before `entry` expires, for sizing its cache slot
fn remaining_ttl(entry: &Entry, now: DateTime<Utc>) -> Option<Duration> {
    entry.ttl.map(|ttl| {
        let age = (now - entry.created_at).to_std().unwrap_or(Duration::ZERO);
        ttl.saturating_sub(age)
    })
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(ticker) = self.lifecycle.get_mut().take() {
            let _ = ticker.shutdown.send(());
        }
        if *self.state.get_mut() == ManagerState::Initialized {
            warn!(
                pending = self.batch.pending_count(),
                "Memory manager dropped without close()"
            );
        }
    }
}
