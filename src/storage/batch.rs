//! Batch writer
//!
//! Pending writes accumulate in memory and are committed as one transaction
//! once the batch is full or the flush interval has elapsed.
//!
//! # Architecture
//!
//! ```text
//! add_operation(op) ──→ pending: [Insert, Insert, UpdateAccess, ...]
//!                          │ len >= batch_size || interval elapsed
//!                          ▼
//! flush: write lock ──→ connection ──→ BEGIN
//!                                        ├─→ multi-row INSERT (all inserts)
//!                                        ├─→ multi-row UPDATE (coalesced access updates)
//!                                        └─→ COMMIT
//! ```
//!
//! Flushes are serialized, so batches commit in the order they were queued.

use super::coordinator::RwCoordinator;
use super::pool::ConnectionPool;
use super::sqlite::{self, AccessUpdate};
use crate::config::FlushFailurePolicy;
use crate::entry::Entry;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A queued write awaiting the next flush
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOperation {
    /// Persist a new entry
    Insert(Entry),
    /// Record a read of an existing entry
    UpdateAccess {
        entry_id: String,
        accessed_at: DateTime<Utc>,
    },
}

/// Outcome of a successful flush
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Operations drained from the pending list
    pub operations: usize,
    pub inserted: usize,
    /// Rows touched by access updates (after coalescing)
    pub updated: usize,
    pub duration: Duration,
}

/// Batch writer counters
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub flushes: u64,
    pub failed_flushes: u64,
    pub dropped_operations: u64,
    pub requeued_operations: u64,
    pub last_flush_size: usize,
}

/// Settings for [`BatchWriter`]
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub failure_policy: FlushFailurePolicy,
}

struct PendingState {
    operations: Vec<PendingOperation>,
    // Drained by a flush that has not finished yet
    in_flight: Option<Arc<Batch>>,
    last_flush: Instant,
}

/// A drained batch, grouped by operation kind
struct Batch {
    inserts: Vec<Entry>,
    updates: Vec<AccessUpdate>,
    operations: usize,
}

impl Batch {
    fn group(operations: Vec<PendingOperation>) -> Self {
        let count = operations.len();
        let mut inserts = Vec::new();
        let mut access: HashMap<String, (DateTime<Utc>, u64)> = HashMap::new();

        for op in operations {
            match op {
                PendingOperation::Insert(entry) => inserts.push(entry),
                PendingOperation::UpdateAccess {
                    entry_id,
                    accessed_at,
                } => {
                    let slot = access.entry(entry_id).or_insert((accessed_at, 0));
                    slot.0 = slot.0.max(accessed_at);
                    slot.1 += 1;
                }
            }
        }

        let updates = access
            .into_iter()
            .map(|(entry_id, (accessed_at, hits))| AccessUpdate {
                entry_id,
                accessed_at,
                hits,
            })
            .collect();

        Self {
            inserts,
            updates,
            operations: count,
        }
    }

    /// Expand back into pending operations, one per recorded access
    fn into_operations(self) -> Vec<PendingOperation> {
        let mut ops: Vec<PendingOperation> =
            self.inserts.into_iter().map(PendingOperation::Insert).collect();
        for update in self.updates {
            for _ in 0..update.hits {
                ops.push(PendingOperation::UpdateAccess {
                    entry_id: update.entry_id.clone(),
                    accessed_at: update.accessed_at,
                });
            }
        }
        ops
    }
}

pub struct BatchWriter {
    pending: Mutex<PendingState>,
    flush_lock: tokio::sync::Mutex<()>,
    pool: ConnectionPool,
    coordinator: Arc<RwCoordinator>,
    options: BatchOptions,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    dropped_operations: AtomicU64,
    requeued_operations: AtomicU64,
    last_flush_size: AtomicUsize,
}

impl BatchWriter {
    pub fn new(pool: ConnectionPool, coordinator: Arc<RwCoordinator>, options: BatchOptions) -> Self {
        Self {
            pending: Mutex::new(PendingState {
                operations: Vec::new(),
                in_flight: None,
                last_flush: Instant::now(),
            }),
            flush_lock: tokio::sync::Mutex::new(()),
            pool,
            coordinator,
            options,
            flushes: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            dropped_operations: AtomicU64::new(0),
            requeued_operations: AtomicU64::new(0),
            last_flush_size: AtomicUsize::new(0),
        }
    }

    /// Queue an operation, flushing inline when a threshold is reached.
    ///
    /// Returns whether a flush was triggered.
    pub async fn add_operation(self: &Arc<Self>, op: PendingOperation) -> Result<bool> {
        if self.enqueue(op) {
            self.flush().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Queue an operation without flushing. Returns whether a flush is due.
    pub fn enqueue(&self, op: PendingOperation) -> bool {
        let mut pending = self.pending.lock();
        pending.operations.push(op);
        ::metrics::gauge!("recalldb_pending_operations").set(pending.operations.len() as f64);
        self.is_due(&pending)
    }

    /// Flush unconditionally
    pub async fn force_flush(self: &Arc<Self>) -> Result<FlushReport> {
        self.flush().await
    }

    /// Flush if the interval elapsed and anything is pending
    pub async fn flush_if_due(self: &Arc<Self>) -> Result<Option<FlushReport>> {
        let due = {
            let pending = self.pending.lock();
            !pending.operations.is_empty() && self.is_due(&pending)
        };
        if due {
            self.flush().await.map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().operations.len()
    }

    /// Newest queued or in-flight insert for `key`, if any
    pub fn latest_pending_insert(&self, key: &str) -> Option<Entry> {
        let pending = self.pending.lock();
        let queued = pending.operations.iter().rev().find_map(|op| match op {
            PendingOperation::Insert(entry) if entry.key == key => Some(entry),
            _ => None,
        });
        let flushing = || {
            pending
                .in_flight
                .as_ref()
                .and_then(|batch| batch.inserts.iter().rev().find(|entry| entry.key == key))
        };
        queued.or_else(flushing).cloned()
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            dropped_operations: self.dropped_operations.load(Ordering::Relaxed),
            requeued_operations: self.requeued_operations.load(Ordering::Relaxed),
            last_flush_size: self.last_flush_size.load(Ordering::Relaxed),
        }
    }

    fn is_due(&self, pending: &PendingState) -> bool {
        pending.operations.len() >= self.options.batch_size
            || pending.last_flush.elapsed() >= self.options.flush_interval
    }

    /// Drain and commit on a spawned task, so a cancelled caller never
    /// abandons a drained batch.
    async fn flush(self: &Arc<Self>) -> Result<FlushReport> {
        let writer = Arc::clone(self);
        tokio::spawn(async move { writer.drain_and_commit().await })
            .await
            .map_err(|e| Error::Internal(format!("Flush task failed: {}", e)))?
    }

    async fn drain_and_commit(&self) -> Result<FlushReport> {
        let _serial = self.flush_lock.lock().await;
        let started = Instant::now();

        let batch = {
            let mut pending = self.pending.lock();
            pending.last_flush = Instant::now();
            if pending.operations.is_empty() {
                None
            } else {
                let batch = Arc::new(Batch::group(std::mem::take(&mut pending.operations)));
                pending.in_flight = Some(Arc::clone(&batch));
                Some(batch)
            }
        };
        ::metrics::gauge!("recalldb_pending_operations").set(0.0);
        let Some(batch) = batch else {
            return Ok(FlushReport::default());
        };

        let committed = self.commit(Arc::clone(&batch)).await;
        self.pending.lock().in_flight = None;
        match committed {
            Ok((inserted, updated)) => {
                let report = FlushReport {
                    operations: batch.operations,
                    inserted,
                    updated,
                    duration: started.elapsed(),
                };
                self.flushes.fetch_add(1, Ordering::Relaxed);
                self.last_flush_size.store(batch.operations, Ordering::Relaxed);
                ::metrics::counter!("recalldb_flushes_total").increment(1);
                ::metrics::histogram!("recalldb_flush_duration_seconds")
                    .record(report.duration.as_secs_f64());
                debug!(
                    operations = report.operations,
                    inserted,
                    updated,
                    elapsed_ms = report.duration.as_millis(),
                    "Batch flushed"
                );
                Ok(report)
            }
            Err(e) => Err(self.handle_failure(batch, e)),
        }
    }

    async fn commit(&self, batch: Arc<Batch>) -> Result<(usize, usize)> {
        let _write = self.coordinator.write_lock().await?;
        let mut conn = self.pool.acquire().await?;
        conn.interact(move |conn| {
            let tx = conn.transaction()?;
            let inserted = sqlite::insert_entries(&tx, &batch.inserts)?;
            let updated = sqlite::apply_access_updates(&tx, &batch.updates)?;
            tx.commit()?;
            Ok((inserted, updated))
        })
        .await
    }

    fn handle_failure(&self, batch: Arc<Batch>, cause: Error) -> Error {
        let operations = batch.operations;
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("recalldb_flush_failures_total").increment(1);

        match self.options.failure_policy {
            FlushFailurePolicy::Drop => {
                self.dropped_operations
                    .fetch_add(operations as u64, Ordering::Relaxed);
                error!(operations, error = %cause, "Batch flush failed, operations dropped");
            }
            FlushFailurePolicy::Requeue => {
                let restored = match Arc::try_unwrap(batch) {
                    Ok(batch) => batch.into_operations(),
                    Err(shared) => {
                        warn!("Failed batch still shared, requeueing a copy");
                        Batch {
                            inserts: shared.inserts.clone(),
                            updates: shared.updates.clone(),
                            operations: shared.operations,
                        }
                        .into_operations()
                    }
                };
                let mut pending = self.pending.lock();
                let newer = std::mem::take(&mut pending.operations);
                pending.operations = restored;
                pending.operations.extend(newer);
                self.requeued_operations
                    .fetch_add(operations as u64, Ordering::Relaxed);
                warn!(operations, error = %cause, "Batch flush failed, operations requeued");
            }
        }

        Error::FlushFailure {
            operations,
            reason: cause.to_string(),
        }
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().operations.len();
        if pending > 0 {
            info!(pending, "Batch writer dropped with unflushed operations");
        }
    }
}
