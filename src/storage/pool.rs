//! Bounded SQLite connection pool
//!
//! # Architecture
//!
//! ```text
//! acquire() ──→ Semaphore(max_connections) ──→ idle queue ──→ PooledConnection
//!                    │ timeout → PoolExhausted        │ empty → open new connection
//!                    │ closed  → PoolClosed           │
//!                    ▼                                ▼
//!              permit held by guard        returned to idle queue on drop
//! ```
//!
//! A permit is held for as long as a connection is borrowed or busy on a
//! blocking thread, so at most `max_connections` connections are ever live. Connections are only opened
//! when the idle queue is empty.

use super::sqlite;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Pool sizing and timeouts
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub path: PathBuf,
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStatus {
    /// Live connections (idle + borrowed)
    pub size: usize,
    /// Idle connections ready for reuse
    pub available: usize,
    pub in_use: usize,
    pub max_size: usize,
}

/// Cloneable handle to a shared connection pool
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    options: PoolOptions,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Connection>,
    size: usize,
    closed: bool,
}

impl ConnectionPool {
    /// Create a pool. No connection is opened until `warm_up()` or `acquire()`.
    pub fn new(options: PoolOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_connections));
        Self {
            inner: Arc::new(PoolInner {
                options,
                permits,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.options.path
    }

    /// Eagerly open connections until `min_connections` exist
    pub async fn warm_up(&self) -> Result<()> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                if state.size >= self.inner.options.min_connections {
                    break;
                }
                state.size += 1;
            }

            let reservation = SlotReservation::new(&self.inner);
            let conn = self.inner.open_connection().await?;
            self.inner.state.lock().idle.push_back(conn);
            reservation.fill();
        }

        info!(
            path = ?self.inner.options.path,
            connections = self.inner.options.min_connections,
            "Connection pool warmed up"
        );
        Ok(())
    }

    /// Borrow a connection, waiting at most `acquire_timeout`
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let started = Instant::now();
        let timeout = self.inner.options.acquire_timeout;

        let permit = match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                warn!(?timeout, "Connection pool exhausted");
                ::metrics::counter!("recalldb_pool_exhausted_total").increment(1);
                return Err(Error::PoolExhausted(timeout));
            }
        };

        let idle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            let idle = state.idle.pop_front();
            if idle.is_none() {
                // Reserve the slot before opening outside the lock
                state.size += 1;
            }
            idle
        };

        let conn = match idle {
            Some(conn) => conn,
            None => {
                let reservation = SlotReservation::new(&self.inner);
                let conn = self.inner.open_connection().await?;
                reservation.fill();
                conn
            }
        };

        ::metrics::histogram!("recalldb_pool_wait_seconds").record(started.elapsed().as_secs_f64());
        Ok(PooledConnection {
            lease: Some(Lease {
                conn: Some(conn),
                pool: Arc::clone(&self.inner),
                _permit: permit,
            }),
        })
    }

    /// Close every idle connection and refuse further acquisitions.
    ///
    /// Borrowed connections are closed when their guards drop.
    pub async fn close_all(&self) {
        self.inner.permits.close();
        let drained: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.size -= drained.len();
            drained
        };

        let count = drained.len();
        let closing = tokio::task::spawn_blocking(move || {
            for conn in drained {
                if let Err((_, e)) = conn.close() {
                    warn!(error = %e, "Failed to close connection cleanly");
                }
            }
        });
        if let Err(e) = closing.await {
            warn!(error = %e, "Connection close task failed");
        }

        info!(closed = count, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            size: state.size,
            available: state.idle.len(),
            in_use: state.size - state.idle.len(),
            max_size: self.inner.options.max_connections,
        }
    }
}

impl PoolInner {
    async fn open_connection(&self) -> Result<Connection> {
        let path = self.options.path.clone();
        let busy_timeout = self.options.busy_timeout;

        let opened = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Storage(format!("Failed to create database directory: {}", e))
                })?;
            }
            let conn = Connection::open(&path)?;
            sqlite::apply_tuning(&conn, busy_timeout);
            Ok(conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("Connection open task failed: {}", e)))??;

        debug!(path = ?self.options.path, "Opened connection");
        Ok(opened)
    }

    fn release(&self, conn: Connection) {
        let mut state = self.state.lock();
        if state.closed {
            state.size -= 1;
            drop(state);
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "Failed to close returned connection");
            }
        } else {
            state.idle.push_back(conn);
        }
    }

    fn discard(&self) {
        let mut state = self.state.lock();
        state.size -= 1;
        warn!(size = state.size, "Discarded lost connection");
    }
}

/// A slot counted in `size` while its connection is being opened.
///
/// Dropped unfilled (open failed or the caller went away), it gives the slot
/// back.
struct SlotReservation<'a> {
    pool: &'a PoolInner,
    filled: bool,
}

impl<'a> SlotReservation<'a> {
    fn new(pool: &'a PoolInner) -> Self {
        Self {
            pool,
            filled: false,
        }
    }

    fn fill(mut self) {
        self.filled = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.pool.state.lock().size -= 1;
        }
    }
}

/// A live connection and the permit admitting it.
///
/// Travels into the blocking thread with the connection, so the permit is
/// held for as long as the connection is in use there.
struct Lease {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    // Released after the connection is back in the idle queue
    _permit: OwnedSemaphorePermit,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if std::thread::panicking() {
                drop(conn);
                self.pool.discard();
            } else {
                self.pool.release(conn);
            }
        }
    }
}

/// Exclusively borrowed connection, returned to the pool on drop
pub struct PooledConnection {
    // None while `interact` runs or after it was cancelled
    lease: Option<Lease>,
}

impl PooledConnection {
    /// Run blocking SQLite work on the blocking thread pool.
    ///
    /// If the caller is cancelled mid-call the work still finishes and the
    /// connection returns to the pool afterwards. If the closure panics the
    /// connection is discarded and the pool shrinks.
    pub async fn interact<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut lease = self
            .lease
            .take()
            .ok_or_else(|| Error::Internal("Pooled connection already lost".to_string()))?;

        let (lease, result) = tokio::task::spawn_blocking(move || {
            let result = match lease.conn.as_mut() {
                Some(conn) => f(conn),
                None => Err(Error::Internal("Lease without a connection".to_string())),
            };
            (lease, result)
        })
        .await
        .map_err(|e| Error::Internal(format!("Connection task failed: {}", e)))?;

        self.lease = Some(lease);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options(dir: &tempfile::TempDir, min: usize, max: usize) -> PoolOptions {
        PoolOptions {
            path: dir.path().join("pool.db"),
            min_connections: min,
            max_connections: max,
            acquire_timeout: Duration::from_millis(200),
            busy_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_warm_up_creates_minimum() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(options(&dir, 2, 4));
        assert_eq!(pool.status().size, 0);

        pool.warm_up().await?;
        let status = pool.status();
        assert_eq!(status.size, 2);
        assert_eq!(status.available, 2);
        assert_eq!(status.in_use, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_connections_are_reused() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(options(&dir, 0, 4));

        for _ in 0..5 {
            let mut conn = pool.acquire().await?;
            let one: i64 = conn
                .interact(|c| Ok(c.query_row("SELECT 1", [], |row| row.get(0))?))
                .await?;
            assert_eq!(one, 1);
        }

        // Sequential borrowers share a single lazily created connection
        assert_eq!(pool.status().size, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(options(&dir, 0, 1));

        let held = pool.acquire().await?;
        let err = pool.acquire().await.err().expect("second acquire must fail");
        assert!(matches!(err, Error::PoolExhausted(_)));

        drop(held);
        assert!(pool.acquire().await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_never_exceeds_max_connections() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(&dir, 0, 3);
        opts.acquire_timeout = Duration::from_secs(5);
        let pool = ConnectionPool::new(opts);

        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _conn = pool.acquire().await?;
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, Error>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap()?;
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.status().size <= 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_all_rejects_acquire() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(options(&dir, 2, 2));
        pool.warm_up().await?;

        let borrowed = pool.acquire().await?;
        pool.close_all().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));

        // The borrowed connection is closed on return instead of re-queued
        drop(borrowed);
        assert_eq!(pool.status().size, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_open_releases_slot() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(options(&dir, 1, 2));

        // A zero timeout gives up while the connection is being opened
        for _ in 0..10 {
            let _ = tokio::time::timeout(Duration::ZERO, pool.warm_up()).await;
            let _ = tokio::time::timeout(Duration::ZERO, pool.acquire()).await;
            assert_eq!(pool.status().in_use, 0);
        }

        pool.warm_up().await?;
        let status = pool.status();
        assert!(status.size >= 1 && status.size <= 2);
        assert_eq!(status.in_use, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_interact_keeps_permit_until_done() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(&dir, 0, 1);
        opts.acquire_timeout = Duration::from_secs(5);
        let pool = ConnectionPool::new(opts);

        let mut conn = pool.acquire().await?;
        let gave_up = tokio::time::timeout(
            Duration::from_millis(20),
            conn.interact(|_| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            }),
        )
        .await;
        assert!(gave_up.is_err());
        drop(conn);

        // The connection is still busy on the blocking thread
        let early = tokio::time::timeout(Duration::from_millis(100), pool.acquire()).await;
        assert!(early.is_err());

        // Once the work ends the same connection is handed out again
        let mut conn = pool.acquire().await?;
        let one: i64 = conn
            .interact(|c| Ok(c.query_row("SELECT 1", [], |row| row.get(0))?))
            .await?;
        assert_eq!(one, 1);
        assert_eq!(pool.status().size, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_panicking_closure_discards_connection() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(options(&dir, 0, 2));

        let mut conn = pool.acquire().await?;
        let result: Result<()> = conn.interact(|_| panic!("boom")).await;
        assert!(matches!(result, Err(Error::Internal(_))));
        drop(conn);

        assert_eq!(pool.status().size, 0);
        assert!(pool.acquire().await.is_ok());
        Ok(())
    }
}
