//! Read-write coordinator
//!
//! Many readers may hold the lock at once; a writer is exclusive. A waiting
//! writer blocks new readers so flushes cannot be starved by a steady stream
//! of retrievals.
//!
//! State lives behind one short `parking_lot` mutex. `tokio::sync::Notify`
//! plays the role of a condition variable: waiters register interest
//! *before* inspecting the state, so a release between the check and the
//! `.await` is never missed.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

/// Snapshot of coordinator occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinatorStatus {
    pub active_readers: usize,
    pub writer_active: bool,
    pub waiting_writers: usize,
}

pub struct RwCoordinator {
    state: Mutex<LockState>,
    changed: Notify,
    timeout: Option<Duration>,
}

impl RwCoordinator {
    /// `timeout` bounds every lock wait; `None` waits indefinitely
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            changed: Notify::new(),
            timeout,
        }
    }

    /// Shared access; waits while a writer holds or awaits the lock
    pub async fn read_lock(&self) -> Result<ReadGuard<'_>> {
        self.bounded("read", self.acquire_read()).await
    }

    /// Exclusive access; waits until no reader or writer holds the lock
    pub async fn write_lock(&self) -> Result<WriteGuard<'_>> {
        self.bounded("write", self.acquire_write()).await
    }

    pub fn status(&self) -> CoordinatorStatus {
        let state = self.state.lock();
        CoordinatorStatus {
            active_readers: state.readers,
            writer_active: state.writer,
            waiting_writers: state.waiting_writers,
        }
    }

    async fn bounded<T>(&self, kind: &'static str, acquire: impl Future<Output = T>) -> Result<T> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| Error::LockTimeout(kind)),
            None => Ok(acquire.await),
        }
    }

    async fn acquire_read(&self) -> ReadGuard<'_> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if !state.writer && state.waiting_writers == 0 {
                    state.readers += 1;
                    trace!(readers = state.readers, "Read lock acquired");
                    return ReadGuard { coordinator: self };
                }
            }

            notified.await;
        }
    }

    async fn acquire_write(&self) -> WriteGuard<'_> {
        let mut claim = WriterClaim::register(self);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if !state.writer && state.readers == 0 {
                    state.writer = true;
                    state.waiting_writers -= 1;
                    claim.fulfilled = true;
                    trace!("Write lock acquired");
                    return WriteGuard { coordinator: self };
                }
            }

            notified.await;
        }
    }
}

/// A writer's place in line. Dropping it unfulfilled (timeout or
/// cancellation) withdraws the claim and lets blocked readers through.
struct WriterClaim<'a> {
    coordinator: &'a RwCoordinator,
    fulfilled: bool,
}

impl<'a> WriterClaim<'a> {
    fn register(coordinator: &'a RwCoordinator) -> Self {
        coordinator.state.lock().waiting_writers += 1;
        Self {
            coordinator,
            fulfilled: false,
        }
    }
}

impl Drop for WriterClaim<'_> {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.coordinator.state.lock().waiting_writers -= 1;
            self.coordinator.changed.notify_waiters();
        }
    }
}

/// Shared lock, released on drop
pub struct ReadGuard<'a> {
    coordinator: &'a RwCoordinator,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.coordinator.state.lock();
            state.readers -= 1;
            state.readers == 0
        };
        if last {
            self.coordinator.changed.notify_waiters();
        }
    }
}

/// Exclusive lock, released on drop
pub struct WriteGuard<'a> {
    coordinator: &'a RwCoordinator,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.state.lock().writer = false;
        self.coordinator.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_readers_share_the_lock() -> Result<()> {
        let coordinator = RwCoordinator::new(Some(Duration::from_secs(1)));
        let first = coordinator.read_lock().await?;
        let second = coordinator.read_lock().await?;
        assert_eq!(coordinator.status().active_readers, 2);

        drop(first);
        drop(second);
        assert_eq!(coordinator.status(), CoordinatorStatus::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_writer_waits_for_readers() -> Result<()> {
        let coordinator = Arc::new(RwCoordinator::new(None));
        let reader = coordinator.read_lock().await?;

        let acquired = Arc::new(AtomicBool::new(false));
        let writer = {
            let coordinator = Arc::clone(&coordinator);
            let acquired = Arc::clone(&acquired);
            tokio::spawn(async move {
                let _guard = coordinator.write_lock().await?;
                acquired.store(true, Ordering::SeqCst);
                Ok::<_, Error>(())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!acquired.load(Ordering::SeqCst));
        assert_eq!(coordinator.status().waiting_writers, 1);

        drop(reader);
        writer.await.unwrap()?;
        assert!(acquired.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_waiting_writer_blocks_new_readers() -> Result<()> {
        let coordinator = Arc::new(RwCoordinator::new(None));
        let reader = coordinator.read_lock().await?;

        let writer = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let guard = coordinator.write_lock().await?;
                drop(guard);
                Ok::<_, Error>(())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A new reader must queue behind the waiting writer
        let late = tokio::time::timeout(Duration::from_millis(50), coordinator.read_lock()).await;
        assert!(late.is_err());

        drop(reader);
        writer.await.unwrap()?;
        assert!(coordinator.read_lock().await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_write_lock_timeout_withdraws_claim() -> Result<()> {
        let coordinator = RwCoordinator::new(Some(Duration::from_millis(50)));
        let reader = coordinator.read_lock().await?;

        let err = coordinator.write_lock().await.err().expect("writer must time out");
        assert!(matches!(err, Error::LockTimeout("write")));
        assert_eq!(coordinator.status().waiting_writers, 0);

        // Readers are admitted again once the claim is withdrawn
        let another = coordinator.read_lock().await?;
        drop(another);
        drop(reader);
        Ok(())
    }

    #[tokio::test]
    async fn test_writer_never_overlaps_readers() -> Result<()> {
        let coordinator = Arc::new(RwCoordinator::new(None));
        let readers_inside = Arc::new(AtomicUsize::new(0));
        let writer_inside = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..24 {
            let coordinator = Arc::clone(&coordinator);
            let readers_inside = Arc::clone(&readers_inside);
            let writer_inside = Arc::clone(&writer_inside);
            let violations = Arc::clone(&violations);
            handles.push(tokio::spawn(async move {
                if i % 6 == 0 {
                    let _guard = coordinator.write_lock().await?;
                    writer_inside.store(true, Ordering::SeqCst);
                    if readers_inside.load(Ordering::SeqCst) > 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    writer_inside.store(false, Ordering::SeqCst);
                } else {
                    let _guard = coordinator.read_lock().await?;
                    readers_inside.fetch_add(1, Ordering::SeqCst);
                    if writer_inside.load(Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    readers_inside.fetch_sub(1, Ordering::SeqCst);
                }
                Ok::<_, Error>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap()?;
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.status(), CoordinatorStatus::default());
        Ok(())
    }
}
