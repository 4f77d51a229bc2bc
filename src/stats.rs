//! Performance counters
//!
//! In-process counters back `get_performance_stats()`; every update is also
//! forwarded to the `metrics` facade so an installed exporter sees it.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Smoothing factor of the response time moving average
const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Default)]
pub struct MemoryMetrics {
    reads: AtomicU64,
    writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    avg_response_ms: Mutex<Option<f64>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed retrieve
    pub fn record_read(&self, cache_hit: bool, elapsed: Duration) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("recalldb_reads_total").increment(1);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("recalldb_cache_hits_total").increment(1);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("recalldb_cache_misses_total").increment(1);
        }
        self.observe("retrieve", elapsed);
    }

    /// Record a completed store
    pub fn record_write(&self, elapsed: Duration) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("recalldb_writes_total").increment(1);
        self.observe("store", elapsed);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Hits over all lookups, 0.0 before the first lookup
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = self.cache_hits();
        let total = hits + self.cache_misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn avg_response_ms(&self) -> f64 {
        self.avg_response_ms.lock().unwrap_or(0.0)
    }

    fn observe(&self, operation: &'static str, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        {
            let mut avg = self.avg_response_ms.lock();
            *avg = Some(match *avg {
                Some(prev) => EMA_ALPHA * ms + (1.0 - EMA_ALPHA) * prev,
                None => ms,
            });
        }
        ::metrics::histogram!("recalldb_operation_duration_seconds", "operation" => operation)
            .record(elapsed.as_secs_f64());
    }
}

/// Snapshot returned by `get_performance_stats()`
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceStats {
    pub reads: u64,
    pub writes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
    pub cache_size: usize,
    pub pending_ops: usize,
    pub avg_response_time_ms: f64,
    pub pool_size: usize,
    pub pool_available: usize,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub dropped_operations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = MemoryMetrics::new();
        assert_eq!(metrics.cache_hit_ratio(), 0.0);

        metrics.record_read(true, Duration::from_millis(1));
        metrics.record_read(true, Duration::from_millis(1));
        metrics.record_read(false, Duration::from_millis(1));
        metrics.record_read(true, Duration::from_millis(1));

        assert_eq!(metrics.reads(), 4);
        assert_eq!(metrics.cache_hits(), 3);
        assert_eq!(metrics.cache_misses(), 1);
        assert_eq!(metrics.cache_hit_ratio(), 0.75);
    }

    #[test]
    fn test_moving_average() {
        let metrics = MemoryMetrics::new();
        assert_eq!(metrics.avg_response_ms(), 0.0);

        metrics.record_write(Duration::from_millis(10));
        assert!((metrics.avg_response_ms() - 10.0).abs() < 1e-9);

        metrics.record_write(Duration::from_millis(20));
        // 0.1 * 20 + 0.9 * 10
        assert!((metrics.avg_response_ms() - 11.0).abs() < 1e-9);
        assert_eq!(metrics.writes(), 2);
    }
}
