//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! ConcurrentMemoryManager
//!   ├─→ EntryCache      (TTL + LRU, in memory)
//!   ├─→ BatchWriter     (pending inserts / access updates)
//!   ├─→ RwCoordinator   (shared reads, exclusive flushes)
//!   └─→ ConnectionPool  (bounded SQLite connections)
//!         └─→ memory_entries table
//! ```
//!
//! Lock order is always coordinator first, then a pooled connection.

pub mod batch;
pub mod cache;
pub mod coordinator;
pub mod pool;
pub mod sqlite;

pub use batch::{BatchOptions, BatchStats, BatchWriter, FlushReport, PendingOperation};
pub use cache::{CacheStats, EntryCache};
pub use coordinator::{CoordinatorStatus, RwCoordinator};
pub use pool::{ConnectionPool, PoolOptions, PoolStatus, PooledConnection};
