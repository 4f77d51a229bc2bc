//! SQLite backing store: schema, tuning and batched statements

use crate::entry::Entry;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Rows per multi-row statement, keeping bound parameters well below
/// SQLite's variable limit
const ROWS_PER_STATEMENT: usize = 500;

const ENTRY_COLUMNS: &str = "entry_id, key, value_blob, memory_type, priority, created_at, \
     accessed_at, access_count, ttl_seconds, tags_json, size_bytes, compressed";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS memory_entries (
        entry_id     TEXT PRIMARY KEY,
        key          TEXT NOT NULL,
        value_blob   BLOB NOT NULL,
        memory_type  TEXT NOT NULL,
        priority     INTEGER NOT NULL,
        created_at   INTEGER NOT NULL,
        accessed_at  INTEGER NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 0,
        ttl_seconds  REAL,
        tags_json    TEXT NOT NULL DEFAULT '[]',
        size_bytes   INTEGER NOT NULL,
        compressed   INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_memory_entries_key ON memory_entries(key);
    CREATE INDEX IF NOT EXISTS idx_memory_entries_type ON memory_entries(memory_type);
    CREATE INDEX IF NOT EXISTS idx_memory_entries_accessed ON memory_entries(accessed_at);
    CREATE INDEX IF NOT EXISTS idx_memory_entries_priority ON memory_entries(priority);
";

/// One coalesced access-metadata update
#[derive(Debug, Clone, PartialEq)]
pub struct AccessUpdate {
    pub entry_id: String,
    pub accessed_at: DateTime<Utc>,
    pub hits: u64,
}

pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
}

/// Apply performance pragmas. These are hints: failures are logged, not returned.
pub fn apply_tuning(conn: &Connection, busy_timeout: Duration) {
    if let Err(e) = conn.busy_timeout(busy_timeout) {
        warn!(error = %e, "Failed to set busy timeout");
    }
    match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    }) {
        Ok(mode) => debug!(journal_mode = %mode, "Journal mode set"),
        Err(e) => warn!(error = %e, "Failed to enable WAL journaling"),
    }
    for (pragma, value) in [("synchronous", "NORMAL"), ("temp_store", "MEMORY")] {
        if let Err(e) = conn.pragma_update(None, pragma, value) {
            warn!(pragma, error = %e, "Failed to apply pragma");
        }
    }
    if let Err(e) = conn.pragma_update(None, "cache_size", -64_000i64) {
        warn!(pragma = "cache_size", error = %e, "Failed to apply pragma");
    }
    if let Err(e) =
        conn.pragma_update_and_check(None, "mmap_size", 268_435_456i64, |row| row.get::<_, i64>(0))
    {
        warn!(pragma = "mmap_size", error = %e, "Failed to apply pragma");
    }
}

/// Create the entries table and its indexes
pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Insert entries with multi-row `INSERT` statements
pub fn insert_entries(tx: &Transaction<'_>, entries: &[Entry]) -> Result<usize> {
    let mut inserted = 0;
    for chunk in entries.chunks(ROWS_PER_STATEMENT) {
        let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
        let sql = format!(
            "INSERT INTO memory_entries ({}) VALUES {}",
            ENTRY_COLUMNS, placeholders
        );

        let mut values: Vec<SqlValue> = Vec::with_capacity(chunk.len() * 12);
        for entry in chunk {
            let tags_json = serde_json::to_string(&entry.tags)?;
            values.extend([
                SqlValue::Text(entry.entry_id.clone()),
                SqlValue::Text(entry.key.clone()),
                SqlValue::Blob(entry.value.clone()),
                SqlValue::Text(entry.memory_type.clone()),
                SqlValue::Integer(i64::from(entry.priority)),
                SqlValue::Integer(to_micros(entry.created_at)),
                SqlValue::Integer(to_micros(entry.accessed_at)),
                SqlValue::Integer(entry.access_count as i64),
                entry
                    .ttl
                    .map(|ttl| SqlValue::Real(ttl.as_secs_f64()))
                    .unwrap_or(SqlValue::Null),
                SqlValue::Text(tags_json),
                SqlValue::Integer(entry.size_bytes as i64),
                SqlValue::Integer(i64::from(entry.compressed)),
            ]);
        }

        inserted += tx.execute(&sql, params_from_iter(values.iter()))?;
    }
    Ok(inserted)
}

/// Apply coalesced access updates with multi-row `UPDATE` statements
///
/// `accessed_at` only moves forward; `access_count` grows by `hits`.
pub fn apply_access_updates(tx: &Transaction<'_>, updates: &[AccessUpdate]) -> Result<usize> {
    let mut updated = 0;
    for chunk in updates.chunks(ROWS_PER_STATEMENT) {
        let placeholders = vec!["(?, ?, ?)"; chunk.len()].join(", ");
        let sql = format!(
            "WITH updates(entry_id, accessed_at, hits) AS (VALUES {})
             UPDATE memory_entries
             SET accessed_at = MAX(accessed_at,
                     (SELECT u.accessed_at FROM updates u WHERE u.entry_id = memory_entries.entry_id)),
                 access_count = access_count +
                     (SELECT u.hits FROM updates u WHERE u.entry_id = memory_entries.entry_id)
             WHERE entry_id IN (SELECT entry_id FROM updates)",
            placeholders
        );

        let mut values: Vec<SqlValue> = Vec::with_capacity(chunk.len() * 3);
        for update in chunk {
            values.extend([
                SqlValue::Text(update.entry_id.clone()),
                SqlValue::Integer(to_micros(update.accessed_at)),
                SqlValue::Integer(update.hits as i64),
            ]);
        }

        updated += tx.execute(&sql, params_from_iter(values.iter()))?;
    }
    Ok(updated)
}

/// Most recently accessed entry for `key` (newest insert wins ties)
pub fn latest_entry(conn: &Connection, key: &str) -> Result<Option<Entry>> {
    let sql = format!(
        "SELECT {} FROM memory_entries WHERE key = ?1
         ORDER BY accessed_at DESC, rowid DESC LIMIT 1",
        ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let entry = stmt.query_row(params![key], row_to_entry).optional()?;
    Ok(entry)
}

/// Delete entries whose TTL elapsed before `now`
pub fn delete_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM memory_entries
         WHERE ttl_seconds IS NOT NULL
           AND created_at + CAST(ttl_seconds * 1000000 AS INTEGER) <= ?1",
        params![to_micros(now)],
    )?;
    Ok(deleted)
}

/// Number of persisted entries (all versions)
pub fn count_entries(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM memory_entries", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// Persisted entries whose TTL has elapsed at `now`
pub fn count_expired(conn: &Connection, now: DateTime<Utc>) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memory_entries
         WHERE ttl_seconds IS NOT NULL
           AND created_at + CAST(ttl_seconds * 1000000 AS INTEGER) <= ?1",
        params![to_micros(now)],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Row counts of the backing table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct EntryCounts {
    pub total: u64,
    /// Not yet purged
    pub expired: u64,
}

pub fn entry_counts(conn: &Connection, now: DateTime<Utc>) -> Result<EntryCounts> {
    Ok(EntryCounts {
        total: count_entries(conn)?,
        expired: count_expired(conn, now)?,
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let created_at: i64 = row.get(5)?;
    let accessed_at: i64 = row.get(6)?;
    let ttl_seconds: Option<f64> = row.get(8)?;
    let tags_json: String = row.get(9)?;

    let tags: BTreeSet<String> = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Entry {
        entry_id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        memory_type: row.get(3)?,
        priority: row.get(4)?,
        created_at: from_micros(created_at)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(5, created_at))?,
        accessed_at: from_micros(accessed_at)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, accessed_at))?,
        access_count: row.get::<_, i64>(7)? as u64,
        ttl: ttl_seconds.and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        tags,
        size_bytes: row.get::<_, i64>(10)? as usize,
        compressed: row.get(11)?,
    })
}
