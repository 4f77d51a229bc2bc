//! Memory entries and per-call options

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Memory type used when the caller does not specify one
pub const DEFAULT_MEMORY_TYPE: &str = "general";

/// Cache key for the latest value of `key`
pub fn cache_key(key: &str) -> String {
    format!("entry:{}", key)
}

/// A persisted memory entry
///
/// `value` holds the encoded payload (JSON, zstd-compressed when
/// `compressed` is set). A key may have many historical entries; lookups
/// resolve to the most recently accessed one.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub entry_id: String,
    pub key: String,
    pub value: Vec<u8>,
    pub memory_type: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub ttl: Option<Duration>,
    pub tags: BTreeSet<String>,
    pub size_bytes: usize,
    pub compressed: bool,
}

impl Entry {
    /// Build a fresh entry with a new id for an encoded payload
    pub fn new(key: &str, value: Vec<u8>, compressed: bool, options: &StoreOptions) -> Self {
        let now = Utc::now();
        Self {
            entry_id: Uuid::new_v4().to_string(),
            key: key.to_string(),
            size_bytes: value.len(),
            value,
            memory_type: options.memory_type.clone(),
            priority: options.priority,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            ttl: options.ttl,
            tags: options.tags.clone(),
            compressed,
        }
    }

    /// True once `ttl` has elapsed since creation
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
            Some(ttl) => self.created_at + ttl <= now,
            None => false,
        }
    }
}

/// Options for `store()`
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub memory_type: String,
    pub priority: i32,
    /// Expiry for both the cached slot and the persisted entry
    pub ttl: Option<Duration>,
    pub tags: BTreeSet<String>,
    /// zstd-compress the encoded payload
    pub compress: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            memory_type: DEFAULT_MEMORY_TYPE.to_string(),
            priority: 1,
            ttl: None,
            tags: BTreeSet::new(),
            compress: false,
        }
    }
}

impl StoreOptions {
    pub fn memory_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = memory_type.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// Options for `retrieve_with()`
#[derive(Debug, Clone, Copy)]
pub struct RetrieveOptions {
    /// Schedule an access-metadata update when the backing store is read
    pub update_access: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            update_access: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_metadata() {
        let options = StoreOptions::default()
            .memory_type("episodic")
            .priority(3)
            .tag("b")
            .tag("a")
            .tag("b");
        let entry = Entry::new("user:name", b"\"Ada\"".to_vec(), false, &options);

        assert_eq!(entry.key, "user:name");
        assert_eq!(entry.memory_type, "episodic");
        assert_eq!(entry.priority, 3);
        assert_eq!(entry.size_bytes, 5);
        assert_eq!(entry.access_count, 0);
        assert_eq!(entry.created_at, entry.accessed_at);
        // Ordered set: duplicates collapse, iteration is sorted
        assert_eq!(entry.tags.iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(Uuid::parse_str(&entry.entry_id).is_ok());
    }

    #[test]
    fn test_entry_ids_are_unique() {
        let options = StoreOptions::default();
        let a = Entry::new("k", vec![1], false, &options);
        let b = Entry::new("k", vec![1], false, &options);
        assert_ne!(a.entry_id, b.entry_id);
    }

    #[test]
    fn test_entry_expiry() {
        let options = StoreOptions::default().ttl(Duration::from_secs(60));
        let entry = Entry::new("k", vec![], false, &options);

        assert!(!entry.is_expired(entry.created_at));
        assert!(entry.is_expired(entry.created_at + chrono::Duration::seconds(61)));

        let forever = Entry::new("k", vec![], false, &StoreOptions::default());
        assert!(!forever.is_expired(forever.created_at + chrono::Duration::days(365)));
    }

    #[test]
    fn test_cache_key_prefix() {
        assert_eq!(cache_key("profile"), "entry:profile");
    }
}
