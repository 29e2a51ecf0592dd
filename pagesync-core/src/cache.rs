//! Time-bounded cache for rows fetched by data-bound components.
//!
//! Entries are keyed by a description of their source (collection plus the
//! rendered query), so invalidation by collection name is a substring match
//! on the key. The cache is an explicit service: whoever resolves data owns
//! one and passes it around.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Default freshness window for cached rows.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    rows: Vec<Value>,
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() <= ttl
    }
}

pub struct DataCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl DataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached rows for `key` if they are still fresh.
    pub fn get(&self, key: &str) -> Option<Vec<Value>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        if entry.is_fresh(self.ttl) {
            log::trace!("data cache hit: {key}");
            Some(entry.rows.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, key: impl Into<String>, rows: Vec<Value>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.into(),
            CacheEntry {
                rows,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drops every entry whose key contains `pattern`. Returns how many
    /// entries were removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| !key.contains(pattern));
        let removed = before - entries.len();
        if removed > 0 {
            log::debug!("invalidated {removed} cached data sources matching '{pattern}'");
        }
        removed
    }

    pub fn invalidate_all(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Removes stale entries so they stop holding memory.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(ttl));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache key for a collection queried with the given rendered clauses.
pub fn source_key(collection: &str, queries: &[String]) -> String {
    format!("{collection}?{}", queries.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_get() {
        let cache = DataCache::default();
        assert!(cache.get("events?").is_none());

        cache.insert("events?", vec![json!({"title": "a"})]);
        assert_eq!(cache.get("events?"), Some(vec![json!({"title": "a"})]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = DataCache::new(Duration::ZERO);
        cache.insert("k", vec![json!(1)]);
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get("k").is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_by_substring() {
        let cache = DataCache::default();
        cache.insert(source_key("events", &["a".into()]), vec![]);
        cache.insert(source_key("events", &["b".into()]), vec![]);
        cache.insert(source_key("members", &[]), vec![]);

        assert_eq!(cache.invalidate("events"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate("events"), 0);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
