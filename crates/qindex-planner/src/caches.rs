//! Planner-side caches.
//!
//! All state the planner keeps between requests lives here: TTL-evicted
//! snapshot and key caches plus the pending-refresh set that de-duplicates
//! concurrent scheduler requests. Eviction uses a monotonic clock.

use dashmap::{DashMap, DashSet};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// A concurrent map with per-cache TTL eviction.
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Get a live entry; expired entries are dropped on access.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let hit = self.entries.get(key)?;
        if hit.stored_at.elapsed() > self.ttl {
            drop(hit);
            self.entries.remove(key);
            return None;
        }
        Some(hit.value.clone())
    }

    /// Store a value.
    pub fn insert(&self, key: String, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop one entry.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of entries, including not-yet-evicted expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// De-duplicates concurrent refresh scheduling for the same scope: a key
/// enters the set when a refresh is scheduled and leaves when it lands.
#[derive(Default)]
pub struct PendingRefreshes {
    keys: DashSet<String>,
}

impl PendingRefreshes {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim a key. Returns false when a refresh for the key is
    /// already in flight.
    pub fn claim(&self, key: &str) -> bool {
        self.keys.insert(key.to_string())
    }

    /// Release a key after the refresh landed (or failed).
    pub fn release(&self, key: &str) {
        self.keys.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_cache_hit_and_expiry() {
        let cache: TtlCache<i32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("k".to_string(), 7);
        assert_eq!(cache.get("k"), Some(7));

        let expired: TtlCache<i32> = TtlCache::new(Duration::ZERO);
        expired.insert("k".to_string(), 7);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(expired.get("k"), None);
        assert!(expired.is_empty());
    }

    #[test]
    fn test_pending_refresh_claims_once() {
        let pending = PendingRefreshes::new();
        assert!(pending.claim("scope"));
        assert!(!pending.claim("scope"));
        pending.release("scope");
        assert!(pending.claim("scope"));
    }
}
