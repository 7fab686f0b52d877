//! Eviction policy: decides which L1-resident block to drop when the pool is full.
//!
//! Policies are pluggable behind [`EvictionPolicy`]. The only shipped variant is
//! [`LruPolicy`], which keeps keys in an intrusive recency list so every
//! operation is O(1).

use lru::LruCache;

use crate::cache::block::CacheKey;

/// Capability interface for L1 eviction strategies.
///
/// The tracked key set must mirror the L1 key map: the cache calls
/// `track_new` after a successful insert and `remove` on every eviction.
pub trait EvictionPolicy: Send + Sync {
    /// Track a newly resident key. Counts as a touch.
    fn track_new(&mut self, key: &CacheKey, size: u64);

    /// Mark a key as recently used. No-op if the key is not tracked.
    fn record_access(&mut self, key: &CacheKey);

    /// The key that should be evicted next, if any.
    fn select_victim(&self) -> Option<CacheKey>;

    /// Stop tracking a key.
    fn remove(&mut self, key: &CacheKey);

    /// Number of tracked keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the sizes of tracked keys.
    fn tracked_bytes(&self) -> u64;

    /// Short policy name for logs and stats.
    fn name(&self) -> &'static str;
}

/// Least-recently-used policy.
pub struct LruPolicy {
    /// Key -> size in bytes, ordered by recency.
    entries: LruCache<CacheKey, u64>,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
        }
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LruPolicy {
    fn track_new(&mut self, key: &CacheKey, size: u64) {
        self.entries.put(key.clone(), size);
    }

    fn record_access(&mut self, key: &CacheKey) {
        self.entries.promote(key);
    }

    fn select_victim(&self) -> Option<CacheKey> {
        self.entries.peek_lru().map(|(key, _)| key.clone())
    }

    fn remove(&mut self, key: &CacheKey) {
        self.entries.pop(key);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn tracked_bytes(&self) -> u64 {
        self.entries.iter().map(|(_, size)| *size).sum()
    }

    fn name(&self) -> &'static str {
        "lru"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s)
    }

    #[test]
    fn test_victim_is_least_recently_touched() {
        let mut lru = LruPolicy::new();
        lru.track_new(&key("a"), 10);
        lru.track_new(&key("b"), 10);
        lru.track_new(&key("c"), 10);

        assert_eq!(lru.select_victim(), Some(key("a")));

        lru.record_access(&key("a"));
        assert_eq!(lru.select_victim(), Some(key("b")));
    }

    #[test]
    fn test_record_access_untracked_is_noop() {
        let mut lru = LruPolicy::new();
        lru.track_new(&key("a"), 10);
        lru.record_access(&key("ghost"));
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.select_victim(), Some(key("a")));
    }

    #[test]
    fn test_removed_key_never_selected() {
        let mut lru = LruPolicy::new();
        lru.track_new(&key("a"), 10);
        lru.track_new(&key("b"), 20);
        lru.remove(&key("a"));

        assert_eq!(lru.select_victim(), Some(key("b")));
        assert_eq!(lru.tracked_bytes(), 20);

        lru.remove(&key("b"));
        assert!(lru.is_empty());
        assert_eq!(lru.select_victim(), None);
    }

    #[test]
    fn test_retrack_counts_as_touch() {
        let mut lru = LruPolicy::new();
        lru.track_new(&key("a"), 10);
        lru.track_new(&key("b"), 10);
        lru.track_new(&key("a"), 30);

        assert_eq!(lru.len(), 2);
        assert_eq!(lru.select_victim(), Some(key("b")));
        assert_eq!(lru.tracked_bytes(), 40);
    }
}
