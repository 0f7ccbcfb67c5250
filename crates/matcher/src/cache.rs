//! Bounded LRU cache mapping a `sendTo` hint string to the channel it last
//! resolved to, keyed by a hash of the hint text per `MatchCacheEntry`.
//! Hand-rolled rather than pulled from a crate: a `VecDeque` recency list
//! plus a `HashMap` index is the whole of it, and the teacher's registries
//! elsewhere in this codebase favor plain maps over cache crates too.

use std::collections::{HashMap, VecDeque, hash_map::DefaultHasher};
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone)]
pub struct MatchCacheEntry {
    pub channel_name: String,
    pub score: f32,
}

pub struct MatchCache {
    capacity: usize,
    entries: HashMap<u64, MatchCacheEntry>,
    /// Recency order, most-recently-used at the back. May contain stale
    /// keys already evicted from `entries`; `touch`/`evict_if_needed`
    /// reconcile lazily rather than scanning on every access.
    order: VecDeque<u64>,
}

impl MatchCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: HashMap::new(), order: VecDeque::new() }
    }

    pub fn get(&mut self, hint: &str) -> Option<MatchCacheEntry> {
        let key = Self::hash_key(hint);
        let entry = self.entries.get(&key).cloned()?;
        self.touch(key);
        Some(entry)
    }

    pub fn insert(&mut self, hint: &str, channel_name: String, score: f32) {
        let key = Self::hash_key(hint);
        self.entries.insert(key, MatchCacheEntry { channel_name, score });
        self.touch(key);
        self.evict_if_needed();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn touch(&mut self, key: u64) {
        self.order.retain(|k| *k != key);
        self.order.push_back(key);
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else { break };
            self.entries.remove(&oldest);
        }
    }

    fn hash_key(hint: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        hint.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for MatchCache {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn returns_none_for_missing_key() {
        let mut cache = MatchCache::new(4);
        assert!(cache.get("unknown").is_none());
    }

    #[test]
    fn round_trips_an_entry() {
        let mut cache = MatchCache::new(4);
        cache.insert("please forward to wechat", "wechat".into(), 0.91);
        let entry = cache.get("please forward to wechat").expect("cached entry");
        assert_eq!(entry.channel_name, "wechat");
    }

    #[test]
    fn evicts_least_recently_used_when_over_capacity() {
        let mut cache = MatchCache::new(2);
        cache.insert("a", "chan-a".into(), 0.5);
        cache.insert("b", "chan-b".into(), 0.5);
        cache.insert("c", "chan-c".into(), 0.5);

        assert!(cache.get("a").is_none(), "oldest entry should have been evicted");
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn touching_an_entry_protects_it_from_eviction() {
        let mut cache = MatchCache::new(2);
        cache.insert("a", "chan-a".into(), 0.5);
        cache.insert("b", "chan-b".into(), 0.5);
        // "a" is now most-recently-used.
        assert!(cache.get("a").is_some());
        cache.insert("c", "chan-c".into(), 0.5);

        assert!(cache.get("b").is_none(), "b should be evicted instead of a");
        assert!(cache.get("a").is_some());
    }
}
