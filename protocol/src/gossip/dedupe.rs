//! # Message Deduplication
//!
//! A bounded LRU-with-TTL set of recently seen message ids. Epidemic
//! propagation guarantees each peer receives popular messages several
//! times; this cache is what turns "several" into one delivery and one
//! forward. Entries expire with the message's own TTL (a message that can
//! no longer propagate no longer needs dedupe state) and the whole cache
//! is capacity-bounded so a chatty network cannot grow it without limit.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::config::now_ms;

/// Fallback entry lifetime when a message carries no TTL.
const DEFAULT_ENTRY_TTL_MS: u64 = 30_000;

struct Inner {
    /// id → expiry timestamp (Unix millis).
    entries: HashMap<String, u64>,
    /// Insertion order for capacity eviction.
    order: VecDeque<String>,
}

/// Concurrent bounded dedupe set.
pub struct DedupeCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl DedupeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Records `id` as seen for `ttl_ms`. Returns `true` if this is the
    /// first sighting (or the previous one had expired), `false` for a
    /// duplicate.
    pub fn insert(&self, id: &str, ttl_ms: u64) -> bool {
        let now = now_ms();
        let ttl = if ttl_ms == 0 { DEFAULT_ENTRY_TTL_MS } else { ttl_ms };
        let mut inner = self.inner.lock();

        if let Some(&expires) = inner.entries.get(id) {
            if expires > now {
                return false;
            }
        }

        inner.entries.insert(id.to_string(), now + ttl);
        inner.order.push_back(id.to_string());
        if inner.entries.len() > self.capacity {
            Self::evict(&mut inner, self.capacity, now);
        }
        true
    }

    /// Whether `id` is currently marked seen.
    pub fn contains(&self, id: &str) -> bool {
        let now = now_ms();
        let inner = self.inner.lock();
        inner.entries.get(id).is_some_and(|&expires| expires > now)
    }

    /// Live entry count (expired-but-unswept entries included).
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries, then oldest insertions until the cache is at
    /// 75% capacity. Runs under the lock, amortized across inserts.
    fn evict(inner: &mut Inner, capacity: usize, now: u64) {
        inner.entries.retain(|_, &mut expires| expires > now);

        let target = capacity * 3 / 4;
        while inner.entries.len() > target {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            // The id may have been re-inserted later; only drop it if this
            // queue slot is its latest occurrence.
            if !inner.order.contains(&oldest) {
                inner.entries.remove(&oldest);
            }
        }

        // Keep the order queue from accumulating stale slots.
        let entries = &inner.entries;
        inner.order.retain(|id| entries.contains_key(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_is_fresh_second_is_duplicate() {
        let cache = DedupeCache::new(100);
        assert!(cache.insert("m1", 30_000));
        assert!(!cache.insert("m1", 30_000));
        assert!(cache.contains("m1"));
        assert!(!cache.contains("m2"));
    }

    #[test]
    fn zero_ttl_uses_default_window() {
        let cache = DedupeCache::new(100);
        assert!(cache.insert("m1", 0));
        assert!(!cache.insert("m1", 0));
    }

    #[test]
    fn capacity_eviction_keeps_recent_entries() {
        let cache = DedupeCache::new(8);
        for i in 0..20 {
            assert!(cache.insert(&format!("m{i}"), 60_000));
        }
        // Bounded: never above capacity after eviction settles.
        assert!(cache.len() <= 8);
        // The most recent insert survives.
        assert!(cache.contains("m19"));
    }

    #[test]
    fn distinct_ids_are_independent() {
        let cache = DedupeCache::new(100);
        for i in 0..50 {
            assert!(cache.insert(&format!("m{i}"), 30_000), "m{i} seen early");
        }
        assert_eq!(cache.len(), 50);
    }
}
