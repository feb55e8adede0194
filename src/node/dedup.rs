//! Suppresses reprocessing of a message id already seen. The same logical
//! send can arrive more than once (directed plus limited broadcast, or a
//! peer's redundant send), so every inbound and outbound id goes through
//! this cache before dispatch.

use crate::utils::misc::get_unix_millis_now;

pub const MIN_CAPACITY: usize = 256;
pub const MIN_TTL_MS: u64 = 1_000;

#[derive(Debug)]
pub struct RecentMessageCache {
    // id -> expires-at, unix millis
    seen: scc::HashMap<String, u64>,
    capacity: usize,
    ttl_ms: u64,
}

impl RecentMessageCache {
    /// Minimums are enforced so a degenerate configuration cannot defeat
    /// dedup entirely.
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self { seen: scc::HashMap::new(), capacity: capacity.max(MIN_CAPACITY), ttl_ms: ttl_ms.max(MIN_TTL_MS) }
    }

    /// Returns true if `id` was already recorded and has not expired yet.
    /// Otherwise records it and returns false. An empty id is never a
    /// duplicate and is not recorded.
    pub fn is_duplicate_and_record(&self, id: &str) -> bool {
        self.is_duplicate_and_record_at(id, get_unix_millis_now())
    }

    fn is_duplicate_and_record_at(&self, id: &str, now: u64) -> bool {
        if id.is_empty() {
            return false;
        }
        // single entry lock: concurrent callers with the same id agree on
        // exactly one "first"
        let duplicate = match self.seen.entry(id.to_string()) {
            scc::hash_map::Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    true
                } else {
                    // expired entry, restart the window
                    *entry.get_mut() = now + self.ttl_ms;
                    false
                }
            }
            scc::hash_map::Entry::Vacant(entry) => {
                entry.insert_entry(now + self.ttl_ms);
                false
            }
        };
        if !duplicate && self.seen.len() > self.capacity {
            self.prune(now);
        }
        duplicate
    }

    /// Purge expired entries; if the cache is still over capacity, evict the
    /// oldest entries down to roughly 70% of capacity.
    fn prune(&self, now: u64) {
        self.seen.retain(|_, expires_at| *expires_at > now);
        if self.seen.len() <= self.capacity {
            return;
        }
        let mut by_age: Vec<(u64, String)> = Vec::with_capacity(self.seen.len());
        self.seen.scan(|id, expires_at| by_age.push((*expires_at, id.clone())));
        by_age.sort_unstable();
        let keep = self.capacity * 7 / 10;
        let evict = by_age.len().saturating_sub(keep);
        for (_, id) in by_age.into_iter().take(evict) {
            let _ = self.seen.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_ttl() {
        let cache = RecentMessageCache::new(256, 1_000);
        assert!(!cache.is_duplicate_and_record_at("a", 0));
        assert!(cache.is_duplicate_and_record_at("a", 500));
        assert!(cache.is_duplicate_and_record_at("a", 999));
    }

    #[test]
    fn fresh_again_after_ttl() {
        let cache = RecentMessageCache::new(256, 1_000);
        assert!(!cache.is_duplicate_and_record_at("a", 0));
        // recorded at 0, expires at 1000
        assert!(!cache.is_duplicate_and_record_at("a", 1_000));
        // the re-record restarts the window
        assert!(cache.is_duplicate_and_record_at("a", 1_500));
    }

    #[test]
    fn empty_id_is_permissive() {
        let cache = RecentMessageCache::new(256, 1_000);
        assert!(!cache.is_duplicate_and_record_at("", 0));
        assert!(!cache.is_duplicate_and_record_at("", 0));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn enforced_minimums() {
        let cache = RecentMessageCache::new(1, 1);
        assert_eq!(cache.capacity, MIN_CAPACITY);
        assert_eq!(cache.ttl_ms, MIN_TTL_MS);
    }

    #[test]
    fn contended_id_has_exactly_one_first() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Barrier};

        let cache = Arc::new(RecentMessageCache::new(256, 60_000));
        let barrier = Arc::new(Barrier::new(8));
        let firsts = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let firsts = Arc::clone(&firsts);
                std::thread::spawn(move || {
                    barrier.wait();
                    if !cache.is_duplicate_and_record("contended") {
                        firsts.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(firsts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn capacity_bound_holds_after_purge() {
        let cache = RecentMessageCache::new(256, 1_000);
        // all live: eviction has to kick in
        for i in 0..400 {
            assert!(!cache.is_duplicate_and_record_at(&format!("id-{i}"), i));
        }
        assert!(cache.len() <= 256);
    }

    #[test]
    fn expired_entries_are_purged_first() {
        let cache = RecentMessageCache::new(256, 1_000);
        for i in 0..256 {
            cache.is_duplicate_and_record_at(&format!("old-{i}"), 0);
        }
        // everything above expired by now=2000, so the fresh insert purges
        // instead of evicting live entries
        assert!(!cache.is_duplicate_and_record_at("fresh", 2_000));
        assert!(cache.is_duplicate_and_record_at("fresh", 2_100));
        assert!(cache.len() <= 2);
    }
}
