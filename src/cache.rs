//! # Page Cache
//!
//! A bounded in-memory cache of deserialized pages keyed by their file
//! offset, shared by every transaction of a resource. Persisted pages are
//! immutable, so the cache hands out `Arc` clones and needs no pinning,
//! dirty tracking, or write-back.
//!
//! ## Eviction
//!
//! Eviction uses SIEVE rather than strict LRU: every hit sets a `visited`
//! flag, and an eviction hand scans entries, clearing the flag on the first
//! pass and evicting entries whose flag is already clear. Trie walks touch
//! long runs of pages exactly once; SIEVE lets those flow through the cache
//! without displacing the hot upper-level indirect pages that every lookup
//! revisits.
//!
//! ## Sharding
//!
//! The cache is split into [`CACHE_SHARD_COUNT`] independently locked
//! shards selected by a multiplicative hash of the file offset, so
//! concurrent read transactions rarely contend on the same lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::CACHE_SHARD_COUNT;
use crate::page::Page;

struct CacheEntry {
    key: i64,
    visited: AtomicBool,
    page: Arc<Page>,
}

struct CacheShard {
    entries: Vec<CacheEntry>,
    index: HashMap<i64, usize>,
    hand: usize,
    capacity: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    fn get(&self, key: i64) -> Option<Arc<Page>> {
        self.index.get(&key).map(|&idx| {
            let entry = &self.entries[idx];
            entry.visited.store(true, Ordering::Release);
            Arc::clone(&entry.page)
        })
    }

    fn evict_one(&mut self) {
        debug_assert!(!self.entries.is_empty());
        loop {
            if self.hand >= self.entries.len() {
                self.hand = 0;
            }
            let entry = &self.entries[self.hand];
            if entry.visited.swap(false, Ordering::AcqRel) {
                self.hand += 1;
                continue;
            }
            let removed = self.entries.swap_remove(self.hand);
            self.index.remove(&removed.key);
            if self.hand < self.entries.len() {
                let moved_key = self.entries[self.hand].key;
                self.index.insert(moved_key, self.hand);
            }
            return;
        }
    }

    fn insert(&mut self, key: i64, page: Arc<Page>) {
        if self.index.contains_key(&key) {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_one();
        }
        let idx = self.entries.len();
        self.entries.push(CacheEntry {
            key,
            visited: AtomicBool::new(true),
            page,
        });
        self.index.insert(key, idx);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct PageCache {
    shards: Vec<RwLock<CacheShard>>,
}

impl PageCache {
    pub fn new(total_capacity: usize) -> Self {
        let capacity = total_capacity.max(CACHE_SHARD_COUNT);
        let per_shard = capacity / CACHE_SHARD_COUNT;
        let remainder = capacity % CACHE_SHARD_COUNT;
        let shards = (0..CACHE_SHARD_COUNT)
            .map(|i| {
                let cap = if i < remainder {
                    per_shard + 1
                } else {
                    per_shard
                };
                RwLock::new(CacheShard::new(cap))
            })
            .collect();
        Self { shards }
    }

    fn shard(&self, key: i64) -> &RwLock<CacheShard> {
        let hash = (key as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.shards[(hash >> 32) as usize % CACHE_SHARD_COUNT]
    }

    pub fn get(&self, key: i64) -> Option<Arc<Page>> {
        self.shard(key).read().get(key)
    }

    pub fn insert(&self, key: i64, page: Arc<Page>) {
        self.shard(key).write().insert(key, page);
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut guard = shard.write();
            guard.entries.clear();
            guard.index.clear();
            guard.hand = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::IndirectPage;

    fn page(revision: u32) -> Arc<Page> {
        Arc::new(Page::Indirect(IndirectPage::new(revision)))
    }

    #[test]
    fn insert_then_get() {
        let cache = PageCache::new(64);
        cache.insert(12, page(1));
        let hit = cache.get(12).unwrap();
        assert_eq!(hit.as_indirect().unwrap().revision(), 1);
        assert!(cache.get(13).is_none());
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let cache = PageCache::new(64);
        cache.insert(12, page(1));
        cache.insert(12, page(2));
        assert_eq!(cache.len(), 1);
        let hit = cache.get(12).unwrap();
        assert_eq!(hit.as_indirect().unwrap().revision(), 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = PageCache::new(64);
        for key in 0..10_000i64 {
            cache.insert(key * 16, page(key as u32));
        }
        assert!(cache.len() <= 64 + CACHE_SHARD_COUNT);
    }

    #[test]
    fn visited_pages_survive_a_scan() {
        let cache = PageCache::new(CACHE_SHARD_COUNT);
        // Everything lands in some shard of capacity 1; a hot page that is
        // re-read still gets a second chance over a cold one.
        cache.insert(1, page(1));
        cache.get(1);
        cache.insert(1, page(1));
        assert!(cache.get(1).is_some());
    }

    #[test]
    fn clear_empties_all_shards() {
        let cache = PageCache::new(128);
        for key in 0..100i64 {
            cache.insert(key, page(0));
        }
        assert!(!cache.is_empty());
        cache.clear();
        assert!(cache.is_empty());
    }
}
