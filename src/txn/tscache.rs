// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The timestamp cache: an approximate, bucketed map from keys to
//! tuple timestamps.
//!
//! Entries are reference-counted by the transactions holding them; an
//! unreferenced entry may be evicted when its bucket fills up, and its
//! timestamps are handed back to the caller for persistence as a
//! timestamp-only update.

use super::timestamp::{AtomicTimestampSet, TimestampSet};
use crate::hash::hash_key;
use crate::UserKey;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One cached key with its CAS-able timestamp word
pub struct TsEntry {
    pub key: UserKey,
    pub ts: AtomicTimestampSet,
    refcount: AtomicU32,
}

impl TsEntry {
    fn new(key: UserKey) -> Self {
        Self {
            key,
            ts: AtomicTimestampSet::default(),
            refcount: AtomicU32::new(1),
        }
    }
}

/// Timestamps displaced from the cache, to be persisted by the caller
pub struct EvictedTs {
    pub key: UserKey,
    pub ts: TimestampSet,
}

/// Bucketed timestamp cache sized by `tscache_log_slots`
pub struct TsCache {
    buckets: Vec<Mutex<Vec<Arc<TsEntry>>>>,
    bucket_mask: u64,
    per_bucket: usize,
    victim_hint: AtomicUsize,
}

impl TsCache {
    const ENTRIES_PER_BUCKET: usize = 8;

    #[must_use]
    pub fn new(log_slots: u8) -> Self {
        let capacity = 1usize << log_slots.clamp(4, 30);
        let bucket_count = (capacity / Self::ENTRIES_PER_BUCKET)
            .next_power_of_two()
            .max(1);

        Self {
            buckets: (0..bucket_count).map(|_| Mutex::new(Vec::new())).collect(),
            bucket_mask: bucket_count as u64 - 1,
            per_bucket: Self::ENTRIES_PER_BUCKET,
            victim_hint: AtomicUsize::new(0),
        }
    }

    fn bucket_of(&self, key: &[u8]) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let idx = (hash_key(key) & self.bucket_mask) as usize;
        idx
    }

    /// Gets or creates the entry for `key`, incrementing its refcount.
    ///
    /// Returns `(entry, is_new, evicted)`; the caller persists the
    /// evicted timestamps *after* releasing any locks of its own.
    #[allow(clippy::expect_used)]
    pub fn acquire(&self, key: &[u8]) -> (Arc<TsEntry>, bool, Vec<EvictedTs>) {
        let mut bucket = self.buckets[self.bucket_of(key)]
            .lock()
            .expect("lock is poisoned");

        if let Some(entry) = bucket.iter().find(|e| &*e.key == key) {
            entry.refcount.fetch_add(1, Ordering::AcqRel);
            return (entry.clone(), false, Vec::new());
        }

        let mut evicted = Vec::new();

        if bucket.len() >= self.per_bucket {
            // Clock-like victim choice: scan from a rotating start for
            // an unreferenced entry.
            let start = self.victim_hint.fetch_add(1, Ordering::Relaxed) % bucket.len();

            let victim = (0..bucket.len())
                .map(|i| (start + i) % bucket.len())
                .find(|i| bucket[*i].refcount.load(Ordering::Acquire) == 0);

            if let Some(i) = victim {
                let entry = bucket.swap_remove(i);
                let ts = entry.ts.load();

                if ts != TimestampSet::default() {
                    evicted.push(EvictedTs {
                        key: entry.key.clone(),
                        ts,
                    });
                }
            }
            // If every entry is referenced, the bucket grows past its
            // budget; the cache is approximate, not bounding.
        }

        let entry = Arc::new(TsEntry::new(key.into()));
        bucket.push(entry.clone());

        (entry, true, evicted)
    }

    /// Drops one reference.
    pub fn release(&self, entry: &TsEntry) {
        let prev = entry.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release without acquire");
    }

    /// Number of resident entries.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().expect("lock is poisoned").len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn acquire_is_refcounted() {
        let cache = TsCache::new(8);

        let (a, is_new, _) = cache.acquire(b"k");
        assert!(is_new);

        let (b, is_new, _) = cache.acquire(b"k");
        assert!(!is_new);
        assert!(Arc::ptr_eq(&a, &b));

        cache.release(&a);
        cache.release(&b);
        assert_eq!(1, cache.len());
    }

    #[test]
    fn eviction_hands_back_timestamps() {
        let cache = TsCache::new(4); // 16 slots, 2 buckets

        let mut acquired = Vec::new();
        let mut evicted_keys = Vec::new();

        for i in 0..200u32 {
            let key = format!("key-{i}");
            let (entry, _, evicted) = cache.acquire(key.as_bytes());

            entry.ts.cas(
                TimestampSet::default(),
                TimestampSet::new(u64::from(i) + 1, 0),
            );

            cache.release(&entry);
            acquired.push(entry);

            for e in evicted {
                assert_ne!(TimestampSet::default(), e.ts);
                evicted_keys.push(e.key);
            }
        }

        assert!(!evicted_keys.is_empty(), "small cache must evict");
    }

    #[test]
    fn referenced_entries_survive_pressure() {
        let cache = TsCache::new(4);

        let (pinned, _, _) = cache.acquire(b"pinned");

        for i in 0..500u32 {
            let key = format!("filler-{i}");
            let (entry, _, _) = cache.acquire(key.as_bytes());
            cache.release(&entry);
        }

        // The pinned entry must still be the same allocation
        let (again, is_new, _) = cache.acquire(b"pinned");
        assert!(!is_new);
        assert!(Arc::ptr_eq(&pinned, &again));

        cache.release(&pinned);
        cache.release(&again);
    }
}
