// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::alloc::BlockAllocator;
use crate::btree::{DynTreeIter, DynamicTree};
use crate::cache::{BandLock, PageCache};
use crate::schema::fold_step;
use crate::{Generation, Message, SchemaRef};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

const EMPTY: u8 = 0;
const WRITABLE: u8 = 1;
const SEALED: u8 = 2;
const FLUSHING: u8 = 3;

struct Slot {
    state: AtomicU8,
    generation: AtomicU64,
    tree: RwLock<Option<Arc<DynamicTree>>>,
}

/// A sealed memtable, ready for packing into a level-0 branch
pub struct SealedMemtable {
    pub slot: usize,
    pub generation: Generation,
    pub tree: Arc<DynamicTree>,
}

/// Ring of in-memory B-trees
///
/// Writers insert into the single writable slot; a slot that crosses
/// the size threshold is sealed and queued for flushing, and the ring
/// rotates to the next empty slot. Readers consult every non-empty
/// slot from newest to oldest generation.
///
/// Rotation and sealing run under the write side of a band lock, so
/// in-flight inserts (read side) never land in a tree that a flusher
/// already started packing.
pub struct MemtableRing {
    cache: Arc<PageCache>,
    schema: SchemaRef,
    block: Arc<BlockAllocator>,

    slots: Vec<Slot>,
    active: AtomicUsize,
    generation: AtomicU64,
    capacity: u64,

    band: BandLock,

    /// Trees whose slot was recycled but that a reader may still hold
    retired: Mutex<Vec<Arc<DynamicTree>>>,
}

impl MemtableRing {
    pub fn new(
        cache: Arc<PageCache>,
        schema: SchemaRef,
        block: Arc<BlockAllocator>,
        ring_size: usize,
        capacity: u64,
    ) -> crate::Result<Self> {
        let slots = (0..ring_size.max(2))
            .map(|_| Slot {
                state: AtomicU8::new(EMPTY),
                generation: AtomicU64::new(0),
                tree: RwLock::new(None),
            })
            .collect::<Vec<_>>();

        let ring = Self {
            cache,
            schema,
            block,
            slots,
            active: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            capacity,
            band: BandLock::new(),
            retired: Mutex::new(Vec::new()),
        };

        ring.make_writable(0)?;
        Ok(ring)
    }

    fn new_tree(&self) -> crate::Result<Arc<DynamicTree>> {
        Ok(Arc::new(DynamicTree::new(
            self.cache.clone(),
            self.schema.clone(),
            self.block.clone(),
        )?))
    }

    #[allow(clippy::expect_used)]
    fn make_writable(&self, idx: usize) -> crate::Result<()> {
        let tree = self.new_tree()?;
        let slot = &self.slots[idx];

        *slot.tree.write().expect("lock is poisoned") = Some(tree);
        slot.generation
            .store(self.generation.fetch_add(1, Ordering::AcqRel) + 1, Ordering::Release);
        slot.state.store(WRITABLE, Ordering::Release);
        self.active.store(idx, Ordering::Release);

        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn slot_tree(&self, idx: usize) -> Option<Arc<DynamicTree>> {
        self.slots[idx].tree.read().expect("lock is poisoned").clone()
    }

    /// Inserts a message into the active memtable.
    ///
    /// Returns the sealed memtable if this insert pushed the active
    /// slot over its capacity.
    pub fn insert(
        &self,
        tid: usize,
        key: &[u8],
        msg: &Message,
    ) -> crate::Result<Option<SealedMemtable>> {
        let mut backoff = crate::cache::rwlatch::Backoff::new();

        loop {
            self.band.read_lock(tid);

            let idx = self.active.load(Ordering::Acquire);
            let slot = &self.slots[idx];

            if slot.state.load(Ordering::Acquire) != WRITABLE {
                self.band.read_unlock(tid);

                // Rotation pending; help out, then retry.
                self.ensure_writable()?;
                backoff.snooze();
                continue;
            }

            let Some(tree) = self.slot_tree(idx) else {
                self.band.read_unlock(tid);
                backoff.snooze();
                continue;
            };

            let result = tree.insert(key, msg);
            let size = tree.approximate_size();
            self.band.read_unlock(tid);

            result?;

            if size >= self.capacity {
                return Ok(self.try_seal(idx));
            }
            return Ok(None);
        }
    }

    /// Seals the slot if it is still writable, rotating the ring.
    #[allow(clippy::expect_used)]
    fn try_seal(&self, idx: usize) -> Option<SealedMemtable> {
        self.band.write_lock();

        let slot = &self.slots[idx];
        let sealed = slot
            .state
            .compare_exchange(WRITABLE, SEALED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        let result = if sealed {
            let generation = slot.generation.load(Ordering::Acquire);
            let tree = self
                .slot_tree(idx)
                .expect("sealed slot has a tree");

            // Rotate to the next empty slot if there is one; otherwise
            // writers stall until a flush completes.
            let next = (idx + 1) % self.slots.len();
            if self.slots[next].state.load(Ordering::Acquire) == EMPTY {
                if let Err(e) = self.make_writable(next) {
                    log::error!("memtable rotation failed: {e:?}");
                }
            }

            Some(SealedMemtable {
                slot: idx,
                generation,
                tree,
            })
        } else {
            None
        };

        self.band.write_unlock();
        result
    }

    /// Rotates to an empty slot when the active one is not writable.
    fn ensure_writable(&self) -> crate::Result<()> {
        self.band.write_lock();

        let idx = self.active.load(Ordering::Acquire);
        let result = if self.slots[idx].state.load(Ordering::Acquire) == WRITABLE {
            Ok(())
        } else {
            let empty = (0..self.slots.len())
                .map(|i| (idx + i) % self.slots.len())
                .find(|i| self.slots[*i].state.load(Ordering::Acquire) == EMPTY);

            match empty {
                Some(next) => self.make_writable(next),
                // Every slot is sealed or flushing; writers back off
                // until the flusher catches up.
                None => Ok(()),
            }
        };

        self.band.write_unlock();
        result
    }

    /// Seals the active memtable regardless of size (shutdown, manual
    /// flush). Returns `None` if it is empty.
    #[allow(clippy::expect_used)]
    pub fn seal_active(&self) -> Option<SealedMemtable> {
        let idx = self.active.load(Ordering::Acquire);

        let tree = self.slot_tree(idx)?;
        if tree.is_empty() {
            return None;
        }

        self.try_seal(idx)
    }

    /// Marks a sealed slot as being flushed.
    pub fn begin_flush(&self, slot: usize) -> bool {
        self.slots[slot]
            .state
            .compare_exchange(SEALED, FLUSHING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Recycles a flushed slot.
    #[allow(clippy::expect_used)]
    pub fn complete_flush(&self, slot: usize) {
        let slot_ref = &self.slots[slot];

        let old = slot_ref.tree.write().expect("lock is poisoned").take();
        slot_ref.state.store(EMPTY, Ordering::Release);

        if let Some(tree) = old {
            self.retired.lock().expect("lock is poisoned").push(tree);
        }

        self.reap_retired();
    }

    /// Disposes retired trees nobody references anymore.
    #[allow(clippy::expect_used)]
    fn reap_retired(&self) {
        let mut retired = self.retired.lock().expect("lock is poisoned");
        retired.retain(|tree| {
            if Arc::strong_count(tree) == 1 {
                tree.dispose();
                false
            } else {
                true
            }
        });
    }

    /// Non-empty slots as `(generation, tree)`, newest first.
    pub fn live_trees(&self, tid: usize) -> Vec<(Generation, Arc<DynamicTree>)> {
        self.band.read_lock(tid);

        let mut trees: Vec<(Generation, Arc<DynamicTree>)> = self
            .slots
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) != EMPTY)
            .filter_map(|slot| {
                let generation = slot.generation.load(Ordering::Acquire);
                self.slot_tree_by_ref(slot).map(|tree| (generation, tree))
            })
            .collect();

        self.band.read_unlock(tid);

        trees.sort_by(|a, b| b.0.cmp(&a.0));
        trees
    }

    #[allow(clippy::expect_used)]
    fn slot_tree_by_ref(&self, slot: &Slot) -> Option<Arc<DynamicTree>> {
        slot.tree.read().expect("lock is poisoned").clone()
    }

    /// Point lookup across the ring, newest to oldest, folding until a
    /// definitive message. The result may still be an open chain that
    /// the trunk has to continue.
    pub fn lookup(&self, tid: usize, key: &[u8]) -> crate::Result<Option<Message>> {
        let mut acc: Option<Message> = None;

        for (_, tree) in self.live_trees(tid) {
            if let Some(found) = tree.lookup(key)? {
                acc = Some(match acc {
                    None => found,
                    Some(newer) if newer.is_definitive() => newer,
                    Some(newer) => fold_step(&*self.schema, key, &newer, &found),
                });

                if acc.as_ref().is_some_and(Message::is_definitive) {
                    break;
                }
            }
        }

        Ok(acc)
    }

    /// Range iterators over all live trees, newest first.
    ///
    /// Each iterator is paired with its tree so the caller can keep the
    /// tree's pages alive for the scan's lifetime.
    pub fn range_iters(
        &self,
        tid: usize,
        start: Option<&[u8]>,
    ) -> crate::Result<Vec<(Arc<DynamicTree>, DynTreeIter)>> {
        let mut iters = Vec::new();

        for (_, tree) in self.live_trees(tid) {
            let iter = match start {
                Some(start) => tree.iter_from(start)?,
                None => tree.iter()?,
            };
            iters.push((tree, iter));
        }

        Ok(iters)
    }

    /// Approximate size of the active memtable.
    pub fn active_size(&self) -> u64 {
        let idx = self.active.load(Ordering::Acquire);
        self.slot_tree(idx).map_or(0, |tree| tree.approximate_size())
    }

    /// Disposes every live and retired tree (shutdown).
    #[allow(clippy::expect_used)]
    pub fn dispose_all(&self) {
        for slot in &self.slots {
            if let Some(tree) = slot.tree.write().expect("lock is poisoned").take() {
                tree.dispose();
            }
            slot.state.store(EMPTY, Ordering::Release);
        }

        let mut retired = self.retired.lock().expect("lock is poisoned");
        for tree in retired.drain(..) {
            tree.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DramStore, PageStore};
    use crate::ByteSchema;
    use test_log::test;

    fn ring(capacity: u64) -> MemtableRing {
        let store = PageStore::Dram(DramStore::new(64 * 1_024 * 1_024));
        let cache = PageCache::new(store, 8 * 1_024 * 1_024, 4_096);
        let block = Arc::new(BlockAllocator::new(4_096, 32, 64 * 1_024 * 1_024));

        #[allow(clippy::unwrap_used)]
        MemtableRing::new(cache, Arc::new(ByteSchema), block, 4, capacity).unwrap()
    }

    #[test]
    fn insert_lookup() -> crate::Result<()> {
        let ring = ring(1_024 * 1_024);

        assert!(ring.insert(0, b"k", &Message::insert(*b"v"))?.is_none());

        let msg = ring.lookup(0, b"k")?.expect("must exist");
        assert_eq!(*b"v", &*msg.value);

        Ok(())
    }

    #[test]
    fn crossing_capacity_seals() -> crate::Result<()> {
        let ring = ring(4 * 1_024);

        let mut sealed = None;
        for i in 0..1_000u32 {
            let key = format!("key-{i:06}");
            if let Some(s) = ring.insert(0, key.as_bytes(), &Message::insert([0u8; 32]))? {
                sealed = Some(s);
                break;
            }
        }

        let sealed = sealed.expect("capacity must trip");
        assert!(sealed.tree.len() > 0);
        assert_eq!(1, sealed.generation);

        // Ring rotated: inserts keep working
        assert!(ring.insert(0, b"after", &Message::insert(*b"x"))?.is_none());

        // Sealed data is still visible to readers
        assert!(ring.lookup(0, b"key-000000")?.is_some());
        assert!(ring.lookup(0, b"after")?.is_some());

        Ok(())
    }

    #[test]
    fn newest_slot_shadows_older() -> crate::Result<()> {
        let ring = ring(2 * 1_024);

        ring.insert(0, b"k", &Message::insert(*b"old"))?;

        // Force a seal + rotation
        let sealed = loop {
            if let Some(s) = ring.insert(0, b"filler", &Message::insert([0u8; 64]))? {
                break s;
            }
        };
        ring.begin_flush(sealed.slot);

        ring.insert(0, b"k", &Message::insert(*b"new"))?;

        let msg = ring.lookup(0, b"k")?.expect("must exist");
        assert_eq!(*b"new", &*msg.value);

        Ok(())
    }

    #[test]
    fn flush_lifecycle_recycles_slot() -> crate::Result<()> {
        let ring = ring(2 * 1_024);

        let sealed = loop {
            if let Some(s) = ring.insert(0, b"k", &Message::update([0u8; 128]))? {
                break s;
            }
        };

        assert!(ring.begin_flush(sealed.slot));
        assert!(!ring.begin_flush(sealed.slot), "double flush must fail");

        ring.complete_flush(sealed.slot);
        drop(sealed);

        // Slot is reusable
        assert!(ring.insert(0, b"fresh", &Message::insert(*b"v"))?.is_none());

        Ok(())
    }
}
