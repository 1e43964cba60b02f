// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::node;
use crate::alloc::{BlockAllocator, MiniAllocator};
use crate::cache::{PageCache, PageHandle, PageWriteGuard};
use crate::schema::fold_step;
use crate::store::{PageAddr, PageType, NIL_ADDR};
use crate::{Message, Schema, SchemaRef, UserKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Copy, Clone, Debug)]
struct RootInfo {
    addr: PageAddr,
    height: u8,
}

/// In-place B-tree backing one memtable slot
///
/// Writers descend with read latches and only write-latch the target
/// leaf; leaves carry right-sibling links, so a descent that raced a
/// split simply chases the sibling chain. Structural changes (splits,
/// root growth) are serialized by a per-tree lock and performed under
/// top-down write latches.
///
/// Insert-only: deletes are tombstone messages, duplicate inserts merge
/// in place.
pub struct DynamicTree {
    cache: Arc<PageCache>,
    schema: SchemaRef,
    block: Arc<BlockAllocator>,
    mini: Mutex<Option<MiniAllocator>>,

    root: Mutex<RootInfo>,

    /// Serializes splits and root growth
    split_lock: Mutex<()>,

    item_count: AtomicU64,
    size_bytes: AtomicU64,
}

impl DynamicTree {
    /// Creates an empty tree with a single leaf root.
    pub fn new(
        cache: Arc<PageCache>,
        schema: SchemaRef,
        block: Arc<BlockAllocator>,
    ) -> crate::Result<Self> {
        let mini = MiniAllocator::new(block.clone(), cache.page_size() as u64, 1);

        let root_addr = mini.alloc_page(0)?;
        let mini = Mutex::new(Some(mini));
        let handle = cache.alloc_at(root_addr, PageType::BtreeLeaf)?;
        {
            let mut guard = handle.lock();
            node::init(&mut guard, PageType::BtreeLeaf);
        }
        drop(handle);

        Ok(Self {
            cache,
            schema,
            block,
            mini,
            root: Mutex::new(RootInfo {
                addr: root_addr,
                height: 0,
            }),
            split_lock: Mutex::new(()),
            item_count: AtomicU64::new(0),
            size_bytes: AtomicU64::new(0),
        })
    }

    #[allow(clippy::expect_used)]
    fn root_info(&self) -> RootInfo {
        *self.root.lock().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    fn alloc_page(&self) -> crate::Result<PageAddr> {
        self.mini
            .lock()
            .expect("lock is poisoned")
            .as_ref()
            .ok_or(crate::Error::InvalidState("tree was disposed"))?
            .alloc_page(0)
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.item_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate payload bytes written into the tree.
    #[must_use]
    pub fn approximate_size(&self) -> u64 {
        self.size_bytes.load(Ordering::Acquire)
    }

    fn account(&self, key: &[u8], msg: &Message, new_key: bool) {
        if new_key {
            self.item_count.fetch_add(1, Ordering::AcqRel);
        }
        self.size_bytes
            .fetch_add((key.len() + msg.value.len() + 8) as u64, Ordering::AcqRel);
    }

    /// Descends to the leaf that should hold `key`, chasing sibling
    /// links where a raced split left the path stale.
    fn find_leaf(&self, key: &[u8]) -> crate::Result<PageHandle> {
        let info = self.root_info();

        let mut addr = info.addr;
        let mut height = info.height;

        let mut handle = self.cache.get(addr)?;

        while height > 0 {
            let child = {
                let guard = handle.read();
                node::expect_type(&guard, PageType::BtreeIndex)?;
                let i = node::index_find_child(&guard, key, &*self.schema);
                node::index_child(&guard, i)
            };

            addr = child;
            height -= 1;
            handle = self.cache.get(addr)?;
        }

        // Blink step: a split may have moved the key range rightwards.
        loop {
            let next = {
                let guard = handle.read();
                node::expect_type(&guard, PageType::BtreeLeaf)?;

                let n = node::entry_count(&guard);
                let next = node::next_leaf(&guard);

                if next == NIL_ADDR || n == 0 {
                    break;
                }

                match node::find(&guard, key, &*self.schema) {
                    Ok(_) => break,
                    Err(pos) if pos < n => break,
                    Err(_) => next,
                }
            };

            // Key sorts past this leaf; it belongs here only if the
            // sibling starts beyond it.
            let sibling = self.cache.get(next)?;
            {
                let guard = sibling.read();
                node::expect_type(&guard, PageType::BtreeLeaf)?;

                if node::entry_count(&guard) == 0
                    || self.schema.compare(key, node::key_at(&guard, 0))
                        == std::cmp::Ordering::Less
                {
                    break;
                }
            }
            handle = sibling;
        }

        Ok(handle)
    }

    /// Inserts a message, merging over an existing message for the key.
    #[allow(clippy::expect_used)]
    pub fn insert(&self, key: &[u8], msg: &Message) -> crate::Result<()> {
        loop {
            let handle = self.find_leaf(key)?;
            handle.claim_wait();
            let mut guard = handle.lock();

            // Re-validate under the latch; the leaf may have split since.
            let n = node::entry_count(&guard);
            let pos = node::find(&guard, key, &*self.schema);

            if let Err(p) = pos {
                if p == n && n > 0 {
                    let next = node::next_leaf(&guard);
                    if next != NIL_ADDR {
                        // The key sorts past this leaf; it only belongs
                        // here if the right sibling starts beyond it.
                        let sibling = self.cache.get(next)?;
                        let stale = {
                            let sguard = sibling.read();
                            node::entry_count(&sguard) > 0
                                && self.schema.compare(key, node::key_at(&sguard, 0))
                                    != std::cmp::Ordering::Less
                        };
                        if stale {
                            drop(guard);
                            drop(handle);
                            continue;
                        }
                    }
                }
            }

            match pos {
                Ok(i) => {
                    let old = node::leaf_message(&guard, i);
                    let merged = fold_step(&*self.schema, key, msg, &old);

                    node::remove_at(&mut guard, i);
                    node::compact(&mut guard);

                    if node::leaf_has_room(&guard, key.len(), merged.value.len()) {
                        let p = node::find(&guard, key, &*self.schema)
                            .err()
                            .expect("key was removed");
                        let ok = node::leaf_insert_at(&mut guard, p, key, &merged);
                        debug_assert!(ok);
                        self.account(key, msg, false);
                        return Ok(());
                    }

                    // Undo, then go through the split path with the
                    // merged message.
                    let p = node::find(&guard, key, &*self.schema)
                        .err()
                        .expect("key was removed");
                    let ok = node::leaf_insert_at(&mut guard, p, key, &old);
                    debug_assert!(ok);

                    drop(guard);
                    drop(handle);
                    self.insert_with_splits(key, msg)?;
                    self.account(key, msg, false);
                    return Ok(());
                }
                Err(p) => {
                    if node::leaf_insert_at(&mut guard, p, key, msg) {
                        self.account(key, msg, true);
                        return Ok(());
                    }

                    node::compact(&mut guard);
                    if node::leaf_insert_at(&mut guard, p, key, msg) {
                        self.account(key, msg, true);
                        return Ok(());
                    }

                    drop(guard);
                    drop(handle);
                    self.insert_with_splits(key, msg)?;
                    self.account(key, msg, true);
                    return Ok(());
                }
            }
        }
    }

    /// Pessimistic insert: serialized, top-down write-latched descent
    /// that splits full nodes along the way.
    #[allow(clippy::expect_used)]
    fn insert_with_splits(&self, key: &[u8], msg: &Message) -> crate::Result<()> {
        let _structural = self.split_lock.lock().expect("lock is poisoned");

        // Root changes only under the split lock, so this is stable.
        let info = self.root_info();

        let handle = self.cache.get(info.addr)?;
        handle.claim_wait();
        let mut guard = handle.lock();

        let split = self.insert_rec(&mut guard, info.height, key, msg)?;

        if let Some((pivot, right_addr)) = split {
            let new_root_addr = self.alloc_page()?;
            let new_root = self.cache.alloc_at(new_root_addr, PageType::BtreeIndex)?;
            {
                let mut root_guard = new_root.lock();
                node::init(&mut root_guard, PageType::BtreeIndex);
                let ok = node::index_insert_at(&mut root_guard, 0, b"", info.addr, 0);
                debug_assert!(ok);
                let ok = node::index_insert_at(&mut root_guard, 1, &pivot, right_addr, 0);
                debug_assert!(ok);
            }

            // Publish while still holding the old root's latch: a racer
            // that latches the old page afterwards sees the new root.
            let mut root = self.root.lock().expect("lock is poisoned");
            root.addr = new_root_addr;
            root.height = info.height + 1;
        }

        drop(guard);
        Ok(())
    }

    /// Returns `Some((pivot, right_addr))` if this node split.
    #[allow(clippy::expect_used)]
    fn insert_rec(
        &self,
        guard: &mut PageWriteGuard<'_>,
        height: u8,
        key: &[u8],
        msg: &Message,
    ) -> crate::Result<Option<(UserKey, PageAddr)>> {
        if height == 0 {
            return self.leaf_insert_splitting(guard, key, msg);
        }

        let child_idx = node::index_find_child(guard, key, &*self.schema);
        let child_addr = node::index_child(guard, child_idx);

        let child_handle = self.cache.get(child_addr)?;
        child_handle.claim_wait();
        let mut child_guard = child_handle.lock();

        let split = self.insert_rec(&mut child_guard, height - 1, key, msg)?;
        drop(child_guard);
        drop(child_handle);

        let Some((pivot, right_addr)) = split else {
            return Ok(None);
        };

        let pos = match node::find(guard, &pivot, &*self.schema) {
            Ok(_) => return Err(crate::Error::Corrupt("duplicate pivot")),
            Err(pos) => pos,
        };

        if node::index_insert_at(guard, pos, &pivot, right_addr, 0) {
            return Ok(None);
        }

        node::compact(guard);
        if node::index_insert_at(guard, pos, &pivot, right_addr, 0) {
            return Ok(None);
        }

        // This index node is full too; split it and place the pending
        // pivot on the proper side.
        let right_index_addr = self.alloc_page()?;
        let right_index = self.cache.alloc_at(right_index_addr, PageType::BtreeIndex)?;
        let mut right_guard = right_index.lock();

        let promoted = node::index_split(guard, &mut right_guard);

        if self.schema.compare(&pivot, &promoted) == std::cmp::Ordering::Less {
            let pos = match node::find(guard, &pivot, &*self.schema) {
                Ok(_) => return Err(crate::Error::Corrupt("duplicate pivot")),
                Err(pos) => pos,
            };
            let ok = node::index_insert_at(guard, pos, &pivot, right_addr, 0);
            debug_assert!(ok, "index half must have room");
        } else {
            let pos = match node::find(&mut right_guard, &pivot, &*self.schema) {
                Ok(_) => return Err(crate::Error::Corrupt("duplicate pivot")),
                Err(pos) => pos,
            };
            let ok = node::index_insert_at(&mut right_guard, pos, &pivot, right_addr, 0);
            debug_assert!(ok, "index half must have room");
        }

        Ok(Some((promoted, right_index_addr)))
    }

    fn leaf_insert_splitting(
        &self,
        guard: &mut PageWriteGuard<'_>,
        key: &[u8],
        msg: &Message,
    ) -> crate::Result<Option<(UserKey, PageAddr)>> {
        // Merge over an existing entry first.
        let pending = match node::find(guard, key, &*self.schema) {
            Ok(i) => {
                let old = node::leaf_message(guard, i);
                let merged = fold_step(&*self.schema, key, msg, &old);
                node::remove_at(guard, i);
                merged
            }
            Err(_) => msg.clone(),
        };

        node::compact(guard);

        if node::leaf_has_room(guard, key.len(), pending.value.len()) {
            let pos = match node::find(guard, key, &*self.schema) {
                Ok(_) => return Err(crate::Error::Corrupt("duplicate key after remove")),
                Err(pos) => pos,
            };
            let ok = node::leaf_insert_at(guard, pos, key, &pending);
            debug_assert!(ok);
            return Ok(None);
        }

        let right_addr = self.alloc_page()?;
        let right_handle = self.cache.alloc_at(right_addr, PageType::BtreeLeaf)?;
        let mut right_guard = right_handle.lock();

        let pivot = node::leaf_split(guard, &mut right_guard);
        node::set_next_leaf(guard, right_addr);

        if self.schema.compare(key, &pivot) == std::cmp::Ordering::Less {
            let pos = match node::find(guard, key, &*self.schema) {
                Ok(_) => return Err(crate::Error::Corrupt("duplicate key after split")),
                Err(pos) => pos,
            };
            let ok = node::leaf_insert_at(guard, pos, key, &pending);
            debug_assert!(ok, "leaf half must have room");
        } else {
            let pos = match node::find(&mut right_guard, key, &*self.schema) {
                Ok(_) => return Err(crate::Error::Corrupt("duplicate key after split")),
                Err(pos) => pos,
            };
            let ok = node::leaf_insert_at(&mut right_guard, pos, key, &pending);
            debug_assert!(ok, "leaf half must have room");
        }

        Ok(Some((pivot, right_addr)))
    }

    /// Point lookup.
    pub fn lookup(&self, key: &[u8]) -> crate::Result<Option<Message>> {
        let handle = self.find_leaf(key)?;
        let guard = handle.read();

        Ok(match node::find(&guard, key, &*self.schema) {
            Ok(i) => Some(node::leaf_message(&guard, i)),
            Err(_) => None,
        })
    }

    /// Iterates all entries in key order.
    pub fn iter(&self) -> crate::Result<DynTreeIter> {
        let info = self.root_info();

        // Descend along the leftmost spine.
        let mut addr = info.addr;
        let mut height = info.height;

        while height > 0 {
            let handle = self.cache.get(addr)?;
            let guard = handle.read();
            node::expect_type(&guard, PageType::BtreeIndex)?;
            addr = node::index_child(&guard, 0);
            height -= 1;
        }

        Ok(DynTreeIter {
            cache: self.cache.clone(),
            next_addr: addr,
            entries: std::collections::VecDeque::new(),
        })
    }

    /// Iterates entries with keys `>= start`.
    pub fn iter_from(&self, start: &[u8]) -> crate::Result<DynTreeIter> {
        let handle = self.find_leaf(start)?;
        let addr = handle.addr();
        drop(handle);

        let mut iter = DynTreeIter {
            cache: self.cache.clone(),
            next_addr: addr,
            entries: std::collections::VecDeque::new(),
        };
        iter.load_next()?;

        let schema = self.schema.clone();
        while let Some(front) = iter.entries.front() {
            if schema.compare(&front.key, start) == std::cmp::Ordering::Less {
                iter.entries.pop_front();
            } else {
                break;
            }
        }

        Ok(iter)
    }

    /// Releases the tree's pages back to the block allocator.
    ///
    /// The tree must not be used afterwards; callers defer this until no
    /// reader can still hold a reference.
    #[allow(clippy::expect_used)]
    pub fn dispose(&self) {
        if let Some(mini) = self.mini.lock().expect("lock is poisoned").take() {
            for extent in mini.release() {
                self.block.dec_ref(extent);
            }
        }
    }
}

/// Leaf-chain iterator over a [`DynamicTree`]
pub struct DynTreeIter {
    cache: Arc<PageCache>,
    next_addr: PageAddr,
    entries: std::collections::VecDeque<node::LeafEntry>,
}

impl DynTreeIter {
    fn load_next(&mut self) -> crate::Result<()> {
        while self.entries.is_empty() && self.next_addr != NIL_ADDR {
            let handle = self.cache.get(self.next_addr)?;
            let guard = handle.read();
            node::expect_type(&guard, PageType::BtreeLeaf)?;

            self.entries = node::leaf_entries(&guard).into();
            self.next_addr = node::next_leaf(&guard);
        }
        Ok(())
    }
}

impl Iterator for DynTreeIter {
    type Item = crate::Result<(UserKey, Message)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.entries.is_empty() {
            fail_iter!(self.load_next());
        }

        let entry = self.entries.pop_front()?;
        Some(Ok((entry.key, entry.msg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DramStore, PageStore};
    use crate::ByteSchema;
    use test_log::test;

    fn tree() -> DynamicTree {
        let store = PageStore::Dram(DramStore::new(16 * 1_024 * 1_024));
        let cache = PageCache::new(store, 4 * 1_024 * 1_024, 4_096);
        let block = Arc::new(BlockAllocator::new(4_096, 32, 16 * 1_024 * 1_024));

        #[allow(clippy::unwrap_used)]
        DynamicTree::new(cache, Arc::new(ByteSchema), block).unwrap()
    }

    #[test]
    fn insert_lookup_round_trip() -> crate::Result<()> {
        let tree = tree();

        tree.insert(b"hello", &Message::insert(*b"world"))?;

        let msg = tree.lookup(b"hello")?.expect("must exist");
        assert_eq!(*b"world", &*msg.value);

        assert_eq!(None, tree.lookup(b"missing")?);
        Ok(())
    }

    #[test]
    fn overwrite_merges_in_place() -> crate::Result<()> {
        let tree = tree();

        tree.insert(b"k", &Message::insert(*b"v1"))?;
        tree.insert(b"k", &Message::insert(*b"v2"))?;

        let msg = tree.lookup(b"k")?.expect("must exist");
        assert_eq!(*b"v2", &*msg.value);
        assert_eq!(1, tree.len());

        Ok(())
    }

    #[test]
    fn many_keys_split_and_stay_sorted() -> crate::Result<()> {
        let tree = tree();

        let n = 10_000u32;
        for i in (0..n).rev() {
            let key = format!("{i:010}");
            let value = format!("value-{i}");
            tree.insert(key.as_bytes(), &Message::insert(value.into_bytes()))?;
        }

        assert_eq!(u64::from(n), tree.len());

        // Point lookups
        for i in [0u32, 1, 4_999, 9_999] {
            let key = format!("{i:010}");
            let msg = tree.lookup(key.as_bytes())?.expect("must exist");
            assert_eq!(format!("value-{i}").as_bytes(), &*msg.value);
        }

        // Full scan in order
        let mut count = 0u32;
        for item in tree.iter()? {
            let (key, _) = item?;
            assert_eq!(format!("{count:010}").as_bytes(), &*key);
            count += 1;
        }
        assert_eq!(n, count);

        Ok(())
    }

    #[test]
    fn tombstones_are_stored() -> crate::Result<()> {
        let tree = tree();

        tree.insert(b"k", &Message::insert(*b"v"))?;
        tree.insert(b"k", &Message::delete())?;

        let msg = tree.lookup(b"k")?.expect("tombstone is an entry");
        assert!(msg.is_tombstone());

        Ok(())
    }

    #[test]
    fn iter_from_seeks() -> crate::Result<()> {
        let tree = tree();

        for i in 0..100u32 {
            let key = format!("{i:04}");
            tree.insert(key.as_bytes(), &Message::insert(*b"x"))?;
        }

        let mut iter = tree.iter_from(b"0042")?;
        let (key, _) = iter.next().expect("has entries")?;
        assert_eq!(b"0042", &*key);

        Ok(())
    }

    #[test]
    fn concurrent_inserts() -> crate::Result<()> {
        let tree = Arc::new(tree());

        let mut handles = Vec::new();
        for t in 0..4u32 {
            let tree = tree.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..2_000u32 {
                    let key = format!("t{t}-{i:06}");
                    tree.insert(key.as_bytes(), &Message::insert(*b"v"))
                        .expect("insert");
                }
            }));
        }

        for handle in handles {
            #[allow(clippy::unwrap_used)]
            handle.join().unwrap();
        }

        assert_eq!(8_000, tree.len());

        let mut last: Option<UserKey> = None;
        let mut count = 0;
        for item in tree.iter()? {
            let (key, _) = item?;
            if let Some(prev) = &last {
                assert!(&*prev < &*key, "keys must be strictly increasing");
            }
            last = Some(key);
            count += 1;
        }
        assert_eq!(8_000, count);

        Ok(())
    }
}
