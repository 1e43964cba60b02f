// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::node;
use crate::alloc::{BlockAllocator, MiniAllocator};
use crate::cache::PageCache;
use crate::store::{PageAddr, PageType, NIL_ADDR};
use crate::{KeyRange, Message, Schema, SchemaRef, UserKey};
use std::sync::Arc;

/// Result of a bulk pack: an immutable on-disk B-tree
#[derive(Clone, Debug)]
pub struct PackedTree {
    /// Root page address
    pub root: PageAddr,

    /// 0 = the root is a leaf
    pub height: u8,

    /// Number of packed entries
    pub tuple_count: u64,

    /// [min, max] of the packed keys
    pub key_range: KeyRange,

    /// Extents owned by this tree, released as a unit
    pub extents: Vec<PageAddr>,
}

/// Bulk-builds a packed B-tree from a sorted `(key, message)` stream
///
/// Leaves are filled to a target utilization and linked left to right;
/// pivots are emitted bottom-up. All pages come out of one
/// mini-allocator, so the finished tree occupies a compact group of
/// extents that is freed atomically.
pub struct PackedWriter {
    cache: Arc<PageCache>,
    schema: SchemaRef,
    mini: MiniAllocator,

    page_size: usize,
    fill_limit: usize,

    scratch: Vec<u8>,
    first_key: Option<UserKey>,
    prev_leaf: PageAddr,

    /// (first key, page, entry count) per finished leaf
    leaves: Vec<(UserKey, PageAddr, u64)>,

    last_key: Option<UserKey>,
    tuple_count: u64,
    min_key: Option<UserKey>,
    max_key: Option<UserKey>,
}

impl PackedWriter {
    /// Default leaf fill target.
    pub const DEFAULT_UTILIZATION: f32 = 0.75;

    pub fn new(
        cache: Arc<PageCache>,
        block: Arc<BlockAllocator>,
        schema: SchemaRef,
        utilization: f32,
    ) -> Self {
        let page_size = cache.page_size();
        let mini = MiniAllocator::new(block, page_size as u64, 1);

        let payload = page_size - node::HEADER_LEN;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let fill_limit = (payload as f32 * utilization.clamp(0.1, 1.0)) as usize;

        let mut scratch = vec![0; page_size];
        node::init(&mut scratch, PageType::BtreeLeaf);

        Self {
            cache,
            schema,
            mini,
            page_size,
            fill_limit,
            scratch,
            first_key: None,
            prev_leaf: NIL_ADDR,
            leaves: Vec::new(),
            last_key: None,
            tuple_count: 0,
            min_key: None,
            max_key: None,
        }
    }

    fn used_bytes(&self) -> usize {
        self.page_size - node::HEADER_LEN - node::free_space(&self.scratch)
    }

    /// Appends one entry. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &UserKey, msg: &Message) -> crate::Result<()> {
        if let Some(last) = &self.last_key {
            debug_assert!(
                self.schema.compare(last, key) == std::cmp::Ordering::Less,
                "pack input must be strictly sorted"
            );
        }

        let full = !node::leaf_has_room(&self.scratch, key.len(), msg.value.len())
            || (node::entry_count(&self.scratch) > 0 && self.used_bytes() >= self.fill_limit);

        if full {
            self.close_leaf()?;
        }

        let pos = node::entry_count(&self.scratch);
        if !node::leaf_insert_at(&mut self.scratch, pos, key, msg) {
            // A single cell larger than a page cannot be packed.
            return Err(crate::Error::BadParam("entry exceeds page capacity"));
        }

        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        if self.min_key.is_none() {
            self.min_key = Some(key.clone());
        }
        self.max_key = Some(key.clone());
        self.last_key = Some(key.clone());
        self.tuple_count += 1;

        Ok(())
    }

    /// Writes the scratch leaf into the cache and links the chain.
    #[allow(clippy::cast_possible_truncation)]
    fn close_leaf(&mut self) -> crate::Result<()> {
        let count = node::entry_count(&self.scratch) as u64;
        if count == 0 {
            return Ok(());
        }

        let addr = self.mini.alloc_page(0)?;

        let handle = self.cache.alloc_at(addr, PageType::BtreeLeaf)?;
        {
            let mut guard = handle.lock();
            guard.copy_from_slice(&self.scratch);
        }
        drop(handle);

        if self.prev_leaf != NIL_ADDR {
            let prev = self.cache.get(self.prev_leaf)?;
            prev.claim_wait();
            let mut guard = prev.lock();
            node::set_next_leaf(&mut guard, addr);
        }
        self.prev_leaf = addr;

        #[allow(clippy::expect_used)]
        let first_key = self.first_key.take().expect("leaf has entries");
        self.leaves.push((first_key, addr, count));

        node::init(&mut self.scratch, PageType::BtreeLeaf);
        Ok(())
    }

    /// Builds the index levels bottom-up and returns the finished tree,
    /// or `None` if nothing was added.
    pub fn finish(mut self) -> crate::Result<Option<PackedTree>> {
        self.close_leaf()?;

        if self.leaves.is_empty() {
            // Nothing packed; the mini-allocator pulled no extents.
            debug_assert_eq!(0, self.mini.extent_count());
            return Ok(None);
        }

        let mut level: Vec<(UserKey, PageAddr, u64)> = std::mem::take(&mut self.leaves);
        let mut height = 0u8;

        while level.len() > 1 {
            // The leftmost node of each level catches keys below the
            // smallest packed key.
            if let Some(first) = level.first_mut() {
                first.0 = UserKey::empty();
            }

            let mut next_level: Vec<(UserKey, PageAddr, u64)> = Vec::new();

            let mut scratch = vec![0; self.page_size];
            node::init(&mut scratch, PageType::BtreeIndex);
            let mut node_first: Option<UserKey> = None;
            let mut node_tuples = 0u64;

            for (pivot, child, count) in level {
                let fits = node::index_has_room(&scratch, pivot.len())
                    && (node::entry_count(&scratch) == 0
                        || self.page_size - node::HEADER_LEN - node::free_space(&scratch)
                            < self.fill_limit);

                if !fits {
                    let addr = self.write_index_page(&scratch)?;

                    #[allow(clippy::expect_used)]
                    next_level.push((
                        node_first.take().expect("index node has entries"),
                        addr,
                        node_tuples,
                    ));

                    node::init(&mut scratch, PageType::BtreeIndex);
                    node_tuples = 0;
                }

                let pos = node::entry_count(&scratch);
                let ok = node::index_insert_at(&mut scratch, pos, &pivot, child, count);
                debug_assert!(ok);

                if node_first.is_none() {
                    node_first = Some(pivot);
                }
                node_tuples += count;
            }

            if node::entry_count(&scratch) > 0 {
                let addr = self.write_index_page(&scratch)?;

                #[allow(clippy::expect_used)]
                next_level.push((
                    node_first.take().expect("index node has entries"),
                    addr,
                    node_tuples,
                ));
            }

            level = next_level;
            height += 1;
        }

        #[allow(clippy::expect_used)]
        let (_, root, _) = level.pop().expect("at least one node");

        #[allow(clippy::expect_used)]
        let key_range = KeyRange::new((
            self.min_key.clone().expect("non-empty"),
            self.max_key.clone().expect("non-empty"),
        ));

        Ok(Some(PackedTree {
            root,
            height,
            tuple_count: self.tuple_count,
            key_range,
            extents: self.mini.release(),
        }))
    }

    fn write_index_page(&self, scratch: &[u8]) -> crate::Result<PageAddr> {
        let addr = self.mini.alloc_page(0)?;

        let handle = self.cache.alloc_at(addr, PageType::BtreeIndex)?;
        {
            let mut guard = handle.lock();
            guard.copy_from_slice(scratch);
        }

        Ok(addr)
    }
}
