// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::alloc::BlockAllocator;
use crate::btree::{packed, PackedIter, PackedTree};
use crate::cache::PageCache;
use crate::store::PageAddr;
use crate::{Message, Schema, SchemaRef, UserKey};
use std::sync::Arc;

/// An immutable on-disk B-tree plus its persisted routing filter
///
/// Branches are produced by memtable flushes and compactions, probed
/// during lookups, and released as a unit (their extent group) once no
/// trunk node references them anymore.
#[derive(Debug)]
pub struct Branch {
    /// The packed B-tree
    pub tree: PackedTree,

    /// Creation stamp; larger = created later
    pub age: u64,

    /// Head of the persisted filter page chain (0 = none)
    pub filter_addr: PageAddr,

    /// Extents owned by this branch (tree pages + filter pages)
    pub extents: Vec<PageAddr>,
}

impl Branch {
    /// Number of packed entries.
    #[must_use]
    pub fn tuple_count(&self) -> u64 {
        self.tree.tuple_count
    }

    /// Point probe into the branch's B-tree.
    pub fn probe(
        &self,
        cache: &Arc<PageCache>,
        schema: &dyn Schema,
        key: &[u8],
    ) -> crate::Result<Option<Message>> {
        packed::lookup(cache, schema, self.tree.root, self.tree.height, key)
    }

    /// Iterator over `[start, end)` of the branch.
    pub fn range_iter(
        &self,
        cache: Arc<PageCache>,
        schema: SchemaRef,
        start: Option<&[u8]>,
        end: Option<UserKey>,
    ) -> crate::Result<PackedIter> {
        PackedIter::new(
            cache,
            schema,
            self.tree.root,
            self.tree.height,
            start,
            end,
        )
    }

    /// Releases the branch's extents.
    pub fn release(&self, block: &BlockAllocator) {
        for extent in &self.extents {
            block.dec_ref(*extent);
        }
    }
}
