// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Trunk compaction: pushing branch data down one pivot band at a time,
//! rewriting overfull trunk leaves, and splitting nodes whose key range
//! outgrew its budget.
//!
//! Structural work on a node is serialized by its structural lock;
//! state mutations are generation-checked, so a snapshot invalidated by
//! a concurrent install is simply retried.
//!
//! Locking protocol: every state access goes through the node's
//! [`crate::cache::BandLock`] — snapshots take the read side with the
//! worker's thread id, applies take the write side. Band and state
//! locks are acquired parent before child, band before state, so
//! writers touching two levels never deadlock.

use super::{Branch, BranchSlot, NodeId, NodeState, Trunk, TrunkNode};
use crate::alloc::MiniAllocator;
use crate::btree::{PackedTree, PackedWriter};
use crate::cache::BandLock;
use crate::filter::{write_filter, RoutingFilter};
use crate::hash::{hash_key, KeyHash};
use crate::merge::{BoxedIterator, FoldedIter, Merger};
use crate::UserKey;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};

/// A packed branch plus the key hashes needed for node filters
pub(crate) struct PackedPiece {
    pub branch: Branch,
    pub hashes: Vec<KeyHash>,
}

/// Expands band `pos` of a live-band mask into `n` bands.
fn remap_mask(mask: u64, pos: usize, n: usize) -> u64 {
    let below = mask & ((1u64 << pos) - 1);
    let bit = (mask >> pos) & 1;
    let above = mask >> (pos + 1);

    let expanded = if bit == 1 { (1u64 << n) - 1 } else { 0 };

    let above_shift = pos + n;
    let above = if above_shift >= 64 { 0 } else { above << above_shift };

    below | (expanded << pos) | above
}

impl Trunk {
    /// Compacts one node: internal nodes flush their bands downwards,
    /// overfull leaves are rewritten or split.
    ///
    /// `tid` is the registered id of the compacting thread. Returns
    /// nodes that need attention next (children that filled up,
    /// parents that must split).
    #[allow(clippy::expect_used)]
    pub fn compact_node(&self, tid: usize, id: NodeId) -> crate::Result<Vec<NodeId>> {
        let node = self.node(id);
        let _structural = node.structural_lock.lock().expect("lock is poisoned");

        let (is_leaf, live_branches, tuples, children) = {
            let _band = node.band.read(tid);
            let state = node.state.read().expect("lock is poisoned");
            (
                state.children.is_empty(),
                state.branches.iter().filter(|b| b.live_bands != 0).count(),
                state.tuple_count(),
                state.children.clone(),
            )
        };

        if is_leaf {
            if tuples > self.config.leaf_split_tuples {
                return self.split_leaf(tid, &node);
            }

            if live_branches > self.config.max_branches {
                self.rewrite_leaf(tid, &node)?;
            }
            return Ok(Vec::new());
        }

        if children.len() >= self.config.max_pivots {
            return self.split_internal(tid, &node);
        }

        let start = std::time::Instant::now();
        let mut band = 0;
        loop {
            let band_count = {
                let _band = node.band.read(tid);
                let state = node.state.read().expect("lock is poisoned");
                state.band_count()
            };
            if band >= band_count {
                break;
            }

            self.compact_band(tid, &node, band)?;
            band += 1;
        }

        log::debug!("compacted node {id} in {:?}", start.elapsed());

        // Children that filled up want compaction next
        let follow_ups = children
            .into_iter()
            .filter(|child| {
                let child = self.node(*child);
                let _band = child.band.read(tid);
                let state = child.state.read().expect("lock is poisoned");
                let live = state.branches.iter().filter(|b| b.live_bands != 0).count();

                live > self.config.max_branches
                    || (state.children.is_empty()
                        && state.tuple_count() > self.config.leaf_split_tuples)
            })
            .collect();

        Ok(follow_ups)
    }

    /// Merges one pivot band of `node` into the child below it.
    ///
    /// Caller holds the node's structural lock.
    #[allow(clippy::expect_used)]
    pub(crate) fn compact_band(
        &self,
        tid: usize,
        node: &Arc<TrunkNode>,
        band: usize,
    ) -> crate::Result<()> {
        loop {
            let (snapshot_gen, consumed, child_id, lo, hi) = {
                let _band = node.band.read(tid);
                let state = node.state.read().expect("lock is poisoned");

                if state.children.is_empty() || band >= state.band_count() {
                    return Ok(());
                }

                let band_bit = 1u64 << band;
                let consumed: Vec<(u8, Arc<Branch>)> = state
                    .branches
                    .iter()
                    .filter(|b| b.live_bands & band_bit != 0)
                    .map(|b| (b.slot, b.branch.clone()))
                    .collect();

                let (lo, hi) = state.band_range(band);
                (state.generation, consumed, state.children[band], lo, hi)
            };

            if consumed.is_empty() {
                return Ok(());
            }

            let mut sources: Vec<BoxedIterator<'_>> = Vec::new();
            for (_, branch) in &consumed {
                let start: Option<&[u8]> = if lo.is_empty() { None } else { Some(&lo) };
                let iter =
                    branch.range_iter(self.cache.clone(), self.schema.clone(), start, hi.clone())?;
                sources.push(Box::new(iter));
            }

            let piece = self
                .pack_folded(sources, false, None)?
                .into_iter()
                .next();

            if self.apply_band_move(tid, node, band, snapshot_gen, &consumed, child_id, piece)? {
                return Ok(());
            }

            log::trace!("band {band} compaction raced an install; retrying");
        }
    }

    /// Installs the packed band at the child and consumes the band in
    /// the parent, atomically with respect to node state readers.
    ///
    /// Returns `false` if the snapshot went stale.
    #[allow(clippy::expect_used)]
    #[allow(clippy::too_many_arguments)]
    fn apply_band_move(
        &self,
        tid: usize,
        node: &Arc<TrunkNode>,
        band: usize,
        snapshot_gen: u64,
        consumed: &[(u8, Arc<Branch>)],
        child_id: NodeId,
        piece: Option<PackedPiece>,
    ) -> crate::Result<bool> {
        // Make room in the child before taking both write bands.
        if piece.is_some() {
            loop {
                let full = {
                    let child = self.node(child_id);
                    let _band = child.band.read(tid);
                    let state = child.state.read().expect("lock is poisoned");
                    state.used_slots == u64::MAX
                };
                if !full {
                    break;
                }
                self.compact_node(tid, child_id)?;
            }
        }

        let child = self.node(child_id);

        let parent_band = node.band.write();
        let mut parent_state = node.state.write().expect("lock is poisoned");

        if parent_state.generation != snapshot_gen {
            if let Some(piece) = piece {
                piece.branch.release(&self.block);
            }
            return Ok(false);
        }

        let child_band = child.band.write();
        let mut child_state = child.state.write().expect("lock is poisoned");

        if let Some(piece) = piece {
            let Some(slot) = child_state.alloc_slot() else {
                drop(child_state);
                drop(child_band);
                drop(parent_state);
                drop(parent_band);
                piece.branch.release(&self.block);
                self.compact_node(tid, child_id)?;
                return Ok(false);
            };

            child_state.filter.add_branch(&piece.hashes, slot);

            let live_bands = child_state.all_bands_mask();
            child_state.branches.insert(
                0,
                BranchSlot {
                    branch: Arc::new(piece.branch),
                    slot,
                    live_bands,
                },
            );
            child_state.generation += 1;
        }

        let band_bit = 1u64 << band;
        for (slot, arc) in consumed {
            if let Some(bs) = parent_state
                .branches
                .iter_mut()
                .find(|b| b.slot == *slot && Arc::ptr_eq(&b.branch, arc))
            {
                bs.live_bands &= !band_bit;
            }
        }

        let mut dead_slots = Vec::new();
        let mut retired = Vec::new();
        parent_state.branches.retain(|b| {
            if b.live_bands == 0 {
                dead_slots.push(b.slot);
                retired.push(b.branch.clone());
                false
            } else {
                true
            }
        });
        for slot in dead_slots {
            parent_state.filter.remove_slot(slot);
            parent_state.free_slot(slot);
        }
        parent_state.generation += 1;

        drop(child_state);
        drop(child_band);
        drop(parent_state);
        drop(parent_band);

        for branch in retired {
            self.retire_branch(branch);
        }

        self.structure_gen.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Merges all branches of a trunk leaf into one.
    ///
    /// The leaf is the bottom of its key range, so tombstones are
    /// dropped here.
    #[allow(clippy::expect_used)]
    fn rewrite_leaf(&self, tid: usize, node: &Arc<TrunkNode>) -> crate::Result<()> {
        loop {
            let (snapshot_gen, consumed, lo, hi) = {
                let _band = node.band.read(tid);
                let state = node.state.read().expect("lock is poisoned");

                let consumed: Vec<(u8, Arc<Branch>)> = state
                    .branches
                    .iter()
                    .filter(|b| b.live_bands != 0)
                    .map(|b| (b.slot, b.branch.clone()))
                    .collect();

                (
                    state.generation,
                    consumed,
                    state.range_lo.clone(),
                    state.range_hi.clone(),
                )
            };

            if consumed.len() <= 1 {
                return Ok(());
            }

            let mut sources: Vec<BoxedIterator<'_>> = Vec::new();
            for (_, branch) in &consumed {
                let start: Option<&[u8]> = if lo.is_empty() { None } else { Some(&lo) };
                let iter =
                    branch.range_iter(self.cache.clone(), self.schema.clone(), start, hi.clone())?;
                sources.push(Box::new(iter));
            }

            let piece = self.pack_folded(sources, true, None)?.into_iter().next();

            let _band = node.band.write();
            let mut state = node.state.write().expect("lock is poisoned");
            if state.generation != snapshot_gen {
                if let Some(piece) = piece {
                    piece.branch.release(&self.block);
                }
                continue;
            }

            let mut retired = Vec::new();
            for (slot, arc) in &consumed {
                if let Some(pos) = state
                    .branches
                    .iter()
                    .position(|b| b.slot == *slot && Arc::ptr_eq(&b.branch, arc))
                {
                    let bs = state.branches.remove(pos);
                    retired.push(bs.branch);
                }
                state.filter.remove_slot(*slot);
                state.free_slot(*slot);
            }

            if let Some(piece) = piece {
                let slot = state.alloc_slot().expect("slots were just freed");
                state.filter.add_branch(&piece.hashes, slot);

                // Everything still in the list arrived after the
                // snapshot and is newer; the rewrite goes to the back.
                state.branches.push(BranchSlot {
                    branch: Arc::new(piece.branch),
                    slot,
                    live_bands: 1,
                });
            }

            state.generation += 1;
            drop(state);
            drop(_band);

            for branch in retired {
                self.retire_branch(branch);
            }

            log::debug!("rewrote trunk leaf {} ({} branches merged)", node.id, consumed.len());
            return Ok(());
        }
    }

    /// Splits an overgrown trunk leaf into `split_fanout` leaves.
    ///
    /// The leaf's content is fully merged and re-packed into one branch
    /// per new leaf, so each new leaf gets an exact filter. If the
    /// parent has no pivot headroom, the parent is split first.
    #[allow(clippy::expect_used)]
    fn split_leaf(&self, tid: usize, node: &Arc<TrunkNode>) -> crate::Result<Vec<NodeId>> {
        let (snapshot_gen, consumed, lo, hi, parent_id) = {
            let _band = node.band.read(tid);
            let state = node.state.read().expect("lock is poisoned");

            let consumed: Vec<(u8, Arc<Branch>)> = state
                .branches
                .iter()
                .filter(|b| b.live_bands != 0)
                .map(|b| (b.slot, b.branch.clone()))
                .collect();

            (
                state.generation,
                consumed,
                state.range_lo.clone(),
                state.range_hi.clone(),
                state.parent,
            )
        };

        if consumed.is_empty() {
            return Ok(Vec::new());
        }

        let fanout = self.config.split_fanout.max(2);

        if let Some(parent_id) = parent_id {
            let parent = self.node(parent_id);
            let _band = parent.band.read(tid);
            let state = parent.state.read().expect("lock is poisoned");
            if state.children.len() + fanout - 1 > self.config.max_pivots {
                // No pivot headroom; the parent must split first.
                return Ok(vec![parent_id]);
            }
        }

        let make_sources = |this: &Self| -> crate::Result<Vec<BoxedIterator<'static>>> {
            let mut sources: Vec<BoxedIterator<'static>> = Vec::new();
            for (_, branch) in &consumed {
                let start: Option<&[u8]> = if lo.is_empty() { None } else { Some(&lo) };
                let iter = branch.range_iter(
                    this.cache.clone(),
                    this.schema.clone(),
                    start,
                    hi.clone(),
                )?;
                sources.push(Box::new(iter));
            }
            Ok(sources)
        };

        // Pass 1: count surviving entries to find the cut size.
        let mut count = 0u64;
        {
            let merger = Merger::new(self.schema.clone(), make_sources(self)?);
            for item in FoldedIter::new(self.schema.clone(), merger) {
                let (_, msg) = item?;
                if !msg.is_tombstone() {
                    count += 1;
                }
            }
        }

        if count < 2 {
            return Ok(Vec::new());
        }

        let cut = count.div_ceil(fanout as u64).max(1);

        // Pass 2: pack one branch per new leaf.
        let pieces = self.pack_folded(make_sources(self)?, true, Some(cut))?;

        if pieces.len() < 2 {
            for piece in pieces {
                piece.branch.release(&self.block);
            }
            return Ok(Vec::new());
        }

        self.apply_leaf_split(node, snapshot_gen, &consumed, lo, hi, parent_id, pieces)
    }

    #[allow(clippy::expect_used)]
    #[allow(clippy::too_many_arguments)]
    fn apply_leaf_split(
        &self,
        node: &Arc<TrunkNode>,
        snapshot_gen: u64,
        consumed: &[(u8, Arc<Branch>)],
        lo: UserKey,
        hi: Option<UserKey>,
        parent_id: Option<NodeId>,
        pieces: Vec<PackedPiece>,
    ) -> crate::Result<Vec<NodeId>> {
        let n = pieces.len();

        let separators: Vec<UserKey> = pieces
            .iter()
            .skip(1)
            .map(|p| p.branch.tree.key_range.min().clone())
            .collect();

        // Lock order: parent band/state before child band/state.
        let parent = parent_id.map(|id| self.node(id));
        let _parent_band = parent.as_ref().map(|p| p.band.write());
        let mut parent_state = parent
            .as_ref()
            .map(|p| p.state.write().expect("lock is poisoned"));

        let _node_band = node.band.write();
        let mut state = node.state.write().expect("lock is poisoned");

        if state.generation != snapshot_gen {
            for piece in pieces {
                piece.branch.release(&self.block);
            }
            return Ok(Vec::new());
        }

        if let Some(ps) = &parent_state {
            if ps.children.len() + n - 1 > self.config.max_pivots {
                for piece in pieces {
                    piece.branch.release(&self.block);
                }
                return Ok(parent_id.into_iter().collect());
            }
        }

        // Owner of the new leaves: the parent, or this node itself when
        // it is the root leaf turning into an internal node.
        let owner = parent_id.unwrap_or(node.id);

        let mut child_ids = Vec::with_capacity(n);
        for (i, piece) in pieces.into_iter().enumerate() {
            let leaf_lo = if i == 0 {
                lo.clone()
            } else {
                separators[i - 1].clone()
            };
            let leaf_hi = if i + 1 == n {
                hi.clone()
            } else {
                Some(separators[i].clone())
            };

            let mut leaf_state = NodeState {
                parent: Some(owner),
                range_lo: leaf_lo,
                range_hi: leaf_hi,
                separators: Vec::new(),
                children: Vec::new(),
                branches: Vec::new(),
                filter: RoutingFilter::new(
                    piece.hashes.len().max(16),
                    self.config.filter_fp_bits,
                ),
                used_slots: 0,
                generation: 0,
            };

            let slot = leaf_state.alloc_slot().expect("fresh node has slots");
            leaf_state.filter.add_branch(&piece.hashes, slot);
            leaf_state.branches.push(BranchSlot {
                branch: Arc::new(piece.branch),
                slot,
                live_bands: 1,
            });

            let id = {
                let mut arena = self.arena.write().expect("lock is poisoned");
                let id = arena.len();
                arena.push(Arc::new(TrunkNode {
                    id,
                    band: BandLock::new(),
                    state: RwLock::new(leaf_state),
                    structural_lock: Mutex::new(()),
                }));
                id
            };
            child_ids.push(id);
        }

        let mut retired = Vec::new();
        for (_, arc) in consumed {
            retired.push(arc.clone());
        }

        let follow_ups = if let Some(ps) = parent_state.as_mut() {
            // Splice the new leaves into the parent's band structure.
            let pos = ps
                .children
                .iter()
                .position(|c| *c == node.id)
                .expect("node must be its parent's child");

            for bs in &mut ps.branches {
                bs.live_bands = remap_mask(bs.live_bands, pos, n);
            }

            ps.children.splice(pos..=pos, child_ids.iter().copied());
            for (i, sep) in separators.iter().enumerate() {
                ps.separators.insert(pos + i, sep.clone());
            }
            ps.generation += 1;

            // The old leaf is now unreachable.
            state.branches.clear();
            state.used_slots = 0;
            state.generation += 1;

            if ps.children.len() >= self.config.max_pivots {
                parent_id.into_iter().collect()
            } else {
                Vec::new()
            }
        } else {
            // Root leaf becomes an internal node over the new leaves.
            state.children = child_ids;
            state.separators = separators;
            state.branches.clear();
            state.used_slots = 0;
            state.filter = RoutingFilter::new(1_024, self.config.filter_fp_bits);
            state.generation += 1;
            Vec::new()
        };

        drop(state);
        drop(parent_state);

        for branch in retired {
            self.retire_branch(branch);
        }

        self.structure_gen.fetch_add(1, Ordering::AcqRel);
        log::info!("split trunk leaf {} into {n} leaves", node.id);

        Ok(follow_ups)
    }

    /// Splits an internal node whose child count hit the pivot budget.
    ///
    /// All bands are flushed first, so the node's own branches are gone
    /// (or arrived after the flush with full band coverage) and the
    /// split is a pure topology change.
    #[allow(clippy::expect_used)]
    fn split_internal(&self, tid: usize, node: &Arc<TrunkNode>) -> crate::Result<Vec<NodeId>> {
        let mut band = 0;
        loop {
            let band_count = {
                let _band = node.band.read(tid);
                let state = node.state.read().expect("lock is poisoned");
                state.band_count()
            };
            if band >= band_count {
                break;
            }
            self.compact_band(tid, node, band)?;
            band += 1;
        }

        let parent_id = {
            let _band = node.band.read(tid);
            let state = node.state.read().expect("lock is poisoned");
            state.parent
        };

        if let Some(parent_id) = parent_id {
            let parent = self.node(parent_id);
            let _band = parent.band.read(tid);
            let state = parent.state.read().expect("lock is poisoned");
            if state.children.len() + 1 > self.config.max_pivots {
                return Ok(vec![parent_id]);
            }
        }

        let parent = parent_id.map(|id| self.node(id));
        let _parent_band = parent.as_ref().map(|p| p.band.write());
        let mut parent_state = parent
            .as_ref()
            .map(|p| p.state.write().expect("lock is poisoned"));

        let _node_band = node.band.write();
        let mut state = node.state.write().expect("lock is poisoned");

        if state.children.len() < 4 {
            return Ok(Vec::new());
        }

        if parent_id.is_some() && !state.branches.is_empty() {
            // A fresh branch landed between the flush and the apply;
            // retry on a later round rather than redistributing it.
            return Ok(vec![node.id]);
        }

        let mid = state.children.len() / 2;
        let mid_sep = state.separators[mid - 1].clone();

        let left_children: Vec<NodeId> = state.children[..mid].to_vec();
        let right_children: Vec<NodeId> = state.children[mid..].to_vec();
        let left_seps: Vec<UserKey> = state.separators[..mid - 1].to_vec();
        let right_seps: Vec<UserKey> = state.separators[mid..].to_vec();

        let owner = parent_id.unwrap_or(node.id);

        let make_internal = |range_lo: UserKey,
                             range_hi: Option<UserKey>,
                             children: Vec<NodeId>,
                             separators: Vec<UserKey>|
         -> NodeId {
            let mut arena = self.arena.write().expect("lock is poisoned");
            let id = arena.len();
            arena.push(Arc::new(TrunkNode {
                id,
                band: BandLock::new(),
                state: RwLock::new(NodeState {
                    parent: Some(owner),
                    range_lo,
                    range_hi,
                    separators,
                    children,
                    branches: Vec::new(),
                    filter: RoutingFilter::new(1_024, self.config.filter_fp_bits),
                    used_slots: 0,
                    generation: 0,
                }),
                structural_lock: Mutex::new(()),
            }));
            id
        };

        let left_id = make_internal(
            state.range_lo.clone(),
            Some(mid_sep.clone()),
            left_children.clone(),
            left_seps,
        );
        let right_id = make_internal(
            mid_sep.clone(),
            state.range_hi.clone(),
            right_children.clone(),
            right_seps,
        );

        for child in left_children.iter().chain(right_children.iter()) {
            let child = self.node(*child);
            let new_parent = if left_children.contains(&child.id) {
                left_id
            } else {
                right_id
            };

            let _band = child.band.write();
            child.state.write().expect("lock is poisoned").parent = Some(new_parent);
        }

        let follow_ups = if let Some(ps) = parent_state.as_mut() {
            let pos = ps
                .children
                .iter()
                .position(|c| *c == node.id)
                .expect("node must be its parent's child");

            for bs in &mut ps.branches {
                bs.live_bands = remap_mask(bs.live_bands, pos, 2);
            }

            ps.children.splice(pos..=pos, [left_id, right_id]);
            ps.separators.insert(pos, mid_sep);
            ps.generation += 1;

            state.children.clear();
            state.separators.clear();
            state.generation += 1;

            if ps.children.len() >= self.config.max_pivots {
                parent_id.into_iter().collect()
            } else {
                Vec::new()
            }
        } else {
            // The root keeps its identity and becomes the parent of the
            // two halves; any branch that landed meanwhile covers the
            // whole range, so its mask maps to both new bands.
            state.children = vec![left_id, right_id];
            state.separators = vec![mid_sep];
            for bs in &mut state.branches {
                if bs.live_bands != 0 {
                    bs.live_bands = 0b11;
                }
            }
            state.generation += 1;
            Vec::new()
        };

        drop(state);
        drop(parent_state);

        self.structure_gen.fetch_add(1, Ordering::AcqRel);
        log::info!("split internal trunk node {}", node.id);

        Ok(follow_ups)
    }

    /// Streams a merged fold of `sources` into packed branches,
    /// cutting a new piece every `cut_every` entries if given.
    pub(crate) fn pack_folded(
        &self,
        sources: Vec<BoxedIterator<'_>>,
        elide_tombstones: bool,
        cut_every: Option<u64>,
    ) -> crate::Result<Vec<PackedPiece>> {
        let merger = Merger::new(self.schema.clone(), sources);
        let folded = FoldedIter::new(self.schema.clone(), merger);

        let mut pieces = Vec::new();
        let mut writer: Option<PackedWriter> = None;
        let mut hashes: Vec<KeyHash> = Vec::new();
        let mut in_piece = 0u64;

        for item in folded {
            let (key, msg) = item?;

            if elide_tombstones && msg.is_tombstone() {
                continue;
            }

            let w = writer.get_or_insert_with(|| {
                PackedWriter::new(
                    self.cache.clone(),
                    self.block.clone(),
                    self.schema.clone(),
                    self.config.pack_utilization,
                )
            });

            w.add(&key, &msg)?;
            hashes.push(hash_key(&key));
            in_piece += 1;

            if let Some(cut) = cut_every {
                if in_piece >= cut {
                    if let Some(writer) = writer.take() {
                        if let Some(tree) = writer.finish()? {
                            pieces.push(self.seal_piece(tree, std::mem::take(&mut hashes))?);
                        }
                    }
                    in_piece = 0;
                }
            }
        }

        if let Some(writer) = writer.take() {
            if let Some(tree) = writer.finish()? {
                pieces.push(self.seal_piece(tree, hashes)?);
            }
        }

        Ok(pieces)
    }

    fn seal_piece(&self, tree: PackedTree, hashes: Vec<KeyHash>) -> crate::Result<PackedPiece> {
        let branch = self.seal_branch(tree, &hashes)?;
        Ok(PackedPiece { branch, hashes })
    }

    /// Wraps a packed tree into a [`Branch`], persisting its filter.
    pub fn seal_branch(&self, tree: PackedTree, hashes: &[KeyHash]) -> crate::Result<Branch> {
        let mut filter = RoutingFilter::new(hashes.len().max(16), self.config.filter_fp_bits);
        filter.add_branch(hashes, 0);

        let filter_mini = MiniAllocator::new(
            self.block.clone(),
            self.cache.page_size() as u64,
            1,
        );
        let filter_addr = write_filter(&self.cache, &filter_mini, &filter)?;

        let mut extents = tree.extents.clone();
        extents.extend(filter_mini.release());

        Ok(Branch {
            tree,
            age: self.next_age(),
            filter_addr,
            extents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn remap_mask_expands_band() {
        // Band 1 of 3 splits into 3 bands
        //   0b101 → band0 stays, band1 (dead) expands dead, band2 shifts
        assert_eq!(0b1_0001, remap_mask(0b101, 1, 3));

        // Live band expands to all-ones
        assert_eq!(0b0_1110, remap_mask(0b010, 1, 3));

        // Leading band: band 0 of 0b11 expands into two bands
        assert_eq!(0b111, remap_mask(0b11, 0, 2));
    }

    #[test]
    fn remap_mask_identity_when_n_is_one() {
        for mask in [0u64, 0b1, 0b1010, u64::MAX >> 1] {
            assert_eq!(mask, remap_mask(mask, 2, 1));
        }
    }
}
