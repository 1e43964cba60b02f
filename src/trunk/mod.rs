// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The trunk: a tree of nodes organizing branches across pivot bands.
//!
//! Fresh branches land at the root; compaction pushes their data down
//! one pivot band at a time, merging overlapping key ranges into new
//! branches installed at the children. Every node carries a routing
//! filter partitioned by branch slot, so a lookup probes only the
//! branches that may contain its key.
//!
//! Nodes live in an arena indexed by [`NodeId`]; branches are shared
//! through `Arc` and their extents are released once the last reference
//! is gone.

pub mod async_lookup;
mod branch;
mod compact;

pub use async_lookup::AsyncLookup;
pub use branch::Branch;

use crate::alloc::BlockAllocator;
use crate::cache::{BandLock, PageCache};
use crate::hash::KeyHash;
use crate::schema::fold_step;
use crate::{Message, SchemaRef, UserKey};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Index of a trunk node in the arena
pub type NodeId = usize;

/// Trunk tuning knobs (taken from [`crate::Config`])
#[derive(Clone, Debug)]
pub struct TrunkConfig {
    /// Branch count that triggers compaction of a node
    pub max_branches: usize,

    /// Maximum children per node (bounded by the 64-bit band masks)
    pub max_pivots: usize,

    /// Tuple count that triggers splitting a trunk leaf
    pub leaf_split_tuples: u64,

    /// Children created per leaf split
    pub split_fanout: usize,

    /// Fingerprint width of routing filters
    pub filter_fp_bits: u8,

    /// Leaf fill target for packed branches
    pub pack_utilization: f32,
}

impl Default for TrunkConfig {
    fn default() -> Self {
        Self {
            max_branches: 8,
            max_pivots: 64,
            leaf_split_tuples: 2_000_000,
            split_fanout: 4,
            filter_fp_bits: crate::filter::DEFAULT_FINGERPRINT_BITS,
            pack_utilization: 0.75,
        }
    }
}

/// One branch as referenced by a node
pub(crate) struct BranchSlot {
    pub branch: Arc<Branch>,

    /// Filter partition id within this node
    pub slot: u8,

    /// Pivot bands of this node the branch still serves.
    ///
    /// Compaction consumes a branch band by band; a band whose bit is
    /// cleared has been merged into the child below and must not be
    /// probed here again.
    pub live_bands: u64,
}

pub(crate) struct NodeState {
    /// Parent node; `None` for the root
    pub parent: Option<NodeId>,

    /// Inclusive lower bound of the node's key range
    pub range_lo: UserKey,

    /// Exclusive upper bound; `None` = unbounded
    pub range_hi: Option<UserKey>,

    /// Band separators; `len == children.len() - 1`
    pub separators: Vec<UserKey>,

    /// Child nodes, one per band; empty for trunk leaves
    pub children: Vec<NodeId>,

    /// Branches, newest first
    pub branches: Vec<BranchSlot>,

    /// Routing filter partitioned by branch slot
    pub filter: crate::filter::RoutingFilter,

    /// Bitmask of occupied filter slots
    pub used_slots: u64,

    /// Structural version, bumped on every mutation
    pub generation: u64,
}

impl NodeState {
    pub(crate) fn band_count(&self) -> usize {
        self.children.len().max(1)
    }

    pub(crate) fn all_bands_mask(&self) -> u64 {
        let n = self.band_count();
        if n >= 64 {
            u64::MAX
        } else {
            (1u64 << n) - 1
        }
    }

    /// Band index for a key (boundary keys go right).
    pub(crate) fn band_of(&self, key: &[u8], schema: &dyn crate::Schema) -> usize {
        if self.children.is_empty() {
            return 0;
        }

        self.separators
            .iter()
            .take_while(|sep| schema.compare(sep, key) != std::cmp::Ordering::Greater)
            .count()
    }

    /// `[lo, hi)` of one band.
    pub(crate) fn band_range(&self, band: usize) -> (UserKey, Option<UserKey>) {
        let lo = if band == 0 {
            self.range_lo.clone()
        } else {
            self.separators[band - 1].clone()
        };

        let hi = if band + 1 >= self.band_count() {
            self.range_hi.clone()
        } else {
            Some(self.separators[band].clone())
        };

        (lo, hi)
    }

    /// Allocates a free filter slot.
    pub(crate) fn alloc_slot(&mut self) -> Option<u8> {
        let free = (!self.used_slots).trailing_zeros();
        if free as usize >= crate::filter::MAX_BRANCH_SLOTS {
            return None;
        }

        self.used_slots |= 1u64 << free;

        #[allow(clippy::cast_possible_truncation)]
        Some(free as u8)
    }

    pub(crate) fn free_slot(&mut self, slot: u8) {
        self.used_slots &= !(1u64 << slot);
    }

    /// Sum of tuple counts of live branches.
    pub(crate) fn tuple_count(&self) -> u64 {
        self.branches
            .iter()
            .filter(|b| b.live_bands != 0)
            .map(|b| b.branch.tuple_count())
            .sum()
    }
}

/// Pins a branch for the lifetime of a scan source
struct BranchKeepAlive {
    iter: crate::btree::PackedIter,
    _branch: Arc<Branch>,
}

impl Iterator for BranchKeepAlive {
    type Item = crate::Result<(UserKey, Message)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

pub(crate) struct TrunkNode {
    pub id: NodeId,

    /// Batched rwlock banding access to `state`: lookups and scans take
    /// the read side with their registered thread id, installs and
    /// compaction applies take the write side. `state`'s own lock is
    /// only ever write-acquired under the band's write side, so band
    /// readers never block on it.
    pub band: BandLock,

    pub state: RwLock<NodeState>,

    /// Serializes whole-node structural operations (compaction passes,
    /// splits). These span merge I/O, so they stay off the band: a
    /// running compaction must not starve readers between its
    /// snapshot and its apply.
    pub structural_lock: Mutex<()>,
}

/// The LSM trunk
pub struct Trunk {
    pub(crate) cache: Arc<PageCache>,
    pub(crate) schema: SchemaRef,
    pub(crate) block: Arc<BlockAllocator>,
    pub(crate) config: TrunkConfig,

    pub(crate) arena: RwLock<Vec<Arc<TrunkNode>>>,
    pub(crate) root: AtomicUsize,
    pub(crate) age: AtomicU64,

    /// Bumped whenever data moves down the trunk (band consumption,
    /// splits). Lookups and scans snapshot it and restart if it moved,
    /// so they never fold the same message from two levels.
    pub(crate) structure_gen: AtomicU64,

    /// Superseded branches a reader may still be probing
    pub(crate) graveyard: Mutex<Vec<Arc<Branch>>>,
}

impl Trunk {
    pub fn new(
        cache: Arc<PageCache>,
        schema: SchemaRef,
        block: Arc<BlockAllocator>,
        config: TrunkConfig,
    ) -> Self {
        let root = Arc::new(TrunkNode {
            id: 0,
            band: BandLock::new(),
            state: RwLock::new(NodeState {
                parent: None,
                range_lo: UserKey::empty(),
                range_hi: None,
                separators: Vec::new(),
                children: Vec::new(),
                branches: Vec::new(),
                filter: crate::filter::RoutingFilter::new(1_024, config.filter_fp_bits),
                used_slots: 0,
                generation: 0,
            }),
            structural_lock: Mutex::new(()),
        });

        Self {
            cache,
            schema,
            block,
            config,
            arena: RwLock::new(vec![root]),
            root: AtomicUsize::new(0),
            age: AtomicU64::new(0),
            structure_gen: AtomicU64::new(0),
            graveyard: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn structure_generation(&self) -> u64 {
        self.structure_gen.load(Ordering::Acquire)
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn node(&self, id: NodeId) -> Arc<TrunkNode> {
        self.arena.read().expect("lock is poisoned")[id].clone()
    }

    pub(crate) fn next_age(&self) -> u64 {
        self.age.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Root node id.
    #[must_use]
    pub fn root_id(&self) -> NodeId {
        self.root.load(Ordering::Acquire)
    }

    /// Number of trunk nodes.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.arena.read().expect("lock is poisoned").len()
    }

    /// Installs a freshly packed level-0 branch at the root.
    ///
    /// `tid` is the registered id of the flushing thread.
    #[allow(clippy::expect_used)]
    pub fn install_root_branch(
        &self,
        tid: usize,
        branch: Branch,
        hashes: &[KeyHash],
    ) -> crate::Result<()> {
        let branch = Arc::new(branch);

        loop {
            let node = self.node(self.root_id());
            let band = node.band.write();
            let mut state = node.state.write().expect("lock is poisoned");

            let Some(slot) = state.alloc_slot() else {
                // All 64 filter slots taken; compaction must drain the
                // root before new branches can land.
                drop(state);
                drop(band);
                log::warn!("root branch slots exhausted; compacting inline");
                self.compact_node(tid, node.id)?;
                continue;
            };

            state.filter.add_branch(hashes, slot);

            let live_bands = state.all_bands_mask();
            state.branches.insert(
                0,
                BranchSlot {
                    branch,
                    slot,
                    live_bands,
                },
            );
            state.generation += 1;

            log::debug!(
                "installed root branch (slot {slot}, {} tuples, {} root branches)",
                state.branches[0].branch.tuple_count(),
                state.branches.len(),
            );

            return Ok(());
        }
    }

    /// Point lookup continuation below the memtables.
    ///
    /// `initial` carries the (non-definitive) message chain the
    /// memtables folded so far; the descent stops as soon as the chain
    /// turns definitive. `tid` is the caller's registered thread id,
    /// indexing its band-lock reader stripe.
    #[allow(clippy::expect_used)]
    pub fn lookup(
        &self,
        tid: usize,
        key: &[u8],
        hash: KeyHash,
        initial: Option<Message>,
    ) -> crate::Result<Option<Message>> {
        if initial.as_ref().is_some_and(Message::is_definitive) {
            return Ok(initial);
        }

        'restart: loop {
            let snapshot_gen = self.structure_generation();
            let mut acc = initial.clone();
            let mut node = self.node(self.root_id());

            loop {
                let (candidates, child) = {
                    let _band = node.band.read(tid);
                    let state = node.state.read().expect("lock is poisoned");

                    let band = state.band_of(key, &*self.schema);
                    let band_bit = 1u64 << band;
                    let filter_hits = state.filter.query(hash);

                    let candidates: Vec<Arc<Branch>> = state
                        .branches
                        .iter()
                        .filter(|b| b.live_bands & band_bit != 0)
                        .filter(|b| filter_hits & (1u64 << b.slot) != 0)
                        .map(|b| b.branch.clone())
                        .collect();

                    let child = state.children.get(band).copied();
                    (candidates, child)
                };

                for branch in candidates {
                    if let Some(found) = branch.probe(&self.cache, &*self.schema, key)? {
                        acc = Some(match acc {
                            None => found,
                            Some(newer) => fold_step(&*self.schema, key, &newer, &found),
                        });

                        if acc.as_ref().is_some_and(Message::is_definitive) {
                            return Ok(acc);
                        }
                    }
                }

                // Data may have moved below us while we probed; folding
                // it again at the child would double-apply updates.
                if self.structure_generation() != snapshot_gen {
                    continue 'restart;
                }

                match child {
                    Some(id) => node = self.node(id),
                    None => return Ok(acc),
                }
            }
        }
    }

    /// Collects range-scan sources for keys `>= start`, ancestors
    /// before descendants, newest branches first within a node.
    ///
    /// Each source is clipped to the branch's live bands, so data that
    /// compaction already pushed down is not seen twice.
    #[allow(clippy::expect_used)]
    pub fn range_sources(
        &self,
        tid: usize,
        start: Option<&[u8]>,
    ) -> crate::Result<Vec<crate::BoxedIterator<'static>>> {
        loop {
            let snapshot_gen = self.structure_generation();

            let mut sources: Vec<crate::BoxedIterator<'static>> = Vec::new();
            self.collect_sources(tid, self.root_id(), start, &mut sources)?;

            // The collected iterators hold `Arc<Branch>` clones, so a
            // compaction after this point cannot pull pages out from
            // under them; only a move *during* collection is unsafe.
            if self.structure_generation() == snapshot_gen {
                return Ok(sources);
            }
        }
    }

    #[allow(clippy::expect_used)]
    fn collect_sources(
        &self,
        tid: usize,
        id: NodeId,
        start: Option<&[u8]>,
        out: &mut Vec<crate::BoxedIterator<'static>>,
    ) -> crate::Result<()> {
        let node = self.node(id);

        let (spans, children) = {
            let _band = node.band.read(tid);
            let state = node.state.read().expect("lock is poisoned");

            // Contiguous live-band runs per branch, newest first
            let mut spans: Vec<(Arc<Branch>, UserKey, Option<UserKey>)> = Vec::new();

            for bs in &state.branches {
                let mut band = 0;
                while band < state.band_count() {
                    if bs.live_bands & (1u64 << band) == 0 {
                        band += 1;
                        continue;
                    }

                    let mut end_band = band;
                    while end_band + 1 < state.band_count()
                        && bs.live_bands & (1u64 << (end_band + 1)) != 0
                    {
                        end_band += 1;
                    }

                    let (lo, _) = state.band_range(band);
                    let (_, hi) = state.band_range(end_band);
                    spans.push((bs.branch.clone(), lo, hi));

                    band = end_band + 1;
                }
            }

            (spans, state.children.clone())
        };

        for (branch, lo, hi) in spans {
            // Skip spans entirely before the scan start
            if let (Some(start), Some(hi)) = (start, &hi) {
                if self.schema.compare(hi, start) != std::cmp::Ordering::Greater {
                    continue;
                }
            }

            let span_start: Option<&[u8]> = match start {
                Some(s) if self.schema.compare(s, &lo) == std::cmp::Ordering::Greater => Some(s),
                _ => Some(&lo),
            };

            let iter = branch.range_iter(
                self.cache.clone(),
                self.schema.clone(),
                span_start,
                hi,
            )?;

            // The adapter pins the branch so a later compaction cannot
            // release its extents mid-scan.
            out.push(Box::new(BranchKeepAlive {
                iter,
                _branch: branch,
            }));
        }

        for child in children {
            self.collect_sources(tid, child, start, out)?;
        }

        Ok(())
    }

    /// Snapshot of all nodes (drops the arena lock before use, so no
    /// state lock is ever taken under it).
    #[allow(clippy::expect_used)]
    fn nodes_snapshot(&self) -> Vec<Arc<TrunkNode>> {
        self.arena.read().expect("lock is poisoned").clone()
    }

    /// Nodes whose branch count or tuple count exceed their budgets.
    #[allow(clippy::expect_used)]
    pub fn compaction_candidates(&self, tid: usize) -> Vec<NodeId> {
        self.nodes_snapshot()
            .iter()
            .filter(|node| {
                let _band = node.band.read(tid);
                let state = node.state.read().expect("lock is poisoned");
                let live = state.branches.iter().filter(|b| b.live_bands != 0).count();

                live > self.config.max_branches
                    || (state.children.is_empty()
                        && state.tuple_count() > self.config.leaf_split_tuples)
            })
            .map(|node| node.id)
            .collect()
    }

    /// Moves a superseded branch to the graveyard and reaps the ones
    /// nobody probes anymore.
    #[allow(clippy::expect_used)]
    pub(crate) fn retire_branch(&self, branch: Arc<Branch>) {
        let mut graveyard = self.graveyard.lock().expect("lock is poisoned");
        graveyard.push(branch);

        let block = &self.block;
        graveyard.retain(|b| {
            if Arc::strong_count(b) == 1 {
                b.release(block);
                false
            } else {
                true
            }
        });
    }

    /// Releases every branch (shutdown).
    #[allow(clippy::expect_used)]
    pub fn dispose_all(&self) {
        for node in self.nodes_snapshot() {
            let _band = node.band.write();
            let mut state = node.state.write().expect("lock is poisoned");
            for bs in state.branches.drain(..) {
                self.retire_branch(bs.branch);
            }
        }

        let mut graveyard = self.graveyard.lock().expect("lock is poisoned");
        for branch in graveyard.drain(..) {
            debug_assert_eq!(1, Arc::strong_count(&branch));
            branch.release(&self.block);
        }
    }

    /// Reaps graveyard branches nobody references anymore.
    #[allow(clippy::expect_used)]
    pub fn reap(&self) {
        let mut graveyard = self.graveyard.lock().expect("lock is poisoned");
        let block = &self.block;
        graveyard.retain(|b| {
            if Arc::strong_count(b) == 1 {
                b.release(block);
                false
            } else {
                true
            }
        });
    }

    /// Checks structural invariants (test builds).
    #[allow(clippy::expect_used)]
    pub fn check_invariants(&self) {
        for node in self.nodes_snapshot() {
            // Test-only path: the state lock alone is enough here, no
            // band admission needed.
            let state = node.state.read().expect("lock is poisoned");

            // Branch ranges stay within the node's pivot range
            for bs in &state.branches {
                if bs.live_bands == 0 {
                    continue;
                }
                let range = &bs.branch.tree.key_range;

                if !state.range_lo.is_empty() {
                    assert!(
                        self.schema.compare(range.max(), &state.range_lo)
                            != std::cmp::Ordering::Less,
                        "branch below node range"
                    );
                }
                if let Some(hi) = &state.range_hi {
                    assert!(
                        self.schema.compare(range.min(), hi) == std::cmp::Ordering::Less,
                        "branch above node range"
                    );
                }
            }

            // Separators strictly increasing
            for pair in state.separators.windows(2) {
                assert!(
                    self.schema.compare(&pair[0], &pair[1]) == std::cmp::Ordering::Less,
                    "separators out of order"
                );
            }

            if !state.children.is_empty() {
                assert_eq!(state.children.len(), state.separators.len() + 1);
                assert!(state.children.len() <= self.config.max_pivots);
            }
        }
    }
}
