// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::store::PageAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Free list + allocation watermark, guarded by one lock
#[derive(Debug)]
struct AllocState {
    /// Next never-allocated extent index
    watermark: u64,

    /// Recycled extent indices
    free: Vec<u64>,
}

/// Hands out fixed-size extents of contiguous pages from the disk region
///
/// Every extent carries an atomic reference count; an extent returns to
/// the free list when its count drops to zero. Extent 0 holds the super
/// page and is never handed out.
pub struct BlockAllocator {
    extent_bytes: u64,
    extent_count: u64,
    state: Mutex<AllocState>,
    refcounts: Vec<AtomicU32>,
}

impl BlockAllocator {
    /// Creates an allocator over a `disk_size`-byte region.
    #[must_use]
    pub fn new(page_size: u64, pages_per_extent: u64, disk_size: u64) -> Self {
        let extent_bytes = page_size * pages_per_extent;
        let extent_count = disk_size / extent_bytes;

        #[allow(clippy::cast_possible_truncation)]
        let refcounts = (0..extent_count as usize)
            .map(|_| AtomicU32::new(0))
            .collect();

        Self {
            extent_bytes,
            extent_count,
            state: Mutex::new(AllocState {
                watermark: 1,
                free: Vec::new(),
            }),
            refcounts,
        }
    }

    /// Size of one extent in bytes.
    #[must_use]
    pub fn extent_bytes(&self) -> u64 {
        self.extent_bytes
    }

    /// Rounds a page address down to its extent base.
    #[must_use]
    pub fn extent_base(&self, addr: PageAddr) -> PageAddr {
        addr - (addr % self.extent_bytes)
    }

    fn extent_index(&self, addr: PageAddr) -> usize {
        debug_assert!(addr < self.extent_count * self.extent_bytes);

        #[allow(clippy::cast_possible_truncation)]
        let idx = (addr / self.extent_bytes) as usize;
        idx
    }

    /// Allocates an extent with an initial reference count of 1.
    #[allow(clippy::expect_used)]
    pub fn alloc_extent(&self) -> crate::Result<PageAddr> {
        let mut state = self.state.lock().expect("lock is poisoned");

        let idx = if let Some(idx) = state.free.pop() {
            idx
        } else {
            if state.watermark >= self.extent_count {
                log::warn!(
                    "block allocator exhausted ({} extents)",
                    self.extent_count
                );
                return Err(crate::Error::NoSpace);
            }

            let idx = state.watermark;
            state.watermark += 1;
            idx
        };

        #[allow(clippy::cast_possible_truncation)]
        let slot = &self.refcounts[idx as usize];
        debug_assert_eq!(0, slot.load(Ordering::Acquire), "reallocated live extent");
        slot.store(1, Ordering::Release);

        Ok(idx * self.extent_bytes)
    }

    /// Increments the reference count of the extent containing `addr`.
    pub fn inc_ref(&self, addr: PageAddr) {
        let idx = self.extent_index(addr);
        let prev = self.refcounts[idx].fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "inc_ref on a free extent");
    }

    /// Decrements the reference count of the extent containing `addr`,
    /// freeing the extent when the count drops to zero.
    ///
    /// Returns `true` if the extent was freed.
    #[allow(clippy::expect_used)]
    pub fn dec_ref(&self, addr: PageAddr) -> bool {
        let idx = self.extent_index(addr);
        let prev = self.refcounts[idx].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "dec_ref underflow");

        if prev == 1 {
            let mut state = self.state.lock().expect("lock is poisoned");
            state.free.push(addr / self.extent_bytes);
            true
        } else {
            false
        }
    }

    /// Sum of all extent reference counts (live allocations).
    #[must_use]
    pub fn live_references(&self) -> u64 {
        self.refcounts
            .iter()
            .map(|rc| u64::from(rc.load(Ordering::Acquire)))
            .sum()
    }

    /// Snapshot of `(watermark, free list)` for the super page.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn snapshot(&self) -> (u64, Vec<u64>) {
        let state = self.state.lock().expect("lock is poisoned");
        (state.watermark, state.free.clone())
    }

    /// Restores `(watermark, free list)` from the super page.
    ///
    /// Reference counts of live extents are not persisted; extents above
    /// the free list are conservatively considered owned by objects that
    /// will be rediscovered (or leaked) by replay.
    #[allow(clippy::expect_used)]
    pub fn restore(&self, watermark: u64, free: Vec<u64>) {
        let mut state = self.state.lock().expect("lock is poisoned");

        for idx in 1..watermark {
            #[allow(clippy::cast_possible_truncation)]
            self.refcounts[idx as usize].store(1, Ordering::Release);
        }
        for idx in &free {
            #[allow(clippy::cast_possible_truncation)]
            self.refcounts[*idx as usize].store(0, Ordering::Release);
        }

        state.watermark = watermark;
        state.free = free;
    }
}
