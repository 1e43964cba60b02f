// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::store::PageAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

/// Frame address value while the frame is not mapped
pub const FREE_FRAME: PageAddr = PageAddr::MAX;

/// One cache frame: a disk page plus its bookkeeping
///
/// The `data` latch doubles as the per-page read/write latch and as the
/// fill barrier: the thread performing the initial disk read holds the
/// write half until the page is resident, so concurrent getters simply
/// block on the read half.
pub struct Frame {
    /// Address of the held page, or [`FREE_FRAME`]
    pub addr: AtomicU64,

    /// Number of outstanding pins
    pub pin_count: AtomicU32,

    /// Page content differs from disk
    pub dirty: AtomicBool,

    /// Clock bit, set on every access, cleared by the sweep hand
    pub accessed: AtomicBool,

    /// Write intention; at most one claimer per frame
    pub claimed: AtomicBool,

    /// Initial fill completed successfully
    pub filled: AtomicBool,

    /// Page content + per-page latch
    pub data: RwLock<Box<[u8]>>,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            addr: AtomicU64::new(FREE_FRAME),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            accessed: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            filled: AtomicBool::new(false),
            data: RwLock::new(vec![0; page_size].into_boxed_slice()),
        }
    }

    /// Resets the frame to its unmapped state.
    ///
    /// Caller must guarantee exclusivity (no pins, map entry removed).
    pub fn reset(&self) {
        debug_assert_eq!(0, self.pin_count.load(Ordering::Acquire));

        self.addr.store(FREE_FRAME, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.accessed.store(false, Ordering::Release);
        self.claimed.store(false, Ordering::Release);
        self.filled.store(false, Ordering::Release);
    }
}
