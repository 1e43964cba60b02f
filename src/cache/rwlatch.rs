// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::registry::MAX_THREADS;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Spin with exponential backoff: 1, 2, 4, ... capped at 2048 units.
#[derive(Debug)]
pub struct Backoff {
    spins: u32,
}

impl Backoff {
    const CAP: u32 = 2_048;

    pub fn new() -> Self {
        Self { spins: 1 }
    }

    pub fn snooze(&mut self) {
        for _ in 0..self.spins {
            std::hint::spin_loop();
        }
        self.spins = (self.spins * 2).min(Self::CAP);
    }
}

/// Batched reader-writer lock with per-thread reader counters
///
/// Readers only touch their own striped counter (indexed by registered
/// thread id), so uncontended read acquisition is a single uncontended
/// fetch-add. A writer raises its flag first, then waits for every
/// reader counter to drain to zero; readers that raced the flag back
/// off and retry.
///
/// Used for the wide, read-mostly lock bands around memtable rotation
/// and trunk branch lists.
pub struct BandLock {
    readers: Vec<CachePadded<AtomicU32>>,
    writer: AtomicBool,
}

impl Default for BandLock {
    fn default() -> Self {
        Self::new()
    }
}

impl BandLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            readers: (0..MAX_THREADS)
                .map(|_| CachePadded::new(AtomicU32::new(0)))
                .collect(),
            writer: AtomicBool::new(false),
        }
    }

    /// Acquires the lock for reading on behalf of thread `tid`.
    pub fn read_lock(&self, tid: usize) {
        let counter = &self.readers[tid % MAX_THREADS];
        let mut backoff = Backoff::new();

        loop {
            counter.fetch_add(1, Ordering::AcqRel);

            // Recheck the writer flag; a writer that set it before our
            // increment must not observe us as a stable reader.
            if !self.writer.load(Ordering::Acquire) {
                return;
            }

            counter.fetch_sub(1, Ordering::AcqRel);
            backoff.snooze();
        }
    }

    /// Releases a read acquisition of thread `tid`.
    pub fn read_unlock(&self, tid: usize) {
        let prev = self.readers[tid % MAX_THREADS].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "read_unlock without read_lock");
    }

    /// Acquires the lock for writing.
    ///
    /// Writers are mutually exclusive through the flag itself.
    pub fn write_lock(&self) {
        let mut backoff = Backoff::new();

        while self
            .writer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            backoff.snooze();
        }

        for counter in &self.readers {
            let mut backoff = Backoff::new();
            while counter.load(Ordering::Acquire) > 0 {
                backoff.snooze();
            }
        }
    }

    /// Releases the write acquisition.
    pub fn write_unlock(&self) {
        self.writer.store(false, Ordering::Release);
    }

    /// Runs `f` under a read acquisition.
    pub fn with_read<T>(&self, tid: usize, f: impl FnOnce() -> T) -> T {
        self.read_lock(tid);
        let result = f();
        self.read_unlock(tid);
        result
    }

    /// Runs `f` under the write acquisition.
    pub fn with_write<T>(&self, f: impl FnOnce() -> T) -> T {
        self.write_lock();
        let result = f();
        self.write_unlock();
        result
    }

    /// Acquires the read side for thread `tid`, released on drop.
    #[must_use]
    pub fn read(&self, tid: usize) -> BandReadGuard<'_> {
        self.read_lock(tid);
        BandReadGuard { lock: self, tid }
    }

    /// Acquires the write side, released on drop.
    #[must_use]
    pub fn write(&self) -> BandWriteGuard<'_> {
        self.write_lock();
        BandWriteGuard { lock: self }
    }
}

/// RAII read acquisition of a [`BandLock`]
pub struct BandReadGuard<'a> {
    lock: &'a BandLock,
    tid: usize,
}

impl Drop for BandReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock(self.tid);
    }
}

/// RAII write acquisition of a [`BandLock`]
pub struct BandWriteGuard<'a> {
    lock: &'a BandLock,
}

impl Drop for BandWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}
