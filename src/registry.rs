// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of concurrently registered threads
///
/// Thread ids index the striped reader counters, the log shards and the
/// mini-allocator batches, so the bound is small and fixed.
pub const MAX_THREADS: usize = 64;

thread_local! {
    static THREAD_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Allocates small thread ids out of a fixed bitmask
///
/// Threads must register before touching the store; background workers
/// register themselves on startup.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    used: AtomicU64,
}

impl ThreadRegistry {
    /// Registers the calling thread, assigning it a free slot.
    ///
    /// Registering an already-registered thread is a no-op.
    pub fn register(&self) -> crate::Result<usize> {
        if let Some(id) = THREAD_ID.with(Cell::get) {
            return Ok(id);
        }

        loop {
            let used = self.used.load(Ordering::Acquire);
            let free = (!used).trailing_zeros() as usize;

            if free >= MAX_THREADS {
                return Err(crate::Error::InvalidState("too many registered threads"));
            }

            let bit = 1u64 << free;
            if self
                .used
                .compare_exchange(used, used | bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                THREAD_ID.with(|cell| cell.set(Some(free)));
                return Ok(free);
            }
        }
    }

    /// Releases the calling thread's slot.
    pub fn deregister(&self) {
        if let Some(id) = THREAD_ID.with(Cell::take) {
            self.used.fetch_and(!(1u64 << id), Ordering::AcqRel);
        }
    }

    /// Returns the calling thread's slot, if registered.
    #[must_use]
    pub fn current(&self) -> Option<usize> {
        THREAD_ID.with(Cell::get)
    }

    /// Returns the calling thread's slot, or an error if unregistered.
    pub fn current_or_err(&self) -> crate::Result<usize> {
        self.current()
            .ok_or(crate::Error::InvalidState("thread is not registered"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn register_is_idempotent() -> crate::Result<()> {
        let registry = ThreadRegistry::default();

        let a = registry.register()?;
        let b = registry.register()?;
        assert_eq!(a, b);
        assert_eq!(Some(a), registry.current());

        registry.deregister();
        assert_eq!(None, registry.current());

        Ok(())
    }

    #[test]
    fn distinct_threads_get_distinct_slots() -> crate::Result<()> {
        use std::sync::Arc;

        let registry = Arc::new(ThreadRegistry::default());
        let main_id = registry.register()?;

        let other = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let id = registry.register().ok();
                registry.deregister();
                id
            })
        };

        #[allow(clippy::unwrap_used)]
        let other_id = other.join().unwrap();
        assert_ne!(Some(main_id), other_id);

        registry.deregister();
        Ok(())
    }
}
