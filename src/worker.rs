// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::registry::ThreadRegistry;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One-way shutdown flag shared by the worker pools and the cache I/O
/// thread
///
/// Requesting shutdown is idempotent. Background loops poll the flag
/// between tasks and drain out; running tasks are never interrupted,
/// so a requested shutdown still finishes in-flight flushes and
/// compactions.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    /// Flags shutdown. Returns `true` if this call was the first to do
    /// so.
    pub fn request(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Background work classes
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Pool {
    /// Compaction and general maintenance
    Normal = 0,

    /// Memtable flushes (kept separate so compactions cannot starve
    /// them and stall writers)
    Memtable = 1,
}

type Task = Box<dyn FnOnce() + Send>;

/// Typed worker pools over crossbeam channels
///
/// Each background task runs to completion; workers register
/// themselves as threads on startup.
pub struct WorkerPool {
    senders: [Sender<Task>; 2],
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    shutdown: Shutdown,
}

impl WorkerPool {
    pub fn new(counts: [usize; 2], registry: Arc<ThreadRegistry>, shutdown: Shutdown) -> Self {
        let (normal_tx, normal_rx) = crossbeam::channel::unbounded::<Task>();
        let (memtable_tx, memtable_rx) = crossbeam::channel::unbounded::<Task>();

        let mut handles = Vec::new();

        let mut spawn_workers = |count: usize, rx: &Receiver<Task>, name: &str| {
            for i in 0..count.max(1) {
                let rx = rx.clone();
                let registry = registry.clone();
                let shutdown = shutdown.clone();

                let handle = std::thread::Builder::new()
                    .name(format!("trunkdb-{name}-{i}"))
                    .spawn(move || {
                        if let Err(e) = registry.register() {
                            log::error!("worker failed to register: {e:?}");
                            return;
                        }

                        loop {
                            match rx.recv_timeout(Duration::from_millis(100)) {
                                Ok(task) => task(),
                                Err(RecvTimeoutError::Timeout) => {
                                    if shutdown.is_requested() {
                                        break;
                                    }
                                }
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                        }

                        registry.deregister();
                    });

                #[allow(clippy::expect_used)]
                handles.push(handle.expect("failed to spawn worker thread"));
            }
        };

        spawn_workers(counts[0], &normal_rx, "compact");
        spawn_workers(counts[1], &memtable_rx, "flush");

        Self {
            senders: [normal_tx, memtable_tx],
            handles: Mutex::new(handles),
            shutdown,
        }
    }

    /// Enqueues a task onto the given pool.
    pub fn spawn<F: FnOnce() + Send + 'static>(&self, pool: Pool, task: F) {
        if self.shutdown.is_requested() {
            return;
        }

        let _ = self.senders[pool as usize].send(Box::new(task));
    }

    /// Requests shutdown and joins all workers.
    #[allow(clippy::expect_used)]
    pub fn shutdown(&self) {
        self.shutdown.request();

        let handles: Vec<_> = self
            .handles
            .lock()
            .expect("lock is poisoned")
            .drain(..)
            .collect();

        let current = std::thread::current().id();
        for handle in handles {
            // A worker can be the one dropping the last handle to the
            // database; it must not join itself.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use test_log::test;

    #[test]
    fn shutdown_request_is_idempotent() {
        let shutdown = Shutdown::default();

        assert!(!shutdown.is_requested());
        assert!(shutdown.request());
        assert!(!shutdown.request());
        assert!(shutdown.is_requested());
    }

    #[test]
    fn tasks_run_to_completion() {
        let registry = Arc::new(ThreadRegistry::default());
        let pool = WorkerPool::new([2, 1], registry, Shutdown::default());

        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            pool.spawn(Pool::Normal, move || {
                counter.fetch_add(1, Ordering::AcqRel);
            });
        }
        for _ in 0..50 {
            let counter = counter.clone();
            pool.spawn(Pool::Memtable, move || {
                counter.fetch_add(1, Ordering::AcqRel);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while counter.load(Ordering::Acquire) < 150 {
            assert!(std::time::Instant::now() < deadline, "tasks did not drain");
            std::thread::sleep(Duration::from_millis(5));
        }

        pool.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let registry = Arc::new(ThreadRegistry::default());
        let pool = WorkerPool::new([1, 1], registry, Shutdown::default());

        pool.shutdown();
        pool.shutdown();

        // Tasks after shutdown are dropped silently
        pool.spawn(Pool::Normal, || panic!("must not run"));
    }
}
