// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::alloc::BlockAllocator;
use crate::btree::{DynTreeIter, DynamicTree, PackedWriter};
use crate::cache::PageCache;
use crate::config::{Config, StoreBackend};
use crate::hash::hash_key;
use crate::memtable::{MemtableRing, SealedMemtable};
use crate::merge::{BoxedIterator, FoldedIter, Merger};
use crate::registry::ThreadRegistry;
use crate::store::{DramStore, FileStore, PageIo, PageStore, NIL_ADDR};
use crate::super_page::SuperPage;
use crate::trunk::{async_lookup, AsyncLookup, Trunk, TrunkConfig};
use crate::value::{Message, UserKey, UserValue};
use crate::wal::{self, Wal};
use crate::worker::{Pool, Shutdown, WorkerPool};
use crate::KvPair;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Result of polling an asynchronous lookup
pub enum LookupPoll {
    /// Final result (after `merge_final`)
    Ready(Option<UserValue>),

    /// A page fill is in flight; poll again
    Pending,
}

pub(crate) struct DbInner {
    pub(crate) config: Config,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) block: Arc<BlockAllocator>,
    pub(crate) memtables: MemtableRing,
    pub(crate) trunk: Trunk,
    pub(crate) wal: Option<Wal>,
    pub(crate) registry: Arc<ThreadRegistry>,
    pub(crate) pool: WorkerPool,
    pub(crate) shutdown: Shutdown,

    /// Seqlock around memtable→trunk handovers: odd while a flushed
    /// memtable is visible in both places.
    flush_seq: AtomicU64,

    /// Serializes the handover window
    flush_mutex: Mutex<()>,
}

/// An embedded LSM key-value store
///
/// Cheap to clone; all clones share the same storage.
#[derive(Clone)]
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
}

impl Db {
    /// Creates a fresh database (see [`Config::create`]).
    pub fn create(config: Config) -> crate::Result<Self> {
        let store = match config.store_backend {
            StoreBackend::File => {
                PageStore::File(FileStore::create(&config.path, config.disk_size)?)
            }
            StoreBackend::Dram => PageStore::Dram(DramStore::new(config.disk_size)),
        };

        let db = Self::build(config, store, None)?;
        db.inner.write_super()?;

        log::info!("created database at {:?}", db.inner.config.path);
        Ok(db)
    }

    /// Opens an existing database, replaying the write-ahead log into
    /// the memtable (see [`Config::open`]).
    pub fn open(config: Config) -> crate::Result<Self> {
        let store = match config.store_backend {
            StoreBackend::File => PageStore::File(FileStore::open(&config.path)?),
            StoreBackend::Dram => {
                // Nothing persists without a file; an open on the DRAM
                // backend is just a create.
                PageStore::Dram(DramStore::new(config.disk_size))
            }
        };

        let super_page = match config.store_backend {
            StoreBackend::File => Some(SuperPage::read(&store, config.page_size)?),
            StoreBackend::Dram => None,
        };

        let db = Self::build(config, store, super_page)?;
        db.inner.write_super()?;

        log::info!("opened database at {:?}", db.inner.config.path);
        Ok(db)
    }

    fn build(config: Config, store: PageStore, super_page: Option<SuperPage>) -> crate::Result<Self> {
        let cache = PageCache::new(store, config.cache_size, config.page_size as usize);

        let block = Arc::new(BlockAllocator::new(
            u64::from(config.page_size),
            u64::from(config.extent_pages),
            config.disk_size,
        ));

        let mut replayed = Vec::new();
        let mut old_heads: Vec<u64> = Vec::new();
        let mut last_generation = 0;

        if let Some(super_page) = &super_page {
            block.restore(super_page.watermark, super_page.free_list.clone());
            last_generation = super_page.generation;

            if config.use_log {
                old_heads = super_page
                    .log_heads
                    .iter()
                    .copied()
                    .filter(|h| *h != NIL_ADDR)
                    .collect();

                replayed = wal::replay(&cache, &old_heads)?;
                last_generation = last_generation
                    .max(replayed.iter().map(|e| e.generation).max().unwrap_or(0));
            }
        }

        let registry = Arc::new(ThreadRegistry::default());
        registry.register()?;

        let shutdown = Shutdown::default();
        let pool = WorkerPool::new(config.num_bg_threads, registry.clone(), shutdown.clone());

        let memtables = MemtableRing::new(
            cache.clone(),
            config.schema.clone(),
            block.clone(),
            config.memtable_ring,
            config.memtable_capacity,
        )?;

        let trunk = Trunk::new(
            cache.clone(),
            config.schema.clone(),
            block.clone(),
            TrunkConfig {
                max_branches: config.max_branches,
                max_pivots: config.max_pivots,
                leaf_split_tuples: config.leaf_split_tuples,
                split_fanout: config.split_fanout,
                filter_fp_bits: config.filter_fp_bits,
                pack_utilization: config.pack_utilization,
            },
        );

        let wal = config
            .use_log
            .then(|| Wal::new(cache.clone(), block.clone(), config.commit_every_n, last_generation));

        let db = Self {
            inner: Arc::new(DbInner {
                config,
                cache,
                block,
                memtables,
                trunk,
                wal,
                registry,
                pool,
                shutdown,
                flush_seq: AtomicU64::new(0),
                flush_mutex: Mutex::new(()),
            }),
        };

        // Rebuild the memtable from the old log, appending each entry
        // to the fresh log as we go: the old shard chains are released
        // below, so the new chains are the only durable copy.
        let weak = Arc::downgrade(&db.inner);
        for entry in replayed {
            db.inner.apply(&entry.key, &entry.msg, true, &weak)?;
        }

        if !old_heads.is_empty() {
            if let Some(wal) = &db.inner.wal {
                wal.sync()?;
            }
            wal::release_chains(&db.inner.cache, &db.inner.block, &old_heads)?;
        }

        Ok(db)
    }

    /// Registers the calling thread; threads must register before use.
    pub fn register_thread(&self) -> crate::Result<()> {
        self.inner.registry.register().map(|_| ())
    }

    /// Releases the calling thread's registration.
    pub fn deregister_thread(&self) {
        self.inner.registry.deregister();
    }

    /// Sets a key to a value.
    pub fn insert<K: AsRef<[u8]>, V: Into<UserValue>>(&self, key: K, value: V) -> crate::Result<()> {
        self.write_message(key.as_ref(), &Message::insert(value.into()))
    }

    /// Composes a delta over the current value via the schema's merge.
    pub fn update<K: AsRef<[u8]>, V: Into<UserValue>>(&self, key: K, delta: V) -> crate::Result<()> {
        self.write_message(key.as_ref(), &Message::update(delta.into()))
    }

    /// Removes a key. Removing a missing key is a no-op.
    pub fn delete<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<()> {
        self.write_message(key.as_ref(), &Message::delete())
    }

    /// Writes a raw message (transaction layer entry point).
    #[doc(hidden)]
    pub fn write_message(&self, key: &[u8], msg: &Message) -> crate::Result<()> {
        if key.is_empty() {
            return Err(crate::Error::BadParam("key may not be empty"));
        }
        if key.len() > self.inner.config.key_size_max as usize {
            return Err(crate::Error::BadParam("key exceeds key_size_max"));
        }
        if msg.value.len() > self.inner.config.message_size_max as usize {
            return Err(crate::Error::BadParam("value exceeds message_size_max"));
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.apply(key, msg, true, &weak)
    }

    /// Looks up the current value of a key.
    pub fn lookup(&self, key: &[u8]) -> crate::Result<Option<UserValue>> {
        let msg = self.lookup_message(key)?;
        Ok(msg.and_then(|m| self.inner.config.schema.merge_final(key, m)))
    }

    /// Looks up the folded (pre-`merge_final`) message for a key.
    #[doc(hidden)]
    pub fn lookup_message(&self, key: &[u8]) -> crate::Result<Option<Message>> {
        let tid = self.inner.registry.current_or_err()?;

        loop {
            let seq = self.inner.flush_seq.load(Ordering::Acquire);
            if seq % 2 == 1 {
                // A memtable is mid-handover; its data is briefly
                // visible both above and below the trunk boundary.
                std::hint::spin_loop();
                continue;
            }

            let acc = self.inner.memtables.lookup(tid, key)?;
            let acc = self.inner.trunk.lookup(tid, key, hash_key(key), acc)?;

            if self.inner.flush_seq.load(Ordering::Acquire) == seq {
                return Ok(acc);
            }
        }
    }

    /// Starts an asynchronous lookup; drive it with [`Db::poll_lookup`].
    ///
    /// Memtables are probed synchronously (they never miss the cache);
    /// only the trunk descent suspends.
    pub fn lookup_async(&self, key: &[u8]) -> crate::Result<AsyncLookup> {
        let tid = self.inner.registry.current_or_err()?;

        let acc = self.inner.memtables.lookup(tid, key)?;
        Ok(AsyncLookup::new(
            &self.inner.trunk,
            tid,
            key.into(),
            hash_key(key),
            acc,
        ))
    }

    /// Polls an asynchronous lookup.
    pub fn poll_lookup(&self, ctx: &mut AsyncLookup, key: &[u8]) -> crate::Result<LookupPoll> {
        match ctx.poll(&self.inner.trunk)? {
            async_lookup::Poll::Pending => Ok(LookupPoll::Pending),
            async_lookup::Poll::Ready(msg) => Ok(LookupPoll::Ready(
                msg.and_then(|m| self.inner.config.schema.merge_final(key, m)),
            )),
        }
    }

    /// Iterates keys `>= start` in key order.
    pub fn range<K: Into<UserKey>>(&self, start: K) -> RangeIter {
        self.range_impl(Some(start.into()))
    }

    /// Iterates all keys in key order.
    #[must_use]
    pub fn iter(&self) -> RangeIter {
        self.range_impl(None)
    }

    fn range_impl(&self, start: Option<UserKey>) -> RangeIter {
        let result = self.build_range(start);

        match result {
            Ok(iter) => iter,
            Err(e) => RangeIter {
                inner: None,
                error: Some(e),
                schema: self.inner.config.schema.clone(),
                _memtables: Vec::new(),
            },
        }
    }

    fn build_range(&self, start: Option<UserKey>) -> crate::Result<RangeIter> {
        let tid = self.inner.registry.current_or_err()?;

        loop {
            let seq = self.inner.flush_seq.load(Ordering::Acquire);
            if seq % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let memtable_iters = self
                .inner
                .memtables
                .range_iters(tid, start.as_deref())?;

            let mut keep_alive = Vec::new();
            let mut sources: Vec<BoxedIterator<'static>> = Vec::new();

            for (tree, iter) in memtable_iters {
                keep_alive.push(tree);
                sources.push(Box::new(iter));
            }

            sources.extend(self.inner.trunk.range_sources(tid, start.as_deref())?);

            if self.inner.flush_seq.load(Ordering::Acquire) != seq {
                continue;
            }

            let schema = self.inner.config.schema.clone();
            let merger = Merger::new(schema.clone(), sources);
            let folded = FoldedIter::new(schema.clone(), merger);

            return Ok(RangeIter {
                inner: Some(folded),
                error: None,
                schema,
                _memtables: keep_alive,
            });
        }
    }

    /// Seals and flushes the active memtable, runs pending compactions,
    /// writes back all dirty pages and persists the super page.
    pub fn flush(&self) -> crate::Result<()> {
        let tid = self.inner.registry.current_or_err()?;

        if let Some(wal) = &self.inner.wal {
            wal.sync()?;
        }

        if let Some(sealed) = self.inner.memtables.seal_active() {
            if self.inner.memtables.begin_flush(sealed.slot) {
                self.inner.flush_memtable(&sealed)?;
            }
        }

        // Drain compaction work deterministically.
        let mut pending = self.inner.trunk.compaction_candidates(tid);
        while let Some(id) = pending.pop() {
            pending.extend(self.inner.trunk.compact_node(tid, id)?);
        }
        self.inner.trunk.reap();

        self.inner.cache.flush_all()?;
        self.inner.write_super()
    }

    /// Runs trunk invariant checks (tests).
    #[doc(hidden)]
    pub fn check_invariants(&self) {
        self.inner.trunk.check_invariants();
    }

    #[doc(hidden)]
    #[must_use]
    pub fn trunk_node_count(&self) -> usize {
        self.inner.trunk.node_count()
    }
}

impl DbInner {
    /// The shared write path: log, memtable, flush scheduling.
    fn apply(
        &self,
        key: &[u8],
        msg: &Message,
        log: bool,
        weak: &Weak<Self>,
    ) -> crate::Result<()> {
        let tid = self.registry.current_or_err()?;

        if log {
            if let Some(wal) = &self.wal {
                wal.append(tid, key, msg)?;
            }
        }

        if let Some(sealed) = self.memtables.insert(tid, key, msg)? {
            self.schedule_flush(sealed, weak);
        }

        Ok(())
    }

    fn schedule_flush(&self, sealed: SealedMemtable, weak: &Weak<Self>) {
        if !self.memtables.begin_flush(sealed.slot) {
            return;
        }

        let weak = weak.clone();
        self.pool.spawn(Pool::Memtable, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };

            if let Err(e) = inner.flush_memtable(&sealed) {
                log::error!("memtable flush failed: {e:?}");
            }

            inner.schedule_compactions(&Arc::downgrade(&inner));
        });
    }

    /// Packs a sealed memtable into a level-0 branch and hands it to
    /// the trunk root.
    #[allow(clippy::expect_used)]
    fn flush_memtable(&self, sealed: &SealedMemtable) -> crate::Result<()> {
        let tid = self.registry.current_or_err()?;
        let start = std::time::Instant::now();

        let mut writer = PackedWriter::new(
            self.cache.clone(),
            self.block.clone(),
            self.config.schema.clone(),
            self.config.pack_utilization,
        );
        let mut hashes = Vec::new();

        for item in sealed.tree.iter()? {
            let (key, msg) = item?;
            writer.add(&key, &msg)?;
            hashes.push(hash_key(&key));
        }

        let Some(tree) = writer.finish()? else {
            // Empty memtable; just recycle the slot.
            self.memtables.complete_flush(sealed.slot);
            return Ok(());
        };

        let tuple_count = tree.tuple_count;
        let branch = self.trunk.seal_branch(tree, &hashes)?;

        // Handover window: the data is in the trunk and still in the
        // memtable until `complete_flush`; lookups wait it out.
        let _handover = self.flush_mutex.lock().expect("lock is poisoned");
        self.flush_seq.fetch_add(1, Ordering::AcqRel);

        let result = self.trunk.install_root_branch(tid, branch, &hashes);
        self.memtables.complete_flush(sealed.slot);

        self.flush_seq.fetch_add(1, Ordering::AcqRel);
        drop(_handover);

        result?;

        log::debug!(
            "flushed memtable generation {} ({tuple_count} tuples) in {:?}",
            sealed.generation,
            start.elapsed(),
        );

        Ok(())
    }

    fn schedule_compactions(&self, weak: &Weak<Self>) {
        let Ok(tid) = self.registry.current_or_err() else {
            return;
        };

        for id in self.trunk.compaction_candidates(tid) {
            let weak = weak.clone();

            self.pool.spawn(Pool::Normal, move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let Ok(tid) = inner.registry.current_or_err() else {
                    return;
                };

                match inner.trunk.compact_node(tid, id) {
                    Ok(follow_ups) => {
                        inner.trunk.reap();

                        for follow_up in follow_ups {
                            let weak = Arc::downgrade(&inner);
                            let inner = inner.clone();
                            inner.pool.spawn(Pool::Normal, move || {
                                if let Some(inner) = weak.upgrade() {
                                    let Ok(tid) = inner.registry.current_or_err() else {
                                        return;
                                    };

                                    if let Err(e) = inner.trunk.compact_node(tid, follow_up) {
                                        log::error!("compaction failed: {e:?}");
                                    }
                                    inner.trunk.reap();
                                }
                            });
                        }
                    }
                    Err(e) => log::error!("compaction failed: {e:?}"),
                }
            });
        }
    }

    fn write_super(&self) -> crate::Result<()> {
        let (watermark, free_list) = self.block.snapshot();

        let (log_heads, generation) = match &self.wal {
            Some(wal) => (wal.shard_heads(), wal.last_generation()),
            None => (Vec::new(), 0),
        };

        let super_page = SuperPage {
            page_size: self.config.page_size,
            pages_per_extent: self.config.extent_pages,
            disk_size: self.config.disk_size,
            watermark,
            free_list,
            log_heads,
            generation,
        };

        super_page.write(self.cache.store())
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        self.shutdown.request();
        self.pool.shutdown();

        if let Some(wal) = &self.wal {
            if let Err(e) = wal.sync() {
                log::warn!("log sync on close failed: {e:?}");
            }
        }

        if let Err(e) = self.cache.flush_all() {
            log::warn!("flush on close failed: {e:?}");
        }

        if let Err(e) = self.write_super() {
            log::warn!("super page write on close failed: {e:?}");
        }
    }
}

/// Keeps a memtable tree alive for the lifetime of a scan
type MemtableKeepAlive = Arc<DynamicTree>;

/// Forward range iterator over the whole store
///
/// Yields `(key, value)` pairs in key order; tombstoned keys are
/// skipped.
pub struct RangeIter {
    inner: Option<FoldedIter<'static>>,
    error: Option<crate::Error>,
    schema: crate::SchemaRef,
    _memtables: Vec<MemtableKeepAlive>,
}

impl Iterator for RangeIter {
    type Item = crate::Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            return Some(Err(e));
        }

        let inner = self.inner.as_mut()?;

        loop {
            let (key, msg) = match inner.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };

            if let Some(value) = self.schema.merge_final(&key, msg) {
                return Some(Ok((key, value)));
            }
            // Tombstone; skip
        }
    }
}

// `DynTreeIter` sources inside the folded iterator never borrow the
// tree itself, only the shared cache, so pinning the `Arc` is enough.
#[allow(unused)]
fn _assert_range_iter_send() {
    fn is_send<T: Send>() {}
    is_send::<DynTreeIter>();
}
