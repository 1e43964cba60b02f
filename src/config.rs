// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{ByteSchema, Db, SchemaRef, TxnDb};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Page store backend
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreBackend {
    /// Single pre-sized file
    File,

    /// Heap buffer (tests, ephemeral stores)
    Dram,
}

/// Database configuration builder
#[derive(Clone)]
pub struct Config {
    /// Store file path
    #[doc(hidden)]
    pub path: PathBuf,

    #[doc(hidden)]
    pub store_backend: StoreBackend,

    /// Page cache capacity in bytes
    #[doc(hidden)]
    pub cache_size: u64,

    /// Store size in bytes
    #[doc(hidden)]
    pub disk_size: u64,

    /// Page size in bytes
    #[doc(hidden)]
    pub page_size: u32,

    /// Pages per allocation extent
    #[doc(hidden)]
    pub extent_pages: u32,

    /// Whether writes go through the write-ahead log
    #[doc(hidden)]
    pub use_log: bool,

    /// Log flush + fsync interval, in rows
    #[doc(hidden)]
    pub commit_every_n: u64,

    /// Memtable size threshold in bytes
    #[doc(hidden)]
    pub memtable_capacity: u64,

    /// Memtable ring slots
    #[doc(hidden)]
    pub memtable_ring: usize,

    /// Branch count triggering trunk node compaction
    #[doc(hidden)]
    pub max_branches: usize,

    /// Maximum children per trunk node
    #[doc(hidden)]
    pub max_pivots: usize,

    /// Tuple count triggering a trunk leaf split
    #[doc(hidden)]
    pub leaf_split_tuples: u64,

    /// Leaves created per trunk leaf split
    #[doc(hidden)]
    pub split_fanout: usize,

    /// Routing filter fingerprint width in bits
    #[doc(hidden)]
    pub filter_fp_bits: u8,

    /// Packed leaf fill target
    #[doc(hidden)]
    pub pack_utilization: f32,

    /// Maximum user key length
    #[doc(hidden)]
    pub key_size_max: u32,

    /// Maximum message payload length
    #[doc(hidden)]
    pub message_size_max: u32,

    /// Background threads: `[normal, memtable]`
    #[doc(hidden)]
    pub num_bg_threads: [usize; 2],

    /// log2 of the transaction timestamp cache capacity
    #[doc(hidden)]
    pub tscache_log_slots: u8,

    /// Add 1 to read timestamps when computing the commit timestamp
    /// (Silo-like variant)
    #[doc(hidden)]
    pub silo_epsilon: bool,

    /// Key order and message composition
    #[doc(hidden)]
    pub schema: SchemaRef,
}

impl Config {
    /// Initializes a new config for the given store path.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            store_backend: StoreBackend::File,
            cache_size: /* 32 MiB */ 32 * 1_024 * 1_024,
            disk_size: /* 256 MiB */ 256 * 1_024 * 1_024,
            page_size: 4_096,
            extent_pages: 32,
            use_log: false,
            commit_every_n: 1_024,
            memtable_capacity: /* 8 MiB */ 8 * 1_024 * 1_024,
            memtable_ring: 4,
            max_branches: 8,
            max_pivots: 64,
            leaf_split_tuples: 2_000_000,
            split_fanout: 4,
            filter_fp_bits: crate::filter::DEFAULT_FINGERPRINT_BITS,
            pack_utilization: 0.75,
            key_size_max: 512,
            message_size_max: 1_024,
            num_bg_threads: [1, 1],
            tscache_log_slots: 20,
            silo_epsilon: false,
            schema: Arc::new(ByteSchema),
        }
    }

    /// Sets the page cache capacity in bytes.
    ///
    /// Defaults to 32 MiB.
    #[must_use]
    pub fn cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Sets the store size in bytes.
    ///
    /// Defaults to 256 MiB.
    #[must_use]
    pub fn disk_size(mut self, bytes: u64) -> Self {
        self.disk_size = bytes;
        self
    }

    /// Sets the page size.
    ///
    /// Defaults to 4 KiB.
    ///
    /// # Panics
    ///
    /// Panics if the size is not a power of two between 1 KiB and 32 KiB.
    #[must_use]
    pub fn page_size(mut self, bytes: u32) -> Self {
        assert!(bytes.is_power_of_two());
        assert!((1_024..=32_768).contains(&bytes));

        self.page_size = bytes;
        self
    }

    /// Sets the extent size in pages.
    ///
    /// Defaults to 32 pages.
    #[must_use]
    pub fn extent_pages(mut self, pages: u32) -> Self {
        assert!(pages > 0);

        self.extent_pages = pages;
        self
    }

    /// Enables or disables the write-ahead log.
    ///
    /// Defaults to off.
    #[must_use]
    pub fn use_log(mut self, enabled: bool) -> Self {
        self.use_log = enabled;
        self
    }

    /// Sets how many rows are appended between log fsyncs.
    ///
    /// Defaults to 1024.
    #[must_use]
    pub fn commit_every_n(mut self, rows: u64) -> Self {
        self.commit_every_n = rows.max(1);
        self
    }

    /// Sets the memtable size threshold.
    ///
    /// Defaults to 8 MiB.
    #[must_use]
    pub fn memtable_capacity(mut self, bytes: u64) -> Self {
        self.memtable_capacity = bytes;
        self
    }

    /// Keeps all pages in a heap buffer instead of a file.
    #[must_use]
    pub fn ephemeral(mut self) -> Self {
        self.store_backend = StoreBackend::Dram;
        self
    }

    /// Sets the trunk compaction trigger (branches per node).
    ///
    /// Defaults to 8.
    #[must_use]
    pub fn max_branches(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.max_branches = n;
        self
    }

    /// Sets the maximum children per trunk node.
    ///
    /// Defaults to 64, which is also the hard cap (band bitmask width).
    #[must_use]
    pub fn max_pivots(mut self, n: usize) -> Self {
        assert!((2..=64).contains(&n));

        self.max_pivots = n;
        self
    }

    /// Sets the trunk leaf split threshold in tuples.
    #[must_use]
    pub fn leaf_split_tuples(mut self, n: u64) -> Self {
        self.leaf_split_tuples = n.max(2);
        self
    }

    /// Sets the background thread counts `[normal, memtable]`.
    ///
    /// Defaults to one thread each.
    #[must_use]
    pub fn num_bg_threads(mut self, counts: [usize; 2]) -> Self {
        self.num_bg_threads = counts;
        self
    }

    /// Sets the log2 size of the transaction timestamp cache.
    ///
    /// Defaults to 20 (about one million entries).
    #[must_use]
    pub fn tscache_log_slots(mut self, log_slots: u8) -> Self {
        assert!(log_slots >= 4);

        self.tscache_log_slots = log_slots;
        self
    }

    /// Enables the Silo-like commit timestamp variant.
    #[must_use]
    pub fn silo_epsilon(mut self, enabled: bool) -> Self {
        self.silo_epsilon = enabled;
        self
    }

    /// Sets the maximum key and message payload sizes.
    #[must_use]
    pub fn size_limits(mut self, key_size_max: u32, message_size_max: u32) -> Self {
        self.key_size_max = key_size_max;
        self.message_size_max = message_size_max;
        self
    }

    /// Injects the data schema (key order, merge semantics).
    ///
    /// Defaults to [`ByteSchema`].
    #[must_use]
    pub fn schema(mut self, schema: SchemaRef) -> Self {
        self.schema = schema;
        self
    }

    /// Creates a fresh database, truncating anything at the path.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs.
    pub fn create(self) -> crate::Result<Db> {
        Db::create(self)
    }

    /// Opens an existing database.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs or the super page is
    /// invalid.
    pub fn open(self) -> crate::Result<Db> {
        Db::open(self)
    }

    /// Creates a fresh transactional database.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs.
    pub fn create_transactional(self) -> crate::Result<TxnDb> {
        TxnDb::create(self)
    }

    /// Opens an existing transactional database.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an I/O error occurs or the super page is
    /// invalid.
    pub fn open_transactional(self) -> crate::Result<TxnDb> {
        TxnDb::open(self)
    }
}
