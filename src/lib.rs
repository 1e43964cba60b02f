// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, persistent key-value store built around an LSM *trunk*.
//!
//! ##### About
//!
//! Incoming writes land in an in-memory B-tree (the active memtable of a
//! fixed ring). A sealed memtable is bulk-packed into an immutable on-disk
//! B-tree (a *branch*) and handed to the trunk root. Background compaction
//! pushes branches down a tree of pivot bands, merging overlapping key
//! ranges as it goes. Every disk page moves through a clock page cache with
//! pinning, write-back and async fill; page space is handed out in extents
//! by a reference-counted block allocator.
//!
//! Values are *messages* (`Insert`, `Update`, `Delete`); a lookup folds the
//! message chain for a key from newest to oldest, stopping at the first
//! definitive message. `Update` semantics are user-defined through the
//! [`Schema`] trait.
//!
//! On top of the raw store, [`TxnDb`] layers serializable multi-key
//! transactions using per-tuple timestamps (TicToc-style optimistic
//! concurrency control) held in an in-memory timestamp cache.
//!
//! # Example usage
//!
//! ```
//! use trunkdb::{Config, Db};
//! #
//! # let dir = tempfile::tempdir()?;
//!
//! let db = Config::new(dir.path().join("kv"))
//!     .cache_size(8 * 1_024 * 1_024)
//!     .create()?;
//!
//! db.insert("my_key", "my_value")?;
//!
//! let item = db.lookup(b"my_key")?;
//! assert_eq!(Some("my_value".as_bytes().into()), item);
//!
//! // Range scans iterate in key order
//! for kv in db.range(b"a".to_vec()) {
//!     let (_key, _value) = kv?;
//! }
//! #
//! # Ok::<(), trunkdb::Error>(())
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

mod alloc;

#[doc(hidden)]
pub mod btree;

mod cache;
mod coding;
mod config;
mod db;
mod error;

#[doc(hidden)]
pub mod filter;

mod hash;
mod key_range;
mod memtable;

#[doc(hidden)]
pub mod merge;

mod registry;
mod schema;
mod slice;

mod store;
mod super_page;
mod trunk;
mod txn;
mod value;
mod wal;
mod worker;

/// KV-tuple, typically returned by an iterator
pub type KvPair = (UserKey, UserValue);

#[doc(hidden)]
pub use {
    cache::{PageCache, PageHandle},
    hash::hash_key,
    merge::BoxedIterator,
    store::{PageAddr, PageType},
    trunk::{AsyncLookup, NodeId},
    value::Generation,
};

pub use {
    coding::{DecodeError, EncodeError},
    config::{Config, StoreBackend},
    db::{Db, LookupPoll, RangeIter},
    error::{Error, Result},
    key_range::KeyRange,
    schema::{ByteSchema, Schema, SchemaRef},
    slice::Slice,
    txn::{CommitOutcome, IsolationLevel, Transaction, TxnDb},
    value::{Message, MessageKind, UserKey, UserValue},
};
