// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Serializable transactions over the KV store (TicToc-style
//! optimistic concurrency control).
//!
//! Every tuple carries `{wts, delta}` timestamps in an inline header;
//! the hot copies live in an in-memory timestamp cache. Reads record
//! the observed timestamps, writes buffer locally, and commit derives a
//! timestamp from the observations: locks the write set (no-wait),
//! extends read timestamps by CAS, and only then pushes the writes
//! through the KV API.

mod timestamp;
mod tscache;
mod tuple;

pub use timestamp::{AtomicTimestampSet, TimestampSet};
pub use tscache::{EvictedTs, TsCache, TsEntry};
pub use tuple::{decode_header, encode_tuple, payload, TxnSchema, TUPLE_HEADER_LEN};

use crate::schema::fold_step;
use crate::{Config, Db, Message, SchemaRef, UserKey, UserValue};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transaction isolation level
///
/// Only [`IsolationLevel::Serializable`] is implemented; the other
/// levels are declared but rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IsolationLevel {
    /// Full serializability (TicToc validation)
    Serializable,

    /// Snapshot isolation (reserved, not implemented)
    Snapshot,

    /// Read committed (reserved, not implemented)
    ReadCommitted,
}

/// Outcome of a commit attempt
#[derive(Debug, Eq, PartialEq)]
pub enum CommitOutcome {
    /// All writes are visible at this timestamp
    Committed(u64),

    /// Validation failed; nothing was written
    Conflict,
}

struct RwEntry {
    key: UserKey,

    /// Buffered application-level message; `Some` makes this a write
    msg: Option<Message>,

    /// Observed write timestamp (reads)
    wts: u64,

    /// Observed read timestamp (reads)
    rts: u64,

    ts: Option<Arc<TsEntry>>,
    is_read: bool,
}

/// An open transaction: its read and write sets
#[derive(Default)]
pub struct Transaction {
    entries: Vec<RwEntry>,
}

#[allow(clippy::expect_used)]
fn entry_ts(txn: &Transaction, i: usize) -> &Arc<TsEntry> {
    txn.entries[i]
        .ts
        .as_ref()
        .expect("entry has a ts-cache handle")
}

/// Transactional wrapper around [`Db`]
///
/// The underlying store runs with a [`TxnSchema`] so that every stored
/// value carries its tuple header.
pub struct TxnDb {
    db: Db,

    /// The application schema (merge semantics without headers)
    app: SchemaRef,

    /// The wrapped schema the store runs with
    schema: SchemaRef,

    tscache: Arc<TsCache>,
    silo: bool,
    isolation: Mutex<IsolationLevel>,
}

impl TxnDb {
    fn wrap_config(mut config: Config) -> (Config, SchemaRef, SchemaRef, u8, bool) {
        let app = config.schema.clone();
        let schema: SchemaRef = Arc::new(TxnSchema::new(app.clone()));

        config.schema = schema.clone();

        // Tuple headers ride inside the stored value.
        #[allow(clippy::cast_possible_truncation)]
        {
            config.message_size_max += TUPLE_HEADER_LEN as u32;
        }

        let log_slots = config.tscache_log_slots;
        let silo = config.silo_epsilon;
        (config, app, schema, log_slots, silo)
    }

    /// Creates a fresh transactional database.
    pub fn create(config: Config) -> crate::Result<Self> {
        let (config, app, schema, log_slots, silo) = Self::wrap_config(config);

        Ok(Self {
            db: Db::create(config)?,
            app,
            schema,
            tscache: Arc::new(TsCache::new(log_slots)),
            silo,
            isolation: Mutex::new(IsolationLevel::Serializable),
        })
    }

    /// Opens an existing transactional database.
    pub fn open(config: Config) -> crate::Result<Self> {
        let (config, app, schema, log_slots, silo) = Self::wrap_config(config);

        Ok(Self {
            db: Db::open(config)?,
            app,
            schema,
            tscache: Arc::new(TsCache::new(log_slots)),
            silo,
            isolation: Mutex::new(IsolationLevel::Serializable),
        })
    }

    /// The underlying store.
    #[must_use]
    pub fn kv(&self) -> &Db {
        &self.db
    }

    /// Registers the calling thread.
    pub fn register_thread(&self) -> crate::Result<()> {
        self.db.register_thread()
    }

    /// Releases the calling thread's registration.
    pub fn deregister_thread(&self) {
        self.db.deregister_thread();
    }

    /// Selects the isolation level.
    ///
    /// Only `Serializable` is supported; other levels return
    /// [`crate::Error::BadParam`].
    #[allow(clippy::expect_used)]
    pub fn set_isolation_level(&self, level: IsolationLevel) -> crate::Result<()> {
        if level != IsolationLevel::Serializable {
            return Err(crate::Error::BadParam("unsupported isolation level"));
        }

        *self.isolation.lock().expect("lock is poisoned") = level;
        Ok(())
    }

    /// Starts a transaction.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction::default()
    }

    fn entry_index(&self, txn: &mut Transaction, key: &[u8], is_read: bool) -> usize {
        if let Some(i) = txn
            .entries
            .iter()
            .position(|e| self.app.compare(&e.key, key) == std::cmp::Ordering::Equal)
        {
            txn.entries[i].is_read |= is_read;
            return i;
        }

        txn.entries.push(RwEntry {
            key: key.into(),
            msg: None,
            wts: 0,
            rts: 0,
            ts: None,
            is_read,
        });
        txn.entries.len() - 1
    }

    fn ensure_ts(&self, txn: &mut Transaction, i: usize) -> crate::Result<()> {
        if txn.entries[i].ts.is_some() {
            return Ok(());
        }

        let (entry, _, evicted) = self.tscache.acquire(&txn.entries[i].key);
        txn.entries[i].ts = Some(entry);

        for e in evicted {
            self.persist_evicted(&e)?;
        }
        Ok(())
    }

    /// Writes an evicted entry's timestamps back as a timestamp-only
    /// update, so a later transaction can recover them from storage.
    fn persist_evicted(&self, e: &EvictedTs) -> crate::Result<()> {
        self.db.write_message(
            &e.key,
            &Message::update(encode_tuple(e.ts.wts(), e.ts.delta(), true, &[])),
        )
    }

    fn local_write(&self, txn: &mut Transaction, key: &[u8], msg: Message) -> crate::Result<()> {
        let i = self.entry_index(txn, key, false);
        self.ensure_ts(txn, i)?;

        let entry = &mut txn.entries[i];
        entry.msg = Some(match entry.msg.take() {
            None => msg,
            // A later write composes over the buffered one.
            Some(pending) => fold_step(&*self.app, key, &msg, &pending),
        });

        Ok(())
    }

    /// Buffers an insert.
    pub fn insert<V: Into<UserValue>>(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        value: V,
    ) -> crate::Result<()> {
        self.local_write(txn, key, Message::insert(value.into()))
    }

    /// Buffers an update.
    pub fn update<V: Into<UserValue>>(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        delta: V,
    ) -> crate::Result<()> {
        self.local_write(txn, key, Message::update(delta.into()))
    }

    /// Buffers a delete.
    pub fn delete(&self, txn: &mut Transaction, key: &[u8]) -> crate::Result<()> {
        self.local_write(txn, key, Message::delete())
    }

    /// Transactional read.
    ///
    /// Snapshots the entry's timestamps with the lock-bit-clear retry
    /// rule, reads storage, folds the tuple's timestamps into the cache
    /// entry and records the observation for commit validation.
    #[allow(clippy::expect_used)]
    pub fn lookup(&self, txn: &mut Transaction, key: &[u8]) -> crate::Result<Option<UserValue>> {
        let i = self.entry_index(txn, key, true);
        self.ensure_ts(txn, i)?;

        // Read-my-write: the buffered message is this transaction's
        // view; it is not a validated read of storage.
        if let Some(pending) = &txn.entries[i].msg {
            return Ok(self.app.merge_final(key, pending.clone()));
        }

        let ts = txn.entries[i].ts.clone().expect("ts was ensured");

        loop {
            let v1 = ts.ts.load();
            if v1.locked() {
                std::hint::spin_loop();
                continue;
            }

            let raw = self.db.lookup_message(key)?;

            let (tuple_ts, value) = match &raw {
                Some(msg) => {
                    let hdr = decode_header(&msg.value);
                    (
                        hdr.timestamps(),
                        self.schema.merge_final(key, msg.clone()),
                    )
                }
                None => (TimestampSet::default(), None),
            };

            let v2 = v1.newest(tuple_ts);

            if v1 == v2 || ts.ts.cas(v1, v2) {
                let entry = &mut txn.entries[i];
                entry.wts = v2.wts();
                entry.rts = v2.rts();
                return Ok(value);
            }
        }
    }

    /// Validates and applies the transaction.
    ///
    /// A conflict is an outcome, not an error: the transaction is torn
    /// down and [`CommitOutcome::Conflict`] is returned.
    #[allow(clippy::expect_used)]
    pub fn commit(&self, txn: &mut Transaction) -> crate::Result<CommitOutcome> {
        let mut commit_ts = 0u64;

        let mut read_set = Vec::new();
        let mut write_set = Vec::new();

        for (i, entry) in txn.entries.iter().enumerate() {
            if entry.msg.is_some() {
                write_set.push(i);
            }

            if entry.is_read {
                read_set.push(i);

                let mut wts = entry.wts;
                if self.silo {
                    wts += 1;
                }
                commit_ts = commit_ts.max(wts);
            }
        }

        // Deadlock freedom: lock in key order.
        write_set.sort_by(|a, b| {
            self.app
                .compare(&txn.entries[*a].key, &txn.entries[*b].key)
        });

        // No-wait lock acquisition over the write set.
        loop {
            let mut failed_at = None;

            for (pos, &w) in write_set.iter().enumerate() {
                if !entry_ts(txn, w).ts.try_lock() {
                    failed_at = Some(pos);
                    break;
                }
            }

            match failed_at {
                None => break,
                Some(pos) => {
                    for &w in &write_set[..pos] {
                        entry_ts(txn, w).ts.unlock();
                    }
                    // 1 us, the value from the paper
                    std::thread::sleep(Duration::from_micros(1));
                }
            }
        }

        for &w in &write_set {
            let rts = entry_ts(txn, w).ts.load().rts();
            commit_ts = commit_ts.max(rts.saturating_add(1));
        }

        // Read-set validation: extend each read's rts to cover
        // commit_ts, or abort.
        let mut abort = false;

        for &r in &read_set {
            if abort {
                break;
            }

            if txn.entries[r].rts >= commit_ts {
                continue;
            }

            let is_write = txn.entries[r].msg.is_some();
            let observed_wts = txn.entries[r].wts;
            let ts = entry_ts(txn, r);

            loop {
                let v1 = ts.ts.load();

                let wts_changed = observed_wts != v1.wts();
                let locked_by_other = v1.rts() <= commit_ts && v1.locked() && !is_write;

                if wts_changed || locked_by_other {
                    abort = true;
                    break;
                }

                if v1.rts() <= commit_ts {
                    let v2 = v1.with_delta(commit_ts - v1.wts());
                    if ts.ts.cas(v1, v2) {
                        break;
                    }
                    // Raced; reload and revalidate.
                } else {
                    break;
                }
            }
        }

        if abort {
            for &w in &write_set {
                entry_ts(txn, w).ts.unlock();
            }
            self.deinit(txn);

            log::trace!("transaction aborted at commit_ts {commit_ts}");
            return Ok(CommitOutcome::Conflict);
        }

        // Apply: write tuples stamped with the commit timestamp, then
        // publish the timestamps (which also releases the locks).
        for &w in &write_set {
            let (key, msg) = {
                let entry = &txn.entries[w];
                #[allow(clippy::expect_used)]
                let msg = entry.msg.clone().expect("write set entry");
                (entry.key.clone(), msg)
            };

            if msg.is_tombstone() {
                self.db.write_message(&key, &Message::delete())?;
            } else {
                let tuple = encode_tuple(commit_ts, 0, false, &msg.value);
                self.db.write_message(
                    &key,
                    &Message {
                        kind: msg.kind,
                        value: tuple,
                    },
                )?;
            }

            let ts = entry_ts(txn, w);
            loop {
                let v = ts.ts.load();
                if ts.ts.cas(v, TimestampSet::new(commit_ts, 0)) {
                    break;
                }
            }
        }

        self.deinit(txn);
        Ok(CommitOutcome::Committed(commit_ts))
    }

    /// Discards the transaction without writing anything.
    pub fn abort(&self, txn: &mut Transaction) {
        self.deinit(txn);
    }

    fn deinit(&self, txn: &mut Transaction) {
        for entry in txn.entries.drain(..) {
            if let Some(ts) = entry.ts {
                self.tscache.release(&ts);
            }
        }
    }

    /// Flushes the underlying store.
    pub fn flush(&self) -> crate::Result<()> {
        self.db.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn txn_db() -> TxnDb {
        let dir = tempfile::tempdir().expect("tempdir");

        Config::new(dir.path().join("txn-kv"))
            .ephemeral()
            .cache_size(8 * 1_024 * 1_024)
            .disk_size(128 * 1_024 * 1_024)
            .create_transactional()
            .expect("create")
    }

    #[test]
    fn single_txn_insert_lookup() -> crate::Result<()> {
        let db = txn_db();

        let mut txn = db.begin();
        db.insert(&mut txn, b"k", *b"v")?;

        // Read-my-write
        assert_eq!(Some(UserValue::from(*b"v")), db.lookup(&mut txn, b"k")?);
        assert_eq!(CommitOutcome::Committed(1), db.commit(&mut txn)?);

        // Visible to the next transaction
        let mut txn = db.begin();
        assert_eq!(Some(UserValue::from(*b"v")), db.lookup(&mut txn, b"k")?);
        assert_eq!(None, db.lookup(&mut txn, b"missing")?);
        db.abort(&mut txn);

        Ok(())
    }

    #[test]
    fn commit_timestamps_increase() -> crate::Result<()> {
        let db = txn_db();

        let mut first = db.begin();
        db.insert(&mut first, b"a", *b"1")?;
        let CommitOutcome::Committed(ts1) = db.commit(&mut first)? else {
            panic!("must commit");
        };

        let mut second = db.begin();
        let _ = db.lookup(&mut second, b"a")?;
        db.insert(&mut second, b"a", *b"2")?;
        let CommitOutcome::Committed(ts2) = db.commit(&mut second)? else {
            panic!("must commit");
        };

        assert!(ts2 > ts1);
        Ok(())
    }

    #[test]
    fn delete_of_nonexistent_is_idempotent() -> crate::Result<()> {
        let db = txn_db();

        let mut txn = db.begin();
        db.delete(&mut txn, b"ghost")?;
        assert!(matches!(db.commit(&mut txn)?, CommitOutcome::Committed(_)));

        let mut txn = db.begin();
        assert_eq!(None, db.lookup(&mut txn, b"ghost")?);
        db.delete(&mut txn, b"ghost")?;
        assert!(matches!(db.commit(&mut txn)?, CommitOutcome::Committed(_)));

        Ok(())
    }

    #[test]
    fn write_write_conflict_is_serialized() -> crate::Result<()> {
        let db = txn_db();

        let mut setup = db.begin();
        db.insert(&mut setup, b"x", *b"0")?;
        db.commit(&mut setup)?;

        // T1 reads x then writes it; T2 commits a write to x in
        // between; T1's validation must fail.
        let mut t1 = db.begin();
        let _ = db.lookup(&mut t1, b"x")?;

        let mut t2 = db.begin();
        db.insert(&mut t2, b"x", *b"t2")?;
        assert!(matches!(db.commit(&mut t2)?, CommitOutcome::Committed(_)));

        db.insert(&mut t1, b"x", *b"t1")?;
        assert_eq!(CommitOutcome::Conflict, db.commit(&mut t1)?);

        let mut check = db.begin();
        assert_eq!(Some(UserValue::from(*b"t2")), db.lookup(&mut check, b"x")?);
        db.abort(&mut check);

        Ok(())
    }

    #[test]
    fn read_only_txn_commits() -> crate::Result<()> {
        let db = txn_db();

        let mut setup = db.begin();
        db.insert(&mut setup, b"k", *b"v")?;
        db.commit(&mut setup)?;

        let mut reader = db.begin();
        let _ = db.lookup(&mut reader, b"k")?;
        assert!(matches!(db.commit(&mut reader)?, CommitOutcome::Committed(_)));

        Ok(())
    }

    #[test]
    fn unsupported_isolation_levels_are_rejected() {
        let db = txn_db();

        assert!(db.set_isolation_level(IsolationLevel::Serializable).is_ok());
        assert!(matches!(
            db.set_isolation_level(IsolationLevel::Snapshot),
            Err(crate::Error::BadParam(_))
        ));
        assert!(matches!(
            db.set_isolation_level(IsolationLevel::ReadCommitted),
            Err(crate::Error::BadParam(_))
        ));
    }
}
