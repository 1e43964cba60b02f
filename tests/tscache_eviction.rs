// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Timestamp-cache pressure: with a deliberately tiny cache, entries
//! are evicted and their timestamps persisted as timestamp-only
//! updates. Later serializable transactions must pick the timestamps
//! back up from storage instead of aborting spuriously.

use rand::prelude::IndexedRandom;
use test_log::test;
use trunkdb::{CommitOutcome, Config, TxnDb, UserValue};

fn tiny_tscache_db() -> trunkdb::Result<TxnDb> {
    let dir = tempfile::tempdir()?;

    Config::new(dir.path().join("kv"))
        .ephemeral()
        .cache_size(16 * 1_024 * 1_024)
        .disk_size(512 * 1_024 * 1_024)
        .tscache_log_slots(8)
        .create_transactional()
}

fn key(i: u32) -> String {
    format!("ts-key-{i:08}")
}

#[test]
fn eviction_does_not_cause_spurious_aborts() -> trunkdb::Result<()> {
    let db = tiny_tscache_db()?;

    // 10,000 keys, each committed in its own transaction; with 2^8
    // cache slots, almost every entry gets evicted along the way.
    for i in 0..10_000u32 {
        let mut txn = db.begin();
        db.insert(&mut txn, key(i).as_bytes(), format!("value-{i}").into_bytes())?;

        assert!(
            matches!(db.commit(&mut txn)?, CommitOutcome::Committed(_)),
            "insert txn {i} must commit"
        );
    }

    // One serializable transaction over a random sample of the keys;
    // their cached timestamps are long gone, so the persisted copies
    // must carry the validation.
    let mut rng = rand::rng();
    let all: Vec<u32> = (0..10_000).collect();
    let sample: Vec<u32> = all.choose_multiple(&mut rng, 100).copied().collect();

    let mut txn = db.begin();
    for i in &sample {
        let value = db.lookup(&mut txn, key(*i).as_bytes())?;
        assert_eq!(
            Some(UserValue::from(format!("value-{i}"))),
            value,
            "key {i}"
        );
    }

    assert!(
        matches!(db.commit(&mut txn)?, CommitOutcome::Committed(_)),
        "read-only sample txn must not abort"
    );

    Ok(())
}

#[test]
fn evicted_timestamps_do_not_clobber_values() -> trunkdb::Result<()> {
    let db = tiny_tscache_db()?;

    // Write one key, then churn the cache hard so its entry (and many
    // others) get evicted and re-persisted.
    let mut txn = db.begin();
    db.insert(&mut txn, b"anchor", *b"anchor-value")?;
    db.commit(&mut txn)?;

    for i in 0..5_000u32 {
        let mut txn = db.begin();
        db.insert(&mut txn, key(i).as_bytes(), *b"x")?;
        db.commit(&mut txn)?;
    }

    // The timestamp-only updates merged into the anchor tuple must not
    // have touched its payload.
    let mut txn = db.begin();
    assert_eq!(
        Some(UserValue::from(*b"anchor-value")),
        db.lookup(&mut txn, b"anchor")?
    );
    db.abort(&mut txn);

    Ok(())
}

#[test]
fn eviction_pressure_with_storage_flush() -> trunkdb::Result<()> {
    let db = tiny_tscache_db()?;

    for i in 0..2_000u32 {
        let mut txn = db.begin();
        db.insert(&mut txn, key(i).as_bytes(), format!("value-{i}").into_bytes())?;
        db.commit(&mut txn)?;
    }

    // Push everything (tuples + ts-updates) through the trunk
    db.flush()?;

    let mut txn = db.begin();
    for i in [0u32, 999, 1_999] {
        assert_eq!(
            Some(UserValue::from(format!("value-{i}"))),
            db.lookup(&mut txn, key(i).as_bytes())?,
            "key {i}"
        );
    }
    assert!(matches!(db.commit(&mut txn)?, CommitOutcome::Committed(_)));

    Ok(())
}
