// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bulk ordering scenario: memtable flushes, trunk compactions and
//! range scans under a deliberately small memtable.
//!
//! The soak configuration of this scenario runs 1,000,000 keys; the
//! in-tree version is scaled down to keep test time sane.

use test_log::test;
use trunkdb::{Config, UserValue};

const N: u32 = 50_000;

fn small_memtable_db() -> trunkdb::Result<trunkdb::Db> {
    let dir = tempfile::tempdir()?;

    Config::new(dir.path().join("kv"))
        .ephemeral()
        .cache_size(16 * 1_024 * 1_024)
        .disk_size(512 * 1_024 * 1_024)
        .memtable_capacity(256 * 1_024)
        .max_branches(4)
        .create()
}

fn key(i: u32) -> String {
    format!("{i:020}")
}

fn value(i: u32) -> String {
    format!("Row-{i}")
}

#[test]
fn many_key_ordering() -> trunkdb::Result<()> {
    let db = small_memtable_db()?;

    for i in 0..N {
        db.insert(key(i), value(i))?;
    }

    db.flush()?;
    db.check_invariants();

    // Point lookups across the whole keyspace
    for i in [0, 1, N / 3, N / 2, N - 2, N - 1] {
        assert_eq!(
            Some(UserValue::from(value(i))),
            db.lookup(key(i).as_bytes())?,
            "key {i}"
        );
    }

    // A scan from key 0 yields every key in lexicographic order
    let mut count = 0u32;
    for item in db.range(key(0)) {
        let (k, v) = item?;
        assert_eq!(key(count).as_bytes(), &*k, "position {count}");
        assert_eq!(value(count).as_bytes(), &*v, "position {count}");
        count += 1;
    }
    assert_eq!(N, count);

    Ok(())
}

#[test]
fn scan_from_midpoint() -> trunkdb::Result<()> {
    let db = small_memtable_db()?;

    for i in 0..10_000u32 {
        db.insert(key(i), value(i))?;
    }
    db.flush()?;

    let start = 7_777u32;
    let mut expected = start;
    for item in db.range(key(start)) {
        let (k, _) = item?;
        assert_eq!(key(expected).as_bytes(), &*k);
        expected += 1;
    }
    assert_eq!(10_000, expected);

    Ok(())
}

#[test]
fn overwrites_and_deletes_survive_compaction() -> trunkdb::Result<()> {
    let db = small_memtable_db()?;

    for i in 0..20_000u32 {
        db.insert(key(i), value(i))?;
    }

    // Overwrite a band, delete another, with flushes in between so the
    // shadowing crosses branch boundaries.
    db.flush()?;

    for i in 5_000..6_000u32 {
        db.insert(key(i), "rewritten")?;
    }
    for i in 9_000..10_000u32 {
        db.delete(key(i))?;
    }

    db.flush()?;
    db.check_invariants();

    assert_eq!(Some(UserValue::from("rewritten")), db.lookup(key(5_500).as_bytes())?);
    assert_eq!(None, db.lookup(key(9_500).as_bytes())?);
    assert_eq!(Some(UserValue::from(value(100))), db.lookup(key(100).as_bytes())?);

    // Scan sees the rewrite and skips the deleted band
    let mut count = 0u32;
    for item in db.range(key(0)) {
        let (k, v) = item?;

        let i: u32 = String::from_utf8_lossy(&k).parse().expect("numeric key");
        assert!(!(9_000..10_000).contains(&i), "deleted key {i} resurfaced");

        if (5_000..6_000).contains(&i) {
            assert_eq!(b"rewritten", &*v);
        }
        count += 1;
    }
    assert_eq!(19_000, count);

    Ok(())
}

#[test]
fn trunk_grows_and_splits() -> trunkdb::Result<()> {
    let dir = tempfile::tempdir()?;

    let db = Config::new(dir.path().join("kv"))
        .ephemeral()
        .cache_size(16 * 1_024 * 1_024)
        .disk_size(512 * 1_024 * 1_024)
        .memtable_capacity(128 * 1_024)
        .max_branches(3)
        .leaf_split_tuples(10_000)
        .create()?;

    for i in 0..40_000u32 {
        db.insert(key(i), value(i))?;
    }
    db.flush()?;
    db.check_invariants();

    assert!(db.trunk_node_count() > 1, "trunk should have split");

    for i in [0, 1, 9_999, 10_000, 25_000, 39_999] {
        assert_eq!(
            Some(UserValue::from(value(i))),
            db.lookup(key(i).as_bytes())?,
            "key {i}"
        );
    }

    let mut count = 0u32;
    for item in db.range(key(0)) {
        let (k, _) = item?;
        assert_eq!(key(count).as_bytes(), &*k);
        count += 1;
    }
    assert_eq!(40_000, count);

    Ok(())
}

#[test]
fn concurrent_writers_keep_order() -> trunkdb::Result<()> {
    let db = small_memtable_db()?;

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || -> trunkdb::Result<()> {
            db.register_thread()?;
            for i in 0..5_000u32 {
                db.insert(format!("t{t}-{i:08}"), format!("value-{t}-{i}"))?;
            }
            db.deregister_thread();
            Ok(())
        }));
    }

    for handle in handles {
        handle.join().expect("no panic")?;
    }

    db.flush()?;
    db.check_invariants();

    let mut count = 0u32;
    let mut last: Option<Vec<u8>> = None;
    for item in db.iter() {
        let (k, _) = item?;
        if let Some(prev) = &last {
            assert!(prev.as_slice() < &*k, "scan out of order");
        }
        last = Some(k.to_vec());
        count += 1;
    }
    assert_eq!(20_000, count);

    Ok(())
}
