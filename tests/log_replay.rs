// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Crash-replay scenario: writes go through the write-ahead log, the
//! database is dropped without flushing the memtable, and a reopen
//! rebuilds the same state from the log shards.
//!
//! The soak configuration of this scenario runs 500,000 rows; the
//! in-tree version is scaled down to 50,000 to keep test time sane.

use test_log::test;
use trunkdb::{Config, UserValue};

const N: u32 = 50_000;

fn key(i: u32) -> String {
    format!("log-key-{i:012}")
}

fn value(i: u32) -> String {
    format!("log-value-{i}")
}

fn config(path: &std::path::Path) -> Config {
    Config::new(path)
        .cache_size(16 * 1_024 * 1_024)
        .disk_size(512 * 1_024 * 1_024)
        .use_log(true)
        .commit_every_n(256)
}

#[test]
fn replay_rebuilds_state() -> trunkdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("kv");

    {
        let db = config(&path).create()?;

        for i in 0..N {
            db.insert(key(i), value(i))?;
        }
        // No flush: the memtable content only survives through the log.
    }

    let db = config(&path).open()?;

    for i in [0, 1, N / 2, N - 1] {
        assert_eq!(
            Some(UserValue::from(value(i))),
            db.lookup(key(i).as_bytes())?,
            "key {i}"
        );
    }

    // The full insertion sequence is reconstructed in order
    let mut count = 0u32;
    for item in db.range(key(0)) {
        let (k, v) = item?;
        assert_eq!(key(count).as_bytes(), &*k, "position {count}");
        assert_eq!(value(count).as_bytes(), &*v);
        count += 1;
    }
    assert_eq!(N, count);

    Ok(())
}

#[test]
fn replay_preserves_overwrites_and_deletes() -> trunkdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("kv");

    {
        let db = config(&path).create()?;

        db.insert("a", "1")?;
        db.insert("a", "2")?;
        db.insert("b", "x")?;
        db.delete("b")?;
        db.insert("c", "kept")?;
    }

    let db = config(&path).open()?;

    assert_eq!(Some(UserValue::from("2")), db.lookup(b"a")?);
    assert_eq!(None, db.lookup(b"b")?);
    assert_eq!(Some(UserValue::from("kept")), db.lookup(b"c")?);

    Ok(())
}

#[test]
fn replay_after_replay() -> trunkdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("kv");

    {
        let db = config(&path).create()?;
        db.insert("first", "generation-1")?;
    }

    {
        let db = config(&path).open()?;
        assert_eq!(Some(UserValue::from("generation-1")), db.lookup(b"first")?);
        db.insert("second", "generation-2")?;
    }

    let db = config(&path).open()?;
    assert_eq!(Some(UserValue::from("generation-1")), db.lookup(b"first")?);
    assert_eq!(Some(UserValue::from("generation-2")), db.lookup(b"second")?);

    Ok(())
}
