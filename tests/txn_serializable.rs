// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cross-write serializability: two transactions that each read what
//! the other writes cannot both commit.

use std::sync::{Arc, Barrier};
use test_log::test;
use trunkdb::{CommitOutcome, Config, TxnDb, UserValue};

fn txn_db() -> trunkdb::Result<TxnDb> {
    let dir = tempfile::tempdir()?;

    Config::new(dir.path().join("kv"))
        .ephemeral()
        .cache_size(8 * 1_024 * 1_024)
        .disk_size(256 * 1_024 * 1_024)
        .create_transactional()
}

#[test]
fn cross_write_exactly_one_aborts() -> trunkdb::Result<()> {
    let db = txn_db()?;

    let mut setup = db.begin();
    db.insert(&mut setup, b"a", *b"init-a")?;
    db.insert(&mut setup, b"b", *b"init-b")?;
    assert!(matches!(db.commit(&mut setup)?, CommitOutcome::Committed(_)));

    // T1 reads a, writes b; T2 reads b, writes a; both read before
    // either commits.
    let mut t1 = db.begin();
    let mut t2 = db.begin();

    assert_eq!(Some(UserValue::from(*b"init-a")), db.lookup(&mut t1, b"a")?);
    assert_eq!(Some(UserValue::from(*b"init-b")), db.lookup(&mut t2, b"b")?);

    db.insert(&mut t1, b"b", *b"from-t1")?;
    db.insert(&mut t2, b"a", *b"from-t2")?;

    let first = db.commit(&mut t1)?;
    let second = db.commit(&mut t2)?;

    // The first commit validates cleanly; the second observes the
    // changed write timestamp and must abort.
    assert!(matches!(first, CommitOutcome::Committed(_)));
    assert_eq!(CommitOutcome::Conflict, second);

    // Only the winner's writes are visible
    let mut check = db.begin();
    assert_eq!(Some(UserValue::from(*b"init-a")), db.lookup(&mut check, b"a")?);
    assert_eq!(Some(UserValue::from(*b"from-t1")), db.lookup(&mut check, b"b")?);
    db.abort(&mut check);

    Ok(())
}

#[test]
fn threaded_cross_write_never_double_commits() -> trunkdb::Result<()> {
    let db = Arc::new(txn_db()?);

    for round in 0..20 {
        let mut setup = db.begin();
        db.insert(&mut setup, b"a", *b"0")?;
        db.insert(&mut setup, b"b", *b"0")?;
        db.commit(&mut setup)?;

        let barrier = Arc::new(Barrier::new(2));

        let spawn = |read_key: &'static [u8], write_key: &'static [u8], tag: &'static [u8]| {
            let db = db.clone();
            let barrier = barrier.clone();

            std::thread::spawn(move || -> trunkdb::Result<CommitOutcome> {
                db.register_thread()?;

                let mut txn = db.begin();
                let _ = db.lookup(&mut txn, read_key)?;
                db.insert(&mut txn, write_key, tag)?;

                barrier.wait();
                let outcome = db.commit(&mut txn)?;

                db.deregister_thread();
                Ok(outcome)
            })
        };

        let t1 = spawn(b"a", b"b", b"t1");
        let t2 = spawn(b"b", b"a", b"t2");

        let o1 = t1.join().expect("no panic")?;
        let o2 = t2.join().expect("no panic")?;

        let commits = [&o1, &o2]
            .iter()
            .filter(|o| matches!(***o, CommitOutcome::Committed(_)))
            .count();

        // Both committing would be a serializability violation; both
        // aborting is legal under no-wait locking.
        assert!(commits <= 1, "round {round}: both transactions committed");
    }

    Ok(())
}

#[test]
fn lost_update_is_prevented() -> trunkdb::Result<()> {
    let db = txn_db()?;

    let mut setup = db.begin();
    db.insert(&mut setup, b"counter", *b"0")?;
    db.commit(&mut setup)?;

    // Two read-modify-write transactions on the same key, interleaved
    let mut t1 = db.begin();
    let mut t2 = db.begin();

    let _ = db.lookup(&mut t1, b"counter")?;
    let _ = db.lookup(&mut t2, b"counter")?;

    db.insert(&mut t1, b"counter", *b"1")?;
    db.insert(&mut t2, b"counter", *b"1")?;

    let first = db.commit(&mut t1)?;
    let second = db.commit(&mut t2)?;

    assert!(matches!(first, CommitOutcome::Committed(_)));
    assert_eq!(CommitOutcome::Conflict, second);

    Ok(())
}

#[test]
fn aborted_transaction_leaves_no_trace() -> trunkdb::Result<()> {
    let db = txn_db()?;

    let mut txn = db.begin();
    db.insert(&mut txn, b"ghost", *b"should-not-appear")?;
    db.abort(&mut txn);

    let mut check = db.begin();
    assert_eq!(None, db.lookup(&mut check, b"ghost")?);
    db.abort(&mut check);

    Ok(())
}
