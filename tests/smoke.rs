// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use test_log::test;
use trunkdb::{Config, UserValue};

fn ephemeral() -> trunkdb::Result<trunkdb::Db> {
    let dir = tempfile::tempdir()?;

    Config::new(dir.path().join("kv"))
        .ephemeral()
        .cache_size(8 * 1_024 * 1_024)
        .disk_size(128 * 1_024 * 1_024)
        .create()
}

#[test]
fn single_insert_lookup() -> trunkdb::Result<()> {
    let db = ephemeral()?;

    db.insert("k", "v")?;

    assert_eq!(Some(UserValue::from("v")), db.lookup(b"k")?);
    assert_eq!(None, db.lookup(b"missing")?);

    Ok(())
}

#[test]
fn overwrite() -> trunkdb::Result<()> {
    let db = ephemeral()?;

    db.insert("k", "v1")?;
    db.insert("k", "v2")?;

    assert_eq!(Some(UserValue::from("v2")), db.lookup(b"k")?);

    Ok(())
}

#[test]
fn delete_and_idempotence() -> trunkdb::Result<()> {
    let db = ephemeral()?;

    db.insert("k", "v")?;
    db.delete("k")?;
    assert_eq!(None, db.lookup(b"k")?);

    // Delete of a nonexistent key is a no-op
    db.delete("never-existed")?;
    db.delete("k")?;
    assert_eq!(None, db.lookup(b"k")?);

    // The key can come back
    db.insert("k", "again")?;
    assert_eq!(Some(UserValue::from("again")), db.lookup(b"k")?);

    Ok(())
}

#[test]
fn update_composes() -> trunkdb::Result<()> {
    let db = ephemeral()?;

    // With the default byte schema, update is a blind set...
    db.update("k", "u1")?;
    assert_eq!(Some(UserValue::from("u1")), db.lookup(b"k")?);

    // ...and shadows an older insert
    db.insert("j", "base")?;
    db.update("j", "patched")?;
    assert_eq!(Some(UserValue::from("patched")), db.lookup(b"j")?);

    Ok(())
}

#[test]
fn lookups_cross_the_flush_boundary() -> trunkdb::Result<()> {
    let db = ephemeral()?;

    for i in 0..1_000u32 {
        db.insert(format!("key-{i:06}"), format!("value-{i}"))?;
    }

    // Push everything into the trunk
    db.flush()?;

    for i in [0u32, 1, 500, 999] {
        assert_eq!(
            Some(UserValue::from(format!("value-{i}"))),
            db.lookup(format!("key-{i:06}").as_bytes())?,
        );
    }
    assert_eq!(None, db.lookup(b"key-afterwards")?);

    // Writes after the flush shadow trunk data
    db.insert("key-000500", "overwritten")?;
    assert_eq!(
        Some(UserValue::from("overwritten")),
        db.lookup(b"key-000500")?
    );

    // Deletes shadow trunk data too
    db.delete("key-000001")?;
    assert_eq!(None, db.lookup(b"key-000001")?);

    db.check_invariants();
    Ok(())
}

#[test]
fn async_lookup_completes() -> trunkdb::Result<()> {
    let db = ephemeral()?;

    for i in 0..2_000u32 {
        db.insert(format!("key-{i:06}"), format!("value-{i}"))?;
    }
    db.flush()?;

    let mut ctx = db.lookup_async(b"key-001234")?;

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        match db.poll_lookup(&mut ctx, b"key-001234")? {
            trunkdb::LookupPoll::Ready(value) => {
                assert_eq!(Some(UserValue::from("value-1234")), value);
                break;
            }
            trunkdb::LookupPoll::Pending => {
                assert!(std::time::Instant::now() < deadline, "lookup stuck");
                std::thread::yield_now();
            }
        }
    }

    // Missing keys resolve to None
    let mut ctx = db.lookup_async(b"no-such-key")?;
    loop {
        match db.poll_lookup(&mut ctx, b"no-such-key")? {
            trunkdb::LookupPoll::Ready(value) => {
                assert_eq!(None, value);
                break;
            }
            trunkdb::LookupPoll::Pending => std::thread::yield_now(),
        }
    }

    Ok(())
}

#[test]
fn unregistered_threads_are_rejected() -> trunkdb::Result<()> {
    let db = ephemeral()?;
    db.insert("k", "v")?;

    let db2 = db.clone();
    let result = std::thread::spawn(move || db2.lookup(b"k"))
        .join()
        .expect("no panic");

    assert!(matches!(result, Err(trunkdb::Error::InvalidState(_))));

    // After registering, the same thread works
    let db3 = db.clone();
    let result = std::thread::spawn(move || {
        db3.register_thread()?;
        let value = db3.lookup(b"k");
        db3.deregister_thread();
        value
    })
    .join()
    .expect("no panic");

    assert_eq!(Some(UserValue::from("v")), result?);
    Ok(())
}
