//! Basic put/get/delete round trips and persistence across reopen

use cowdb::{Database, EnvBuilder, WriteFlags};
use tempfile::TempDir;

fn open_env(dir: &TempDir) -> cowdb::Environment {
    EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap()
}

#[test]
fn test_empty_get() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);
    let db = Database::main();
    let txn = env.begin_read().unwrap();
    assert_eq!(db.get(&txn, b"a").unwrap(), None);
}

#[test]
fn test_put_get_commit_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let env = open_env(&dir);
        let db = Database::main();

        let mut txn = env.begin_write().unwrap();
        assert_eq!(db.get(&txn, b"a").unwrap(), None);
        db.put(&mut txn, b"a", b"1", WriteFlags::empty()).unwrap();
        assert_eq!(db.get(&txn, b"a").unwrap().as_deref(), Some(&b"1"[..]));
        txn.commit().unwrap();

        let txn = env.begin_read().unwrap();
        assert_eq!(db.get(&txn, b"a").unwrap().as_deref(), Some(&b"1"[..]));
    }
    // Reopen from disk
    {
        let env = open_env(&dir);
        let db = Database::main();
        let txn = env.begin_read().unwrap();
        assert_eq!(db.get(&txn, b"a").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(env.stat().unwrap().entries, 1);
    }
}

#[test]
fn test_delete_round_trip() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);
    let db = Database::main();

    let mut txn = env.begin_write().unwrap();
    db.put(&mut txn, b"k1", b"v1", WriteFlags::empty()).unwrap();
    db.put(&mut txn, b"k2", b"v2", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_write().unwrap();
    assert!(db.delete(&mut txn, b"k1").unwrap());
    assert!(!db.delete(&mut txn, b"missing").unwrap());
    txn.commit().unwrap();

    let txn = env.begin_read().unwrap();
    assert_eq!(db.get(&txn, b"k1").unwrap(), None);
    assert_eq!(db.get(&txn, b"k2").unwrap().as_deref(), Some(&b"v2"[..]));
    assert_eq!(db.stat(&txn).entries, 1);
}

#[test]
fn test_abort_discards() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);
    let db = Database::main();

    let mut txn = env.begin_write().unwrap();
    db.put(&mut txn, b"keep", b"1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_write().unwrap();
    db.put(&mut txn, b"gone", b"2", WriteFlags::empty()).unwrap();
    db.delete(&mut txn, b"keep").unwrap();
    txn.abort();

    let txn = env.begin_read().unwrap();
    assert_eq!(db.get(&txn, b"keep").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(db.get(&txn, b"gone").unwrap(), None);
}

#[test]
fn test_equal_size_overwrite_does_not_allocate() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);
    let db = Database::main();

    let mut txn = env.begin_write().unwrap();
    db.put(&mut txn, b"k", b"aaaa", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let before = {
        let txn = env.begin_read().unwrap();
        db.stat(&txn)
    };

    let mut txn = env.begin_write().unwrap();
    db.put(&mut txn, b"k", b"bbbb", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_read().unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap().as_deref(), Some(&b"bbbb"[..]));
    let after = db.stat(&txn);
    assert_eq!(after.entries, before.entries);
    assert_eq!(after.leaf_pages, before.leaf_pages);
    assert_eq!(after.overflow_pages, before.overflow_pages);
}

#[test]
fn test_nosync_mode_round_trip() {
    let dir = TempDir::new().unwrap();
    {
        let env = cowdb::EnvBuilder::new()
            .map_size(10 * 1024 * 1024)
            .flags(cowdb::EnvFlags::NOSYNC)
            .open(dir.path())
            .unwrap();
        let db = Database::main();
        let mut txn = env.begin_write().unwrap();
        db.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.sync().unwrap();
    }
    let env = open_env(&dir);
    let db = Database::main();
    let txn = env.begin_read().unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap().as_deref(), Some(&b"v"[..]));
}

#[test]
fn test_snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);
    let db = Database::main();

    let mut txn = env.begin_write().unwrap();
    db.put(&mut txn, b"x", b"old", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let reader = env.begin_read().unwrap();

    let mut txn = env.begin_write().unwrap();
    db.put(&mut txn, b"x", b"new", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    // The old snapshot still reads the old value
    assert_eq!(db.get(&reader, b"x").unwrap().as_deref(), Some(&b"old"[..]));
    drop(reader);
    let txn = env.begin_read().unwrap();
    assert_eq!(db.get(&txn, b"x").unwrap().as_deref(), Some(&b"new"[..]));
}
