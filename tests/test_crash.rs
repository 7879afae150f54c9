//! Crash recovery through the two-meta protocol
//!
//! A torn write of the newer meta page must leave the older meta
//! authoritative, rolling the environment back to the previous commit.

use cowdb::page::PAGE_SIZE;
use cowdb::{Database, EnvBuilder, WriteFlags};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use tempfile::TempDir;

fn open_env(dir: &TempDir) -> cowdb::Environment {
    EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap()
}

/// Zero out the meta record of the given meta page, as if its write tore
fn tear_meta(dir: &TempDir, toggle: u64) {
    let path = dir.path().join("data.mdb");
    let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let zeros = vec![0u8; PAGE_SIZE];
    file.write_all_at(&zeros, toggle * PAGE_SIZE as u64).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn test_torn_newer_meta_falls_back() {
    let dir = TempDir::new().unwrap();
    let newer_toggle;
    {
        let env = open_env(&dir);
        let db = Database::main();

        let mut txn = env.begin_write().unwrap();
        db.put(&mut txn, b"stable", b"1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let mut txn = env.begin_write().unwrap();
        let id = txn.id();
        db.put(&mut txn, b"stable", b"2", WriteFlags::empty()).unwrap();
        db.put(&mut txn, b"fresh", b"x", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        newer_toggle = id.0 % 2;
    }

    tear_meta(&dir, newer_toggle);

    // The older meta wins and shows the first commit's state
    let env = open_env(&dir);
    let db = Database::main();
    let txn = env.begin_read().unwrap();
    assert_eq!(db.get(&txn, b"stable").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(db.get(&txn, b"fresh").unwrap(), None);
    assert_eq!(db.stat(&txn).entries, 1);
}

#[test]
fn test_both_metas_torn_is_an_error() {
    let dir = TempDir::new().unwrap();
    {
        let env = open_env(&dir);
        let db = Database::main();
        let mut txn = env.begin_write().unwrap();
        db.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    tear_meta(&dir, 0);
    tear_meta(&dir, 1);
    assert!(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).is_err());
}

#[test]
fn test_recovered_env_accepts_writes() {
    let dir = TempDir::new().unwrap();
    let newer_toggle;
    {
        let env = open_env(&dir);
        let db = Database::main();
        let mut txn = env.begin_write().unwrap();
        db.put(&mut txn, b"a", b"1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let mut txn = env.begin_write().unwrap();
        let id = txn.id();
        db.put(&mut txn, b"b", b"2", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        newer_toggle = id.0 % 2;
    }

    tear_meta(&dir, newer_toggle);

    // Recovery, then a fresh commit on top of the surviving state
    let env = open_env(&dir);
    let db = Database::main();
    let mut txn = env.begin_write().unwrap();
    db.put(&mut txn, b"c", b"3", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_read().unwrap();
    assert_eq!(db.get(&txn, b"a").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(db.get(&txn, b"b").unwrap(), None);
    assert_eq!(db.get(&txn, b"c").unwrap().as_deref(), Some(&b"3"[..]));
}
