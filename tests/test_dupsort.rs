//! DUPSORT databases: sorted duplicate values per key

use cowdb::{Database, DatabaseFlags, EnvBuilder, WriteFlags};
use tempfile::TempDir;

fn open_dup_env(dir: &TempDir) -> (cowdb::Environment, Database) {
    let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();
    let db = {
        let mut txn = env.begin_write().unwrap();
        let db = Database::create(
            &mut txn,
            Some("dups"),
            DatabaseFlags::DUPSORT | DatabaseFlags::CREATE,
        )
        .unwrap();
        txn.commit().unwrap();
        db
    };
    (env, db)
}

#[test]
fn test_dup_walk() {
    let dir = TempDir::new().unwrap();
    let (env, db) = open_dup_env(&dir);

    let mut txn = env.begin_write().unwrap();
    for value in [&b"b"[..], b"c", b"a"] {
        db.put(&mut txn, b"x", value, WriteFlags::empty()).unwrap();
    }
    db.put(&mut txn, b"y", b"solo", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_read().unwrap();
    let db = Database::open(&mut txn, Some("dups"), DatabaseFlags::empty()).unwrap();
    // get returns the first duplicate in sort order
    assert_eq!(db.get(&txn, b"x").unwrap().as_deref(), Some(&b"a"[..]));
    assert_eq!(db.stat(&txn).entries, 4);

    let mut cursor = db.cursor(&txn);
    let (key, value) = cursor.set(b"x").unwrap().unwrap();
    assert_eq!(key.as_ref(), b"x");
    assert_eq!(value.as_ref(), b"a");
    let (_, value) = cursor.next_dup().unwrap().unwrap();
    assert_eq!(value.as_ref(), b"b");
    let (_, value) = cursor.next_dup().unwrap().unwrap();
    assert_eq!(value.as_ref(), b"c");
    assert!(cursor.next_dup().unwrap().is_none());
}

#[test]
fn test_next_crosses_keys_through_dups() {
    let dir = TempDir::new().unwrap();
    let (env, db) = open_dup_env(&dir);

    let mut txn = env.begin_write().unwrap();
    db.put(&mut txn, b"k1", b"v1", WriteFlags::empty()).unwrap();
    db.put(&mut txn, b"k1", b"v2", WriteFlags::empty()).unwrap();
    db.put(&mut txn, b"k2", b"w1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_read().unwrap();
    let db = Database::open(&mut txn, Some("dups"), DatabaseFlags::empty()).unwrap();
    let mut cursor = db.cursor(&txn);

    let mut walked = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((key, value)) = entry {
        walked.push((key.into_owned(), value.into_owned()));
        entry = cursor.next().unwrap();
    }
    let expected: Vec<(Vec<u8>, Vec<u8>)> = vec![
        (b"k1".to_vec(), b"v1".to_vec()),
        (b"k1".to_vec(), b"v2".to_vec()),
        (b"k2".to_vec(), b"w1".to_vec()),
    ];
    assert_eq!(walked, expected);

    // next_nodup skips the remaining duplicates of k1
    let mut cursor = db.cursor(&txn);
    cursor.first().unwrap();
    let (key, value) = cursor.next_nodup().unwrap().unwrap();
    assert_eq!(key.as_ref(), b"k2");
    assert_eq!(value.as_ref(), b"w1");
}

#[test]
fn test_delete_single_dup() {
    let dir = TempDir::new().unwrap();
    let (env, db) = open_dup_env(&dir);

    let mut txn = env.begin_write().unwrap();
    for value in [&b"a"[..], b"b", b"c"] {
        db.put(&mut txn, b"x", value, WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.begin_write().unwrap();
    assert!(db.delete_dup(&mut txn, b"x", b"b").unwrap());
    assert!(!db.delete_dup(&mut txn, b"x", b"b").unwrap());
    txn.commit().unwrap();

    let txn = env.begin_read().unwrap();
    assert_eq!(db.stat(&txn).entries, 2);
    let mut cursor = db.cursor(&txn);
    let (_, value) = cursor.set(b"x").unwrap().unwrap();
    assert_eq!(value.as_ref(), b"a");
    let (_, value) = cursor.next_dup().unwrap().unwrap();
    assert_eq!(value.as_ref(), b"c");
    assert!(cursor.next_dup().unwrap().is_none());
}

#[test]
fn test_delete_key_drops_all_dups() {
    let dir = TempDir::new().unwrap();
    let (env, db) = open_dup_env(&dir);

    let mut txn = env.begin_write().unwrap();
    for i in 0..20u32 {
        db.put(&mut txn, b"many", format!("v{:02}", i).as_bytes(), WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.begin_write().unwrap();
    assert!(db.delete(&mut txn, b"many").unwrap());
    txn.commit().unwrap();

    let txn = env.begin_read().unwrap();
    assert_eq!(db.get(&txn, b"many").unwrap(), None);
    assert_eq!(db.stat(&txn).entries, 0);
}

#[test]
fn test_backward_dup_walk() {
    let dir = TempDir::new().unwrap();
    let (env, db) = open_dup_env(&dir);

    let mut txn = env.begin_write().unwrap();
    for value in [&b"a"[..], b"b", b"c"] {
        db.put(&mut txn, b"x", value, WriteFlags::empty()).unwrap();
    }
    db.put(&mut txn, b"w", b"only", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_read().unwrap();
    let mut cursor = db.cursor(&txn);

    // last() lands on the final duplicate of the final key
    let (key, value) = cursor.last().unwrap().unwrap();
    assert_eq!(key.as_ref(), b"x");
    assert_eq!(value.as_ref(), b"c");
    let (_, value) = cursor.prev_dup().unwrap().unwrap();
    assert_eq!(value.as_ref(), b"b");
    let (_, value) = cursor.prev().unwrap().unwrap();
    assert_eq!(value.as_ref(), b"a");
    // prev off the first duplicate moves to the previous key
    let (key, value) = cursor.prev().unwrap().unwrap();
    assert_eq!(key.as_ref(), b"w");
    assert_eq!(value.as_ref(), b"only");

    // prev_nodup from the duplicates of "x" skips straight to "w"
    let mut cursor = db.cursor(&txn);
    cursor.last().unwrap();
    let (key, _) = cursor.prev_nodup().unwrap().unwrap();
    assert_eq!(key.as_ref(), b"w");
}

#[test]
fn test_get_both() {
    let dir = TempDir::new().unwrap();
    let (env, db) = open_dup_env(&dir);

    let mut txn = env.begin_write().unwrap();
    for value in [&b"alpha"[..], b"beta", b"gamma"] {
        db.put(&mut txn, b"k", value, WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_read().unwrap();
    let mut cursor = db.cursor(&txn);
    assert!(cursor.get_both(b"k", b"beta").unwrap().is_some());
    assert!(cursor.get_both(b"k", b"bet").unwrap().is_none());

    let (_, value) = cursor.get_both_range(b"k", b"bet").unwrap().unwrap();
    assert_eq!(value.as_ref(), b"beta");
    assert!(cursor.get_both_range(b"k", b"zz").unwrap().is_none());
}

#[test]
fn test_dup_values_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let (env, db) = open_dup_env(&dir);
        let mut txn = env.begin_write().unwrap();
        db.put(&mut txn, b"k", b"v1", WriteFlags::empty()).unwrap();
        db.put(&mut txn, b"k", b"v2", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    {
        let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();
        let mut txn = env.begin_read().unwrap();
        let db = Database::open(&mut txn, Some("dups"), DatabaseFlags::DUPSORT).unwrap();
        assert_eq!(db.stat(&txn).entries, 2);
        assert_eq!(db.get(&txn, b"k").unwrap().as_deref(), Some(&b"v1"[..]));
    }
}
