//! Database handles
//!
//! An environment carries two built-in B+trees (the free list and the main
//! database) and up to `max_dbs` named databases. A named database lives as
//! a descriptor record under its name in the main database; opening one
//! binds a `Database` handle to a slot with its comparators and flags.

use bitflags::bitflags;
use std::borrow::Cow;
use std::cmp::Ordering;

use crate::btree;
use crate::comparator::{self, CmpFn};
use crate::cursor::Cursor;
use crate::env::Dbx;
use crate::error::{Error, PageId, Result};
use crate::meta::{Db, MAIN_DBI};
use crate::page::NodeFlags;
use crate::txn::{mode::Mode, Transaction, Write};

bitflags! {
    /// Per-database flags, persisted in the descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DatabaseFlags: u16 {
        /// Compare keys back to front
        const REVERSEKEY = 0x02;
        /// Keys map to sorted sets of duplicate values
        const DUPSORT = 0x04;
        /// Keys are same-width little-endian unsigned integers
        const INTEGERKEY = 0x08;
        /// Create the database if it is absent (open-time only)
        const CREATE = 0x4000;
        /// Flags stored on disk
        const PERSISTENT = Self::REVERSEKEY.bits() | Self::DUPSORT.bits() |
                           Self::INTEGERKEY.bits();
    }
}

bitflags! {
    /// Flags for put operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u16 {
        /// Fail with `KeyExist` instead of overwriting
        const NOOVERWRITE = 0x10;
        /// On DUPSORT databases, fail with `KeyExist` when the exact
        /// key/value pair is already present
        const NODUPDATA = 0x20;
    }
}

/// Statistics for one database
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// Page size of the environment
    pub psize: u32,
    /// Tree depth; 0 when empty
    pub depth: u16,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data items
    pub entries: u64,
}

impl Stat {
    pub(crate) fn from_db(db: &Db) -> Self {
        Self {
            psize: crate::page::PAGE_SIZE as u32,
            depth: db.depth,
            branch_pages: db.branch_pages,
            leaf_pages: db.leaf_pages,
            overflow_pages: db.overflow_pages,
            entries: db.entries,
        }
    }
}

/// Handle to one database within an environment
#[derive(Debug, Clone)]
pub struct Database {
    dbi: usize,
}

impl Database {
    /// The unnamed main database
    pub fn main() -> Self {
        Self { dbi: MAIN_DBI }
    }

    /// Open an existing database by name; `None` is the main database
    pub fn open<M: Mode>(
        txn: &mut Transaction<'_, M>,
        name: Option<&str>,
        flags: DatabaseFlags,
    ) -> Result<Self> {
        match Self::open_existing(txn, name, flags)? {
            Some(db) => Ok(db),
            None => Err(Error::NotFound),
        }
    }

    /// Open a database by name, creating it when absent (`CREATE` semantics)
    pub fn create(
        txn: &mut Transaction<'_, Write>,
        name: Option<&str>,
        flags: DatabaseFlags,
    ) -> Result<Self> {
        if let Some(db) = Self::open_existing(txn, name, flags)? {
            return Ok(db);
        }
        let name = name.ok_or(Error::Invalid("the main database always exists"))?;
        let db = Db { flags: (flags & DatabaseFlags::PERSISTENT).bits(), ..Db::default() };
        let dbi = register_name(txn, name, DatabaseFlags::from_bits_truncate(db.flags))?;
        txn.register_dbi(dbi, db)?;
        // Persist the empty descriptor under the name
        btree::put(
            txn,
            MAIN_DBI,
            name.as_bytes(),
            &db.to_bytes(),
            WriteFlags::empty(),
            NodeFlags::SUBDATA,
        )?;
        Ok(Self { dbi })
    }

    fn open_existing<M: Mode>(
        txn: &mut Transaction<'_, M>,
        name: Option<&str>,
        flags: DatabaseFlags,
    ) -> Result<Option<Self>> {
        let Some(name) = name else {
            return Ok(Some(Self::main()));
        };
        let inner = txn.env.inner();

        // Re-use a slot another transaction already registered
        let existing = {
            let dbx = inner.dbx.read();
            dbx.iter().position(|d| d.name.as_deref() == Some(name))
        };
        if let Some(dbi) = existing {
            txn.ensure_dbi(dbi)?;
            if txn.dbs[dbi].root == crate::page::P_INVALID && txn.dbs[dbi].entries == 0 {
                // The slot may outlive an aborted create; the record decides
                if btree::get(txn, MAIN_DBI, name.as_bytes())?.is_none() {
                    return Ok(None);
                }
            }
            return Ok(Some(Self { dbi }));
        }

        let Some(bytes) = btree::get(txn, MAIN_DBI, name.as_bytes())? else {
            return Ok(None);
        };
        let db = Db::from_bytes(&bytes)?;
        let stored = DatabaseFlags::from_bits_truncate(db.flags);
        if !(flags & DatabaseFlags::PERSISTENT).is_empty()
            && (flags & DatabaseFlags::PERSISTENT) != stored
        {
            return Err(Error::Invalid("database flags differ from the stored ones"));
        }
        let dbi = register_name(txn, name, stored)?;
        txn.register_dbi(dbi, db)?;
        Ok(Some(Self { dbi }))
    }

    /// Replace the key comparator of this database
    ///
    /// Must be set before any access in the transaction; applies
    /// environment-wide for subsequently opened transactions too.
    pub fn set_compare(&self, txn: &Transaction<'_, impl Mode>, cmp: fn(&[u8], &[u8]) -> Ordering) {
        txn.env.inner().dbx.write()[self.dbi].cmp = cmp;
    }

    /// Replace the duplicate comparator of this DUPSORT database
    pub fn set_dup_compare(
        &self,
        txn: &Transaction<'_, impl Mode>,
        dcmp: fn(&[u8], &[u8]) -> Ordering,
    ) {
        txn.env.inner().dbx.write()[self.dbi].dcmp = dcmp;
    }

    /// Look up `key`; on DUPSORT databases, the first duplicate
    pub fn get<'txn, M: Mode>(
        &self,
        txn: &'txn Transaction<'txn, M>,
        key: &[u8],
    ) -> Result<Option<Cow<'txn, [u8]>>> {
        let db = txn.dbs[self.dbi];
        let cmp = txn.cmp(self.dbi);
        let Some((frames, exact)) = btree::descend(txn, &db, cmp, btree::SeekKey::Key(key))?
        else {
            return Ok(None);
        };
        if !exact {
            return Ok(None);
        }
        let (leaf, idx) = frames[frames.len() - 1];
        let page = txn.get_page(PageId(leaf))?;
        let nf = page.node_flags(idx)?;
        if nf.contains(NodeFlags::SUBDATA) && self.is_dupsort(txn) {
            // First duplicate: smallest key of the sub-tree
            let sub = Db::from_bytes(page.node_data(idx)?)?;
            let Some((sframes, _)) =
                btree::descend(txn, &sub, txn.dcmp(self.dbi), btree::SeekKey::Lowest)?
            else {
                return Ok(None);
            };
            let (sleaf, sidx) = sframes[sframes.len() - 1];
            return Ok(Some(Cow::Borrowed(txn.get_page(PageId(sleaf))?.node_key(sidx)?)));
        }
        if nf.contains(NodeFlags::BIGDATA) {
            let head = page.node_overflow_pgno(idx)?;
            let size = page.node_data_size(idx)?;
            return Ok(Some(crate::overflow::read_value(txn, head, size)?));
        }
        Ok(Some(Cow::Borrowed(page.node_data(idx)?)))
    }

    /// Store `key -> data`
    pub fn put(
        &self,
        txn: &mut Transaction<'_, Write>,
        key: &[u8],
        data: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        btree::put(txn, self.dbi, key, data, flags, NodeFlags::empty())
    }

    /// Delete `key` with all its duplicates; returns whether it existed
    pub fn delete(&self, txn: &mut Transaction<'_, Write>, key: &[u8]) -> Result<bool> {
        match btree::del(txn, self.dbi, key, None) {
            Ok(()) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete one duplicate of `key`; returns whether the pair existed
    pub fn delete_dup(
        &self,
        txn: &mut Transaction<'_, Write>,
        key: &[u8],
        data: &[u8],
    ) -> Result<bool> {
        match btree::del(txn, self.dbi, key, Some(data)) {
            Ok(()) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a cursor over this database
    pub fn cursor<'txn, M: Mode>(&self, txn: &'txn Transaction<'txn, M>) -> Cursor<'txn, M> {
        Cursor::new(txn, self.dbi)
    }

    /// Statistics of this database within the transaction's snapshot
    pub fn stat<M: Mode>(&self, txn: &Transaction<'_, M>) -> Stat {
        Stat::from_db(&txn.dbs[self.dbi])
    }

    fn is_dupsort<M: Mode>(&self, txn: &Transaction<'_, M>) -> bool {
        txn.db_flags(self.dbi).contains(DatabaseFlags::DUPSORT)
    }
}

/// Register `name` in the environment's slot table, or find its slot
fn register_name<M: Mode>(
    txn: &Transaction<'_, M>,
    name: &str,
    stored: DatabaseFlags,
) -> Result<usize> {
    let inner = txn.env.inner();
    let mut dbx = inner.dbx.write();
    if let Some(i) = dbx.iter().position(|d| d.name.as_deref() == Some(name)) {
        return Ok(i);
    }
    if dbx.len() - 2 >= inner.max_dbs {
        return Err(Error::NoSpace);
    }
    dbx.push(Dbx {
        name: Some(name.to_string()),
        cmp: comparator::for_flags(stored),
        dcmp: comparator::lexicographic,
        flags: stored,
    });
    Ok(dbx.len() - 1)
}

/// A comparison function usable as a custom comparator
pub type CompareFn = CmpFn;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_named_db_round_trip() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();

        let mut wtxn = env.begin_write().unwrap();
        let db = Database::create(&mut wtxn, Some("colors"), DatabaseFlags::CREATE).unwrap();
        db.put(&mut wtxn, b"sky", b"blue", WriteFlags::empty()).unwrap();
        db.put(&mut wtxn, b"grass", b"green", WriteFlags::empty()).unwrap();
        wtxn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let db = Database::open(&mut rtxn, Some("colors"), DatabaseFlags::empty()).unwrap();
        assert_eq!(db.get(&rtxn, b"sky").unwrap().as_deref(), Some(&b"blue"[..]));
        assert_eq!(db.get(&rtxn, b"grass").unwrap().as_deref(), Some(&b"green"[..]));
        assert_eq!(db.stat(&rtxn).entries, 2);
    }

    #[test]
    fn test_missing_named_db() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();
        let mut rtxn = env.begin_read().unwrap();
        assert!(matches!(
            Database::open(&mut rtxn, Some("nope"), DatabaseFlags::empty()),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_custom_comparator() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();

        let mut wtxn = env.begin_write().unwrap();
        let db = Database::create(&mut wtxn, Some("rev"), DatabaseFlags::CREATE).unwrap();
        // Install the ordering before the first insert
        db.set_compare(&wtxn, crate::comparator::reverse_lexicographic);
        for key in [&b"xa"[..], b"yb", b"za"] {
            db.put(&mut wtxn, key, b"v", WriteFlags::empty()).unwrap();
        }
        wtxn.commit().unwrap();

        let txn = env.begin_read().unwrap();
        let mut cursor = db.cursor(&txn);
        // Byte-reverse order: last byte decides, "xa" < "za" < "yb"
        let (key, _) = cursor.first().unwrap().unwrap();
        assert_eq!(key.as_ref(), b"xa");
        let (key, _) = cursor.next().unwrap().unwrap();
        assert_eq!(key.as_ref(), b"za");
        let (key, _) = cursor.next().unwrap().unwrap();
        assert_eq!(key.as_ref(), b"yb");
    }

    #[test]
    fn test_noopverwrite_flag() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();
        let db = Database::main();

        let mut wtxn = env.begin_write().unwrap();
        db.put(&mut wtxn, b"k", b"v1", WriteFlags::empty()).unwrap();
        assert!(matches!(
            db.put(&mut wtxn, b"k", b"v2", WriteFlags::NOOVERWRITE),
            Err(Error::KeyExist)
        ));
        db.put(&mut wtxn, b"k", b"v2", WriteFlags::empty()).unwrap();
        assert_eq!(db.get(&wtxn, b"k").unwrap().as_deref(), Some(&b"v2"[..]));
    }
}
