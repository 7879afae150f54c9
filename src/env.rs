//! Environment management
//!
//! An environment owns one data file and one lock file inside a directory.
//! The data file is mapped read-only and shared; the writer mutates only
//! heap-backed dirty pages until commit publishes them with the two-meta
//! protocol. The per-name database descriptors are double-buffered so active
//! readers keep their snapshot while a commit publishes the next version.

use bitflags::bitflags;
use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::comparator::{self, CmpFn};
use crate::db::DatabaseFlags;
use crate::error::{Error, PageId, Result, TransactionId};
use crate::lock::LockFile;
use crate::meta::{self, Db, Meta, FREE_DBI, MAIN_DBI};
use crate::page::{Page, PageHeader, PAGE_SIZE};
use crate::txn::{Read, Transaction, Write};

/// Data file name inside the environment directory
pub const DATA_NAME: &str = "data.mdb";

/// Lock file name inside the environment directory
pub const LOCK_NAME: &str = "lock.mdb";

/// Default map size (1GB)
pub const DEFAULT_MAP_SIZE: usize = 1 << 30;

/// Default number of reader slots
pub const DEFAULT_MAX_READERS: usize = 126;

/// Maximum number of named databases
pub const MAX_DBS: usize = 128;

bitflags! {
    /// Environment flags, persisted in `meta.dbs[0].flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u16 {
        /// Require the map at the address recorded at creation
        const FIXEDMAP = 0x01;
        /// Skip the commit fsyncs; trades durability for speed
        const NOSYNC = 0x02;
        /// Open read-only; write transactions are refused
        const RDONLY = 0x04;
    }
}

/// Per-database static state: name and comparators
pub(crate) struct Dbx {
    pub(crate) name: Option<String>,
    pub(crate) cmp: CmpFn,
    pub(crate) dcmp: CmpFn,
    pub(crate) flags: DatabaseFlags,
}

/// Last committed state published for new transactions: the meta image and
/// the named-database descriptors that go with it
pub(crate) struct DbTable {
    pub(crate) txnid: TransactionId,
    pub(crate) named: Vec<Db>,
}

/// Shared environment state
pub(crate) struct EnvInner {
    pub(crate) path: PathBuf,
    pub(crate) file: File,
    pub(crate) map: Mmap,
    pub(crate) map_size: usize,
    pub(crate) flags: EnvFlags,
    pub(crate) max_dbs: usize,
    pub(crate) lock: LockFile,
    /// Slot 0 is the free DB, slot 1 the main DB, named DBs follow
    pub(crate) dbx: RwLock<Vec<Dbx>>,
    pub(crate) db_table: RwLock<DbTable>,
}

impl EnvInner {
    /// Read both meta pages from the map and pick the authoritative one
    pub(crate) fn meta(&self) -> Result<Meta> {
        let m0 = self.map_page(PageId(0)).and_then(Meta::from_page);
        let m1 = self.map_page(PageId(1)).and_then(Meta::from_page);
        let (picked, _) = meta::pick_meta(m0, m1)?;
        Ok(picked)
    }

    /// Resolve a page number inside the shared map
    pub(crate) fn map_page(&self, pgno: PageId) -> Result<&Page> {
        let off = pgno.0 as usize * PAGE_SIZE;
        if off + PAGE_SIZE > self.map.len() {
            return Err(Error::Corruption {
                details: format!("page {} beyond the map", pgno.0),
                page_id: Some(pgno),
            });
        }
        Ok(unsafe { Page::from_raw(&self.map[off..off + PAGE_SIZE]) })
    }

    /// Borrow raw bytes from the map, used for overflow values that span
    /// contiguous pages
    pub(crate) fn map_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if offset + len > self.map.len() {
            return Err(Error::Corruption {
                details: "value extends beyond the map".into(),
                page_id: None,
            });
        }
        Ok(&self.map[offset..offset + len])
    }
}

/// Builder for opening environments
pub struct EnvBuilder {
    map_size: usize,
    max_readers: usize,
    max_dbs: usize,
    flags: EnvFlags,
}

impl EnvBuilder {
    /// Create a builder with default sizing
    pub fn new() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: MAX_DBS,
            flags: EnvFlags::empty(),
        }
    }

    /// Set the map size in bytes; rounded up to a whole page
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        self
    }

    /// Set the maximum number of reader slots
    pub fn max_readers(mut self, readers: usize) -> Self {
        self.max_readers = readers;
        self
    }

    /// Set the maximum number of named databases
    pub fn max_dbs(mut self, dbs: usize) -> Self {
        self.max_dbs = dbs.min(MAX_DBS);
        self
    }

    /// Set environment flags
    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Open the environment at `path` (a directory)
    pub fn open(self, path: impl AsRef<Path>) -> Result<Environment> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let host_page = page_size::get();
        if host_page != PAGE_SIZE {
            warn!(host_page, page_size = PAGE_SIZE, "host page size differs from file format");
        }

        let lock = LockFile::open(&path.join(LOCK_NAME), self.max_readers)?;

        let data_path = path.join(DATA_NAME);
        let rdonly = self.flags.contains(EnvFlags::RDONLY);
        let file = if rdonly {
            OpenOptions::new().read(true).open(&data_path)?
        } else {
            OpenOptions::new().read(true).write(true).create(true).open(&data_path)?
        };

        let mut len = file.metadata()?.len();
        let created = len == 0;
        if created {
            if rdonly {
                return Err(Error::Perm("cannot create a read-only environment"));
            }
            debug!(path = %path.display(), map_size = self.map_size, "creating environment");
            // Size the whole map up front (sparse), then seed both metas so
            // either page is a valid recovery point.
            file.set_len(self.map_size as u64)?;
            let meta = Meta::new(self.map_size as u64, self.flags.bits());
            file.write_all_at(meta.to_page(PageId(0)).as_bytes(), 0)?;
            file.write_all_at(meta.to_page(PageId(1)).as_bytes(), PAGE_SIZE as u64)?;
            file.sync_all()?;
            len = self.map_size as u64;
        } else if len < (2 * PAGE_SIZE) as u64 {
            return Err(Error::Invalid("data file too small for meta pages"));
        } else if !rdonly && len < self.map_size as u64 {
            file.set_len(self.map_size as u64)?;
            len = self.map_size as u64;
        }

        let map_size = if rdonly { len as usize } else { self.map_size.max(len as usize) };
        let map = unsafe { MmapOptions::new().len(map_size).map(&file)? };

        let inner = EnvInner {
            path: path.to_path_buf(),
            file,
            map,
            map_size,
            flags: self.flags,
            max_dbs: self.max_dbs,
            lock,
            dbx: RwLock::new(Vec::new()),
            db_table: RwLock::new(DbTable { txnid: TransactionId(0), named: Vec::new() }),
        };

        let picked = inner.meta()?;
        let stored_flags = EnvFlags::from_bits_truncate(picked.dbs[FREE_DBI].flags);
        if stored_flags.contains(EnvFlags::FIXEDMAP) || self.flags.contains(EnvFlags::FIXEDMAP) {
            fixedmap_check(&inner, &picked, created)?;
        }
        debug!(
            txnid = picked.txnid,
            last_pgno = picked.last_pgno,
            meta_page = (picked.txnid % 2),
            "opened environment"
        );

        // Adopt the durable txnid so the shared counter is never behind
        // what a crashed writer committed.
        inner.lock.adopt_txnid(picked.txnid());
        {
            let mut table = inner.db_table.write();
            table.txnid = picked.txnid();
        }
        {
            let mut dbx = inner.dbx.write();
            dbx.push(Dbx {
                name: None,
                cmp: comparator::integer_key,
                dcmp: comparator::lexicographic,
                flags: DatabaseFlags::INTEGERKEY,
            });
            dbx.push(Dbx {
                name: None,
                cmp: comparator::lexicographic,
                dcmp: comparator::lexicographic,
                flags: DatabaseFlags::empty(),
            });
        }

        Ok(Environment { inner: Arc::new(inner) })
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Require that a FIXEDMAP environment landed at its recorded address;
/// record the address at creation.
fn fixedmap_check(inner: &EnvInner, picked: &Meta, created: bool) -> Result<()> {
    let base = inner.map.as_ptr() as u64;
    if picked.map_addr == 0 {
        if created || !inner.flags.contains(EnvFlags::RDONLY) {
            // Persist the address into both metas; the field sits before the
            // mutable tail and never changes afterwards.
            let off = PageHeader::SIZE as u64 + core::mem::offset_of!(Meta, map_addr) as u64;
            inner.file.write_all_at(&base.to_le_bytes(), off)?;
            inner.file.write_all_at(&base.to_le_bytes(), PAGE_SIZE as u64 + off)?;
            inner.file.sync_all()?;
        }
        return Ok(());
    }
    if picked.map_addr != base {
        return Err(Error::Invalid("map did not land at the fixed address"));
    }
    Ok(())
}

/// Database environment
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    /// Open with default options
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        EnvBuilder::new().open(path)
    }

    pub(crate) fn inner(&self) -> &Arc<EnvInner> {
        &self.inner
    }

    /// Begin a read transaction
    pub fn begin_read(&self) -> Result<Transaction<'_, Read>> {
        Transaction::new_read(self)
    }

    /// Begin the write transaction; blocks while another writer is active
    pub fn begin_write(&self) -> Result<Transaction<'_, Write>> {
        if self.inner.flags.contains(EnvFlags::RDONLY) {
            return Err(Error::Perm("environment is read-only"));
        }
        Transaction::new_write(self)
    }

    /// Flush the data file
    pub fn sync(&self) -> Result<()> {
        self.inner.file.sync_all()?;
        Ok(())
    }

    /// Statistics of the main database
    pub fn stat(&self) -> Result<crate::db::Stat> {
        let meta = self.inner.meta()?;
        Ok(crate::db::Stat::from_db(&meta.dbs[MAIN_DBI]))
    }

    /// Number of live read snapshots
    pub fn reader_count(&self) -> usize {
        self.inner.lock.live_readers()
    }

    /// The environment directory
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}
