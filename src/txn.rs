//! Transaction management
//!
//! Read transactions register a snapshot in the shared reader table and
//! resolve pages straight from the map. The single write transaction owns a
//! queue of heap-backed dirty pages, an IDL of pages it freed, and a reclaim
//! list drained from the free database. Commit serializes freed pages into
//! the free DB, appends dirty pages with scatter-gather writes, fsyncs,
//! flips the meta toggle, and fsyncs again.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::os::unix::io::AsRawFd;
use tracing::{debug, trace};

use crate::btree;
use crate::comparator::CmpFn;
use crate::db::DatabaseFlags;
use crate::env::Environment;
use crate::error::{Error, PageId, Result, TransactionId};
use crate::freelist;
use crate::idl::Idl;
use crate::lock::WriterGuard;
use crate::meta::{Db, Meta, FREE_DBI, MAIN_DBI};
use crate::page::{Page, PageFlags, PAGE_SIZE};

/// Upper bound on scatter-gather vectors per commit write
pub const COMMIT_PAGES: usize = 64;

/// Transaction mode marker traits
pub mod mode {
    pub(crate) mod sealed {
        pub trait Sealed {}
    }

    /// Transaction mode trait
    pub trait Mode: sealed::Sealed {
        /// Whether this is a write transaction
        const IS_WRITE: bool;
    }
}

/// Read-only transaction mode
#[derive(Debug)]
pub struct Read;

impl mode::sealed::Sealed for Read {}
impl mode::Mode for Read {
    const IS_WRITE: bool = false;
}

/// Read-write transaction mode
#[derive(Debug)]
pub struct Write;

impl mode::sealed::Sealed for Write {}
impl mode::Mode for Write {
    const IS_WRITE: bool = true;
}

/// A dirty page queued for commit; overflow runs carry the pages past the
/// head as raw bytes
pub(crate) struct DirtyPage {
    pub(crate) page: Box<Page>,
    pub(crate) tail: Vec<u8>,
}

impl DirtyPage {
    fn new(page: Box<Page>) -> Self {
        Self { page, tail: Vec::new() }
    }

    /// Number of file pages this entry spans
    fn span(&self) -> u64 {
        1 + (self.tail.len() / PAGE_SIZE) as u64
    }
}

/// A batch of freed pages pulled back from the free DB, keyed by the
/// transaction that freed them
pub(crate) struct Reclaim {
    pub(crate) txnid: TransactionId,
    pub(crate) ids: Idl,
}

pub(crate) struct WriteState<'env> {
    _writer: WriterGuard<'env>,
    pub(crate) dirty: BTreeMap<u64, DirtyPage>,
    /// Pages freed by this transaction
    pub(crate) free_pgs: Idl,
    /// Pages ready for reuse, drained from the free DB
    pub(crate) reclaim: Option<Reclaim>,
    pub(crate) next_pgno: u64,
    /// While saving the free DB at commit, allocation is pinned to the tail
    /// so the serialized records stay stable
    freelist_save: bool,
    /// Set after an I/O failure; poisons the transaction until abort
    error: bool,
}

pub(crate) enum ModeData<'env> {
    Read { slot: Option<usize> },
    Write(Box<WriteState<'env>>),
}

/// A database transaction
pub struct Transaction<'env, M: mode::Mode> {
    pub(crate) env: &'env Environment,
    id: TransactionId,
    pub(crate) meta: Meta,
    /// Descriptor snapshot per dbi: 0 free DB, 1 main DB, named DBs follow
    pub(crate) dbs: Vec<Db>,
    /// Which databases this transaction has modified
    pub(crate) db_dirty: Vec<bool>,
    pub(crate) mode: ModeData<'env>,
    done: bool,
    _marker: PhantomData<M>,
}

/// Type alias for a read-only transaction
pub type ReadTransaction<'env> = Transaction<'env, Read>;

/// Type alias for the write transaction
pub type WriteTransaction<'env> = Transaction<'env, Write>;

impl<'env> Transaction<'env, Read> {
    pub(crate) fn new_read(env: &'env Environment) -> Result<Self> {
        let inner = env.inner();
        let snapshot = inner.lock.txnid();
        let slot = inner.lock.slot_claim(snapshot)?;
        let meta = match inner.meta() {
            Ok(meta) => meta,
            Err(e) => {
                inner.lock.slot_idle(slot);
                return Err(e);
            }
        };

        let mut txn = Self {
            env,
            id: snapshot,
            meta,
            dbs: vec![meta.dbs[FREE_DBI], meta.dbs[MAIN_DBI]],
            db_dirty: Vec::new(),
            mode: ModeData::Read { slot: Some(slot) },
            done: false,
            _marker: PhantomData,
        };
        txn.seed_named()?;
        Ok(txn)
    }
}

impl<'env> Transaction<'env, Write> {
    pub(crate) fn new_write(env: &'env Environment) -> Result<Self> {
        let inner = env.inner();
        let writer = inner.lock.writer_lock()?;
        let meta = inner.meta()?;
        // The durable meta, not the shared counter, decides the next id;
        // this keeps the meta toggle alternating even after a crash left
        // the counter ahead of the last commit.
        let id = TransactionId(meta.txnid + 1);
        inner.lock.store_txnid(id);
        trace!(txnid = id.0, next_pgno = meta.last_pgno + 1, "write transaction begins");

        let mut txn = Self {
            env,
            id,
            meta,
            dbs: vec![meta.dbs[FREE_DBI], meta.dbs[MAIN_DBI]],
            db_dirty: Vec::new(),
            mode: ModeData::Write(Box::new(WriteState {
                _writer: writer,
                dirty: BTreeMap::new(),
                free_pgs: Idl::new(),
                reclaim: None,
                next_pgno: meta.last_pgno + 1,
                freelist_save: false,
                error: false,
            })),
            done: false,
            _marker: PhantomData,
        };
        match txn.seed_named() {
            Ok(()) => Ok(txn),
            Err(e) => {
                // Drop runs the abort path and rolls the txnid back
                drop(txn);
                Err(e)
            }
        }
    }
}

impl<'env, M: mode::Mode> Transaction<'env, M> {
    /// The transaction id; for readers, the snapshot id
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Snapshot the named-database descriptors
    ///
    /// The published table is used when it matches this snapshot's meta;
    /// otherwise (a commit in another process, or one racing this begin)
    /// each record is re-read from the main DB of this snapshot.
    fn seed_named(&mut self) -> Result<()> {
        let inner = self.env.inner();
        let (table_txnid, named) = {
            let table = inner.db_table.read();
            (table.txnid, table.named.clone())
        };
        if table_txnid == self.meta.txnid() {
            self.dbs.extend(named);
        } else {
            let names: Vec<(Option<String>, DatabaseFlags)> = {
                let dbx = inner.dbx.read();
                dbx.iter().skip(2).map(|d| (d.name.clone(), d.flags)).collect()
            };
            for (name, flags) in names {
                let db = match name {
                    Some(ref n) => match btree::get(self, MAIN_DBI, n.as_bytes())? {
                        Some(data) => Db::from_bytes(&data)?,
                        None => Db { flags: flags.bits(), ..Db::default() },
                    },
                    None => Db::default(),
                };
                self.dbs.push(db);
            }
        }
        self.db_dirty = vec![false; self.dbs.len()];
        Ok(())
    }

    /// Make sure this transaction carries descriptor slots up to `dbi`,
    /// resolving late-opened names from its own main-DB snapshot
    pub(crate) fn ensure_dbi(&mut self, dbi: usize) -> Result<()> {
        while self.dbs.len() <= dbi {
            let next = self.dbs.len();
            let (name, flags) = {
                let dbx = self.env.inner().dbx.read();
                let entry = dbx.get(next).ok_or(Error::Invalid("unknown database slot"))?;
                (entry.name.clone(), entry.flags)
            };
            let db = match name {
                Some(ref n) => match btree::get(self, MAIN_DBI, n.as_bytes())? {
                    Some(data) => Db::from_bytes(&data)?,
                    None => Db { flags: flags.bits(), ..Db::default() },
                },
                None => Db::default(),
            };
            self.dbs.push(db);
            self.db_dirty.push(false);
        }
        Ok(())
    }

    /// Install a known descriptor at `dbi`
    pub(crate) fn register_dbi(&mut self, dbi: usize, db: Db) -> Result<()> {
        if dbi > 0 && self.dbs.len() < dbi {
            self.ensure_dbi(dbi - 1)?;
        }
        if self.dbs.len() == dbi {
            self.dbs.push(db);
            self.db_dirty.push(false);
        } else {
            self.dbs[dbi] = db;
        }
        Ok(())
    }

    /// Key comparator of a database
    pub(crate) fn cmp(&self, dbi: usize) -> CmpFn {
        self.env.inner().dbx.read()[dbi].cmp
    }

    /// Duplicate comparator of a database
    pub(crate) fn dcmp(&self, dbi: usize) -> CmpFn {
        self.env.inner().dbx.read()[dbi].dcmp
    }

    /// Flags of a database
    pub(crate) fn db_flags(&self, dbi: usize) -> DatabaseFlags {
        DatabaseFlags::from_bits_truncate(self.dbs[dbi].flags)
    }

    /// The dirty entry behind `pgno`, if this is a writer and the page is
    /// in its queue
    pub(crate) fn dirty_entry(&self, pgno: PageId) -> Option<&DirtyPage> {
        match &self.mode {
            ModeData::Write(ws) => ws.dirty.get(&pgno.0),
            ModeData::Read { .. } => None,
        }
    }

    /// Resolve a page: the dirty queue first for writers, then the map
    pub(crate) fn get_page(&self, pgno: PageId) -> Result<&Page> {
        if let ModeData::Write(ws) = &self.mode {
            if let Some(dp) = ws.dirty.get(&pgno.0) {
                return Ok(&dp.page);
            }
            if pgno.0 >= ws.next_pgno {
                return Err(Error::Corruption {
                    details: format!("page {} past the allocation frontier", pgno.0),
                    page_id: Some(pgno),
                });
            }
        }
        self.env.inner().map_page(pgno)
    }
}

impl<'env> Transaction<'env, Write> {
    pub(crate) fn ws(&self) -> &WriteState<'env> {
        match &self.mode {
            ModeData::Write(ws) => ws,
            ModeData::Read { .. } => unreachable!("write state on a read transaction"),
        }
    }

    pub(crate) fn ws_mut(&mut self) -> &mut WriteState<'env> {
        match &mut self.mode {
            ModeData::Write(ws) => ws,
            ModeData::Read { .. } => unreachable!("write state on a read transaction"),
        }
    }

    fn fail_if_poisoned(&self) -> Result<()> {
        if self.ws().error {
            return Err(Error::BadTransaction);
        }
        Ok(())
    }

    /// True when `pgno` is in this transaction's dirty queue
    pub(crate) fn is_dirty(&self, pgno: PageId) -> bool {
        self.ws().dirty.contains_key(&pgno.0)
    }

    /// Mutable access to a dirty page
    pub(crate) fn dirty_page_mut(&mut self, pgno: PageId) -> Result<&mut Page> {
        self.ws_mut()
            .dirty
            .get_mut(&pgno.0)
            .map(|dp| dp.page.as_mut())
            .ok_or(Error::Invalid("page is not dirty"))
    }

    /// Mutable access to a dirty entry including its overflow tail
    pub(crate) fn dirty_entry_mut(&mut self, pgno: PageId) -> Result<&mut DirtyPage> {
        self.ws_mut().dirty.get_mut(&pgno.0).ok_or(Error::Invalid("page is not dirty"))
    }

    /// Record a page as freed by this transaction
    pub(crate) fn free_page(&mut self, pgno: PageId) {
        self.ws_mut().free_pgs.push(pgno);
    }

    /// Acquire `num` contiguous page numbers
    ///
    /// Reuse policy, in order: pull the oldest free-DB entry into the
    /// reclaim list when it is safely behind every live reader, pop single
    /// pages from the reclaim list, otherwise extend the file tail. Multi-
    /// page requests always come from the tail; the free list is not
    /// searched for contiguous runs.
    pub(crate) fn alloc_pgno(&mut self, num: u64) -> Result<u64> {
        let in_save = self.ws().freelist_save;
        if !in_save {
            if self.id.0 > 2
                && self.ws().reclaim.is_none()
                && self.dbs[FREE_DBI].entries > 0
            {
                if let Some((freed_by, ids)) = freelist::read_oldest(self)? {
                    let oldest = self.env.inner().lock.oldest_reader();
                    if freed_by.0 < self.id.0 - 1
                        && oldest.map_or(true, |o| freed_by.0 < o.0)
                    {
                        trace!(
                            freed_by = freed_by.0,
                            pages = ids.len(),
                            "pulling free-DB entry into the reclaim list"
                        );
                        self.ws_mut().reclaim = Some(Reclaim { txnid: freed_by, ids });
                        freelist::delete_record(self, freed_by)?;
                    }
                }
            }
            if num == 1 {
                let oldest = self.env.inner().lock.oldest_reader();
                let ws = self.ws_mut();
                if let Some(rec) = &mut ws.reclaim {
                    if oldest.map_or(true, |o| o.0 > rec.txnid.0) {
                        if let Some(pg) = rec.ids.pop_last() {
                            if rec.ids.is_zero() {
                                ws.reclaim = None;
                            }
                            return Ok(pg);
                        }
                    }
                }
            }
        }
        let map_size = self.env.inner().map_size;
        let ws = self.ws_mut();
        let pg = ws.next_pgno;
        if (pg + num) as usize * PAGE_SIZE > map_size {
            return Err(Error::NoSpace);
        }
        ws.next_pgno += num;
        Ok(pg)
    }

    /// Allocate a fresh dirty page (or overflow run) of `num` pages
    pub(crate) fn alloc_page(&mut self, flags: PageFlags, num: u64) -> Result<PageId> {
        let pgno = self.alloc_pgno(num)?;
        let mut page = Page::new(PageId(pgno), flags | PageFlags::DIRTY);
        let tail = if num > 1 {
            page.set_overflow_count(num as u32);
            vec![0u8; (num - 1) as usize * PAGE_SIZE]
        } else {
            Vec::new()
        };
        self.ws_mut().dirty.insert(pgno, DirtyPage { page, tail });
        Ok(PageId(pgno))
    }

    /// Copy-on-write a page into the dirty queue
    ///
    /// No-op when the page is already dirty. Otherwise the content moves to
    /// a freshly allocated page number, the old number joins this txn's
    /// freed set, and the parent's child pointer (if any) is patched.
    pub(crate) fn touch(
        &mut self,
        pgno: PageId,
        parent: Option<(PageId, usize)>,
    ) -> Result<PageId> {
        if self.is_dirty(pgno) {
            return Ok(pgno);
        }
        let new_pgno = PageId(self.alloc_pgno(1)?);
        let mut copy = self.env.inner().map_page(pgno)?.to_owned_box();
        copy.header.pgno = new_pgno.0;
        copy.header.flags |= PageFlags::DIRTY.bits();
        self.ws_mut().dirty.insert(new_pgno.0, DirtyPage::new(copy));
        self.free_page(pgno);
        if let Some((ppgno, pidx)) = parent {
            self.dirty_page_mut(ppgno)?.set_node_child(pidx, new_pgno)?;
        }
        trace!(old = pgno.0, new = new_pgno.0, "copy-on-write");
        Ok(new_pgno)
    }

    /// Drop a page that was allocated and then emptied within this txn:
    /// remove it from the dirty queue and free its number
    pub(crate) fn discard_dirty(&mut self, pgno: PageId) {
        self.ws_mut().dirty.remove(&pgno.0);
        self.free_page(pgno);
    }

    /// Remove a dirty entry without freeing its number
    pub(crate) fn remove_dirty(&mut self, pgno: PageId) {
        self.ws_mut().dirty.remove(&pgno.0);
    }

    /// Mark a database modified; for named databases, first copy-on-write
    /// the main-DB path to its record so commit can update it in place
    pub(crate) fn mark_db_dirty(&mut self, dbi: usize) -> Result<()> {
        if self.db_dirty[dbi] {
            return Ok(());
        }
        if dbi > MAIN_DBI {
            let name = self.env.inner().dbx.read()[dbi]
                .name
                .clone()
                .ok_or(Error::Invalid("named database without a name"))?;
            btree::cow_path(self, MAIN_DBI, name.as_bytes())?;
        }
        self.db_dirty[dbi] = true;
        Ok(())
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<()> {
        if let Err(e) = self.fail_if_poisoned() {
            // A poisoned commit aborts implicitly
            return Err(e);
        }
        let no_writes = self.ws().dirty.is_empty()
            && self.ws().free_pgs.is_zero()
            && !self.db_dirty.iter().any(|&d| d);
        if no_writes {
            self.env.inner().lock.store_txnid(self.meta.txnid());
            self.done = true;
            return Ok(());
        }

        match self.commit_inner() {
            Ok(()) => {
                self.done = true;
                // Success returns directly; the abort path below never runs
                // for a committed transaction.
                Ok(())
            }
            Err(e) => {
                self.ws_mut().error = true;
                // Drop aborts and rolls back the txnid
                Err(e)
            }
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        let id = self.id;

        // Persist the unspent remainder of the reclaim list under its
        // original freeing txnid.
        self.ws_mut().freelist_save = true;
        if let Some(rec) = self.ws_mut().reclaim.take() {
            if !rec.ids.is_zero() {
                freelist::save_record(self, rec.txnid, &rec.ids)?;
            }
        }

        // Touch the free-DB path first so serializing this txn's freed set
        // observes every page the touches themselves free.
        if !self.ws().free_pgs.is_zero() {
            freelist::touch_tail(self)?;
            let ids = self.ws().free_pgs.clone();
            freelist::save_record(self, id, &ids)?;
        }

        // Updated records for every named DB modified by this txn; the
        // record size is fixed, so these overwrite dirty leaves in place.
        for dbi in 2..self.dbs.len() {
            if self.db_dirty[dbi] {
                let name = self.env.inner().dbx.read()[dbi]
                    .name
                    .clone()
                    .ok_or(Error::Invalid("named database without a name"))?;
                let record = self.dbs[dbi].to_bytes();
                btree::put(
                    self,
                    MAIN_DBI,
                    name.as_bytes(),
                    &record,
                    crate::db::WriteFlags::empty(),
                    crate::page::NodeFlags::SUBDATA,
                )?;
            }
        }

        let ndirty = self.ws().dirty.len();
        self.write_dirty_pages()?;

        let inner = self.env.inner();
        let nosync = inner.flags.contains(crate::env::EnvFlags::NOSYNC);
        if !nosync {
            inner.file.sync_data()?;
        }

        // Alternate meta: write only the mutable tail at the opposite toggle.
        let mut meta = self.meta;
        meta.dbs[FREE_DBI].depth = self.dbs[FREE_DBI].depth;
        meta.dbs[FREE_DBI].branch_pages = self.dbs[FREE_DBI].branch_pages;
        meta.dbs[FREE_DBI].leaf_pages = self.dbs[FREE_DBI].leaf_pages;
        meta.dbs[FREE_DBI].overflow_pages = self.dbs[FREE_DBI].overflow_pages;
        meta.dbs[FREE_DBI].entries = self.dbs[FREE_DBI].entries;
        meta.dbs[FREE_DBI].root = self.dbs[FREE_DBI].root;
        meta.dbs[MAIN_DBI] = self.dbs[MAIN_DBI];
        meta.last_pgno = self.ws().next_pgno - 1;
        meta.txnid = id.0;
        use std::os::unix::fs::FileExt;
        let target = PageId(id.0 % 2);
        let target_intact =
            inner.map_page(target).and_then(crate::meta::Meta::from_page).is_ok();
        if target_intact {
            inner.file.write_all_at(meta.tail_bytes(), Meta::tail_file_offset(id))?;
        } else {
            // The page we are toggling onto was torn; rewrite it whole so
            // its header becomes valid again.
            inner
                .file
                .write_all_at(meta.to_page(target).as_bytes(), target.to_offset(PAGE_SIZE))?;
        }
        if !nosync {
            inner.file.sync_data()?;
        }

        // Publish the named descriptors for the next transactions.
        {
            let mut table = inner.db_table.write();
            table.txnid = id;
            table.named = self.dbs[2..].to_vec();
        }
        debug!(
            txnid = id.0,
            dirty = ndirty,
            freed = self.ws().free_pgs.len(),
            last_pgno = meta.last_pgno,
            "commit"
        );
        Ok(())
    }

    /// Walk the dirty queue in ascending page order, coalescing contiguous
    /// runs into scatter-gather writes
    fn write_dirty_pages(&mut self) -> Result<()> {
        let ws = self.ws_mut();
        for dp in ws.dirty.values_mut() {
            dp.page.header.flags &= !PageFlags::DIRTY.bits();
        }

        let fd = self.env.inner().file.as_raw_fd();
        let mut batch: Vec<(*const u8, usize)> = Vec::with_capacity(COMMIT_PAGES);
        let mut batch_off: u64 = 0;
        let mut next_contiguous: u64 = 0;

        let ws = self.ws();
        for (&pgno, dp) in ws.dirty.iter() {
            if !batch.is_empty() && (pgno != next_contiguous || batch.len() >= COMMIT_PAGES) {
                pwritev_all(fd, &batch, batch_off)?;
                batch.clear();
            }
            if batch.is_empty() {
                batch_off = pgno * PAGE_SIZE as u64;
            }
            batch.push((dp.page.as_bytes().as_ptr(), PAGE_SIZE));
            if !dp.tail.is_empty() {
                batch.push((dp.tail.as_ptr(), dp.tail.len()));
            }
            next_contiguous = pgno + dp.span();
        }
        if !batch.is_empty() {
            pwritev_all(fd, &batch, batch_off)?;
        }
        Ok(())
    }
}

/// Vectored positional write of `pieces`, retrying on short writes
fn pwritev_all(fd: i32, pieces: &[(*const u8, usize)], offset: u64) -> Result<()> {
    let mut iovs: Vec<libc::iovec> = pieces
        .iter()
        .map(|&(base, len)| libc::iovec { iov_base: base as *mut libc::c_void, iov_len: len })
        .collect();
    let mut off = offset as libc::off_t;
    let mut idx = 0;
    while idx < iovs.len() {
        let n = unsafe {
            libc::pwritev(fd, iovs[idx..].as_ptr(), (iovs.len() - idx) as libc::c_int, off)
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut written = n as usize;
        off += n as libc::off_t;
        while idx < iovs.len() && written >= iovs[idx].iov_len {
            written -= iovs[idx].iov_len;
            idx += 1;
        }
        if idx < iovs.len() && written > 0 {
            iovs[idx].iov_base = unsafe { (iovs[idx].iov_base as *mut u8).add(written) } as *mut _;
            iovs[idx].iov_len -= written;
        }
    }
    Ok(())
}

impl<'env, M: mode::Mode> Transaction<'env, M> {
    /// Abort the transaction, releasing its snapshot or discarding its
    /// dirty pages
    pub fn abort(self) {
        // Drop does the work
    }
}

impl<'env, M: mode::Mode> Drop for Transaction<'env, M> {
    fn drop(&mut self) {
        match &mut self.mode {
            ModeData::Read { slot } => {
                if let Some(slot) = slot.take() {
                    self.env.inner().lock.slot_idle(slot);
                }
            }
            ModeData::Write(ws) => {
                if !self.done {
                    trace!(txnid = self.id.0, "write transaction aborts");
                    ws.dirty.clear();
                    ws.reclaim = None;
                    self.env.inner().lock.store_txnid(self.meta.txnid());
                }
                // The writer guard is released when `ws` drops
            }
        }
    }
}
