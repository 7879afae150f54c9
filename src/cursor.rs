//! Database cursors
//!
//! A cursor keeps an explicit stack of `(page, index)` frames from the root
//! to its current leaf position, so sibling traversal never re-searches from
//! the top. On DUPSORT databases a nested sub-cursor tracks the position
//! inside the current key's duplicate sub-tree and is repositioned whenever
//! the main cursor moves.

use std::borrow::Cow;

use crate::btree::{self, Frames, SeekKey};
use crate::error::{Error, PageId, Result};
use crate::meta::Db;
use crate::overflow;
use crate::page::NodeFlags;
use crate::txn::{mode::Mode, Transaction};

/// Position inside the duplicate sub-tree of the current key
struct SubCursor {
    db: Db,
    frames: Frames,
}

/// A cursor over one database
pub struct Cursor<'txn, M: Mode> {
    txn: &'txn Transaction<'txn, M>,
    dbi: usize,
    frames: Frames,
    init: bool,
    eof: bool,
    sub: Option<SubCursor>,
}

/// One cursor entry: key and value, borrowed from the snapshot when possible
pub type Entry<'txn> = (Cow<'txn, [u8]>, Cow<'txn, [u8]>);

/// Step the deepest movable frame of `frames` one sibling over, then walk
/// back down to a leaf along the near edge
fn advance<M: Mode>(
    txn: &Transaction<'_, M>,
    frames: &mut Frames,
    forward: bool,
) -> Result<bool> {
    let mut lvl = frames.len();
    loop {
        if lvl <= 1 {
            return Ok(false);
        }
        let (ppg, pidx) = frames[lvl - 2];
        let pnum = txn.get_page(PageId(ppg))?.num_keys();
        if forward && pidx + 1 < pnum {
            frames[lvl - 2].1 = pidx + 1;
            break;
        }
        if !forward && pidx > 0 {
            frames[lvl - 2].1 = pidx - 1;
            break;
        }
        lvl -= 1;
    }
    frames.truncate(lvl - 1);
    let (ppg, pidx) = frames[lvl - 2];
    let mut pgno = txn.get_page(PageId(ppg))?.node_child(pidx)?.0;
    loop {
        let page = txn.get_page(PageId(pgno))?;
        let n = page.num_keys();
        let idx = if forward { 0 } else { n - 1 };
        let is_leaf = page.is_leaf();
        let child = if is_leaf { 0 } else { page.node_child(idx)?.0 };
        frames.push((pgno, idx));
        if is_leaf {
            return Ok(true);
        }
        pgno = child;
    }
}

/// Step within the current leaf, falling over to the sibling at the edge
fn step<M: Mode>(txn: &Transaction<'_, M>, frames: &mut Frames, forward: bool) -> Result<bool> {
    let last = frames.len() - 1;
    let (pgno, idx) = frames[last];
    if forward {
        let n = txn.get_page(PageId(pgno))?.num_keys();
        if idx + 1 < n {
            frames[last].1 = idx + 1;
            return Ok(true);
        }
    } else if idx > 0 {
        frames[last].1 = idx - 1;
        return Ok(true);
    }
    advance(txn, frames, forward)
}

impl<'txn, M: Mode> Cursor<'txn, M> {
    pub(crate) fn new(txn: &'txn Transaction<'txn, M>, dbi: usize) -> Self {
        Self { txn, dbi, frames: Frames::new(), init: false, eof: false, sub: None }
    }

    fn db(&self) -> Db {
        self.txn.dbs[self.dbi]
    }

    fn is_dupsort(&self) -> bool {
        self.dbi != crate::meta::FREE_DBI
            && self.txn.db_flags(self.dbi).contains(crate::db::DatabaseFlags::DUPSORT)
    }

    /// Position the sub-cursor for the key under the main cursor
    fn load_sub(&mut self, seek: SeekKey<'_>) -> Result<()> {
        self.sub = None;
        if !self.is_dupsort() {
            return Ok(());
        }
        let (leaf, idx) = *self.frames.last().ok_or(Error::Invalid("cursor not positioned"))?;
        let page = self.txn.get_page(PageId(leaf))?;
        if !page.node_flags(idx)?.contains(NodeFlags::SUBDATA) {
            return Ok(());
        }
        let db = Db::from_bytes(page.node_data(idx)?)?;
        if let Some((frames, _)) = btree::descend(self.txn, &db, self.txn.dcmp(self.dbi), seek)? {
            self.sub = Some(SubCursor { db, frames });
        }
        Ok(())
    }

    /// The entry under the cursor
    pub fn current(&self) -> Result<Option<Entry<'txn>>> {
        if !self.init || self.eof {
            return Ok(None);
        }
        let (leaf, idx) = *self.frames.last().ok_or(Error::Invalid("cursor not positioned"))?;
        let page = self.txn.get_page(PageId(leaf))?;
        if idx >= page.num_keys() {
            return Ok(None);
        }
        let key = Cow::Borrowed(page.node_key(idx)?);
        if let Some(sub) = &self.sub {
            let (sleaf, sidx) = *sub.frames.last().ok_or(Error::Invalid("empty sub-cursor"))?;
            let spage = self.txn.get_page(PageId(sleaf))?;
            return Ok(Some((key, Cow::Borrowed(spage.node_key(sidx)?))));
        }
        let value = if page.node_flags(idx)?.contains(NodeFlags::BIGDATA) {
            let head = page.node_overflow_pgno(idx)?;
            overflow::read_value(self.txn, head, page.node_data_size(idx)?)?
        } else {
            Cow::Borrowed(page.node_data(idx)?)
        };
        Ok(Some((key, value)))
    }

    /// Move to the first entry
    pub fn first(&mut self) -> Result<Option<Entry<'txn>>> {
        let db = self.db();
        let Some((frames, _)) =
            btree::descend(self.txn, &db, self.txn.cmp(self.dbi), SeekKey::Lowest)?
        else {
            self.init = false;
            return Ok(None);
        };
        self.frames = frames;
        self.init = true;
        self.eof = false;
        self.load_sub(SeekKey::Lowest)?;
        self.current()
    }

    /// Move to the last entry
    pub fn last(&mut self) -> Result<Option<Entry<'txn>>> {
        let db = self.db();
        let Some((frames, _)) =
            btree::descend(self.txn, &db, self.txn.cmp(self.dbi), SeekKey::Highest)?
        else {
            self.init = false;
            return Ok(None);
        };
        self.frames = frames;
        self.init = true;
        self.eof = false;
        self.load_sub(SeekKey::Highest)?;
        self.current()
    }

    /// Move to the next entry; on DUPSORT databases this walks duplicates
    /// before advancing to the next key
    pub fn next(&mut self) -> Result<Option<Entry<'txn>>> {
        if !self.init {
            return self.first();
        }
        if self.eof {
            return Ok(None);
        }
        if let Some(sub) = &mut self.sub {
            if step(self.txn, &mut sub.frames, true)? {
                return self.current();
            }
        }
        self.next_key(true)
    }

    /// Move to the next duplicate of the current key
    pub fn next_dup(&mut self) -> Result<Option<Entry<'txn>>> {
        if !self.is_dupsort() {
            return Err(Error::Invalid("next_dup on a non-DUPSORT database"));
        }
        if !self.init || self.eof {
            return Ok(None);
        }
        match &mut self.sub {
            Some(sub) => {
                if step(self.txn, &mut sub.frames, true)? {
                    self.current()
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Move to the first duplicate of the next key
    pub fn next_nodup(&mut self) -> Result<Option<Entry<'txn>>> {
        if !self.init {
            return self.first();
        }
        if self.eof {
            return Ok(None);
        }
        self.next_key(true)
    }

    fn next_key(&mut self, forward: bool) -> Result<Option<Entry<'txn>>> {
        if !step(self.txn, &mut self.frames, forward)? {
            self.eof = true;
            self.sub = None;
            return Ok(None);
        }
        self.load_sub(if forward { SeekKey::Lowest } else { SeekKey::Highest })?;
        self.current()
    }

    /// Move to the previous entry
    pub fn prev(&mut self) -> Result<Option<Entry<'txn>>> {
        if !self.init {
            return self.last();
        }
        if self.eof {
            // Stepping back from past-the-end lands on the last entry
            self.eof = false;
            return self.last();
        }
        if let Some(sub) = &mut self.sub {
            if step(self.txn, &mut sub.frames, false)? {
                return self.current();
            }
        }
        self.next_key(false)
    }

    /// Move to the previous duplicate of the current key
    pub fn prev_dup(&mut self) -> Result<Option<Entry<'txn>>> {
        if !self.is_dupsort() {
            return Err(Error::Invalid("prev_dup on a non-DUPSORT database"));
        }
        if !self.init || self.eof {
            return Ok(None);
        }
        match &mut self.sub {
            Some(sub) => {
                if step(self.txn, &mut sub.frames, false)? {
                    self.current()
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Move to the last duplicate of the previous key
    pub fn prev_nodup(&mut self) -> Result<Option<Entry<'txn>>> {
        if !self.init {
            return self.last();
        }
        if self.eof {
            self.eof = false;
            return self.last();
        }
        self.next_key(false)
    }

    /// Position at `key` exactly
    pub fn set(&mut self, key: &[u8]) -> Result<Option<Entry<'txn>>> {
        let db = self.db();
        let Some((frames, exact)) =
            btree::descend(self.txn, &db, self.txn.cmp(self.dbi), SeekKey::Key(key))?
        else {
            return Ok(None);
        };
        if !exact {
            return Ok(None);
        }
        self.frames = frames;
        self.init = true;
        self.eof = false;
        self.load_sub(SeekKey::Lowest)?;
        self.current()
    }

    /// Position at the first key greater than or equal to `key`
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<Entry<'txn>>> {
        let db = self.db();
        let Some((frames, _)) =
            btree::descend(self.txn, &db, self.txn.cmp(self.dbi), SeekKey::Key(key))?
        else {
            return Ok(None);
        };
        self.frames = frames;
        self.init = true;
        self.eof = false;
        let (leaf, idx) = *self.frames.last().ok_or(Error::Invalid("empty descent"))?;
        let n = self.txn.get_page(PageId(leaf))?.num_keys();
        if idx >= n {
            // Every key on this leaf compared below; the answer starts the
            // right sibling
            if !advance(self.txn, &mut self.frames, true)? {
                self.eof = true;
                return Ok(None);
            }
        }
        self.load_sub(SeekKey::Lowest)?;
        self.current()
    }

    /// Position at `key` with exactly the duplicate `data`
    pub fn get_both(&mut self, key: &[u8], data: &[u8]) -> Result<Option<Entry<'txn>>> {
        if !self.is_dupsort() {
            return Err(Error::Invalid("get_both on a non-DUPSORT database"));
        }
        if self.set(key)?.is_none() {
            return Ok(None);
        }
        let Some(sub) = &mut self.sub else {
            return Ok(None);
        };
        let Some((frames, exact)) =
            btree::descend(self.txn, &sub.db, self.txn.dcmp(self.dbi), SeekKey::Key(data))?
        else {
            return Ok(None);
        };
        if !exact {
            return Ok(None);
        }
        sub.frames = frames;
        self.current()
    }

    /// Position at `key` with the first duplicate >= `data`
    pub fn get_both_range(&mut self, key: &[u8], data: &[u8]) -> Result<Option<Entry<'txn>>> {
        if !self.is_dupsort() {
            return Err(Error::Invalid("get_both_range on a non-DUPSORT database"));
        }
        if self.set(key)?.is_none() {
            return Ok(None);
        }
        let Some(sub) = &mut self.sub else {
            return Ok(None);
        };
        let Some((mut frames, _)) =
            btree::descend(self.txn, &sub.db, self.txn.dcmp(self.dbi), SeekKey::Key(data))?
        else {
            return Ok(None);
        };
        let (sleaf, sidx) = *frames.last().ok_or(Error::Invalid("empty descent"))?;
        let n = self.txn.get_page(PageId(sleaf))?.num_keys();
        if sidx >= n && !advance(self.txn, &mut frames, true)? {
            return Ok(None);
        }
        sub.frames = frames;
        self.current()
    }
}
