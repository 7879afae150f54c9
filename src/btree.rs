//! Copy-on-write B+tree engine
//!
//! Operations work on descriptor snapshots held by the transaction. A
//! modifying descent touches every page on its path, so the tree below the
//! authoritative meta is never mutated in place; readers keep whatever root
//! their snapshot pinned. Frames collected on the way down give split and
//! rebalance their parent chain.

use tracing::trace;

use crate::comparator::CmpFn;
use crate::db::{DatabaseFlags, WriteFlags};
use crate::dupsort;
use crate::error::{Error, PageId, Result};
use crate::meta::{Db, FREE_DBI};
use crate::overflow;
use crate::page::{
    NodeFlags, NodePayload, Page, PageFlags, MAX_KEY_SIZE, MIN_KEYS, P_INVALID,
};
use crate::txn::{mode::Mode, Transaction, Write};

/// How a descent picks its way down the tree
#[derive(Clone, Copy)]
pub(crate) enum SeekKey<'a> {
    /// Leftmost leaf, index 0
    Lowest,
    /// Rightmost leaf, last index
    Highest,
    /// The leaf that covers `key`
    Key(&'a [u8]),
}

/// Comparators and flags a tree operation needs, independent of whether the
/// tree is a numbered database or a duplicate sub-tree
pub(crate) struct TreeRef {
    pub(crate) cmp: CmpFn,
    pub(crate) dcmp: CmpFn,
    pub(crate) dupsort: bool,
}

pub(crate) fn tree_ref<M: Mode>(txn: &Transaction<'_, M>, dbi: usize) -> TreeRef {
    TreeRef {
        cmp: txn.cmp(dbi),
        dcmp: txn.dcmp(dbi),
        dupsort: dbi != FREE_DBI && txn.db_flags(dbi).contains(DatabaseFlags::DUPSORT),
    }
}

/// Path from the root to one node: `(pgno, index)` per level
pub(crate) type Frames = Vec<(u64, usize)>;

fn leaf_index(page: &Page, seek: SeekKey<'_>, cmp: CmpFn) -> Result<(usize, bool)> {
    match seek {
        SeekKey::Lowest => Ok((0, false)),
        SeekKey::Highest => Ok((page.num_keys().saturating_sub(1), false)),
        SeekKey::Key(key) => page.search_node(key, cmp),
    }
}

fn branch_index(page: &Page, seek: SeekKey<'_>, cmp: CmpFn) -> Result<usize> {
    match seek {
        SeekKey::Lowest => Ok(0),
        SeekKey::Highest => Ok(page.num_keys() - 1),
        SeekKey::Key(key) => {
            let (idx, exact) = page.search_node(key, cmp)?;
            // Branch keys are separators: an inexact hit belongs to the
            // child before it, and past-the-end means the rightmost child.
            if exact {
                Ok(idx)
            } else {
                Ok(idx - 1)
            }
        }
    }
}

/// Read-only descent; returns the frame path and whether a `Key` seek was
/// exact. `None` means the tree is empty.
pub(crate) fn descend<M: Mode>(
    txn: &Transaction<'_, M>,
    db: &Db,
    cmp: CmpFn,
    seek: SeekKey<'_>,
) -> Result<Option<(Frames, bool)>> {
    if db.root == P_INVALID {
        return Ok(None);
    }
    let mut frames = Frames::new();
    let mut pgno = db.root;
    loop {
        let page = txn.get_page(PageId(pgno))?;
        if page.is_leaf() {
            let (idx, exact) = leaf_index(page, seek, cmp)?;
            frames.push((pgno, idx));
            return Ok(Some((frames, exact)));
        }
        let idx = branch_index(page, seek, cmp)?;
        let child = page.node_child(idx)?;
        frames.push((pgno, idx));
        pgno = child.0;
    }
}

/// Modifying descent: copy-on-write every page on the path, patching parent
/// child pointers and the descriptor root as pages move.
pub(crate) fn descend_modify(
    txn: &mut Transaction<'_, Write>,
    db: &mut Db,
    cmp: CmpFn,
    seek: SeekKey<'_>,
) -> Result<Option<(Frames, bool)>> {
    if db.root == P_INVALID {
        return Ok(None);
    }
    let mut frames = Frames::new();
    let mut pgno = db.root;
    let mut parent: Option<(PageId, usize)> = None;
    loop {
        pgno = txn.touch(PageId(pgno), parent)?.0;
        if parent.is_none() {
            db.root = pgno;
        }
        let (is_leaf, idx, exact, child) = {
            let page = txn.get_page(PageId(pgno))?;
            if page.is_leaf() {
                let (idx, exact) = leaf_index(page, seek, cmp)?;
                (true, idx, exact, 0)
            } else {
                let idx = branch_index(page, seek, cmp)?;
                (false, idx, false, page.node_child(idx)?.0)
            }
        };
        frames.push((pgno, idx));
        if is_leaf {
            return Ok(Some((frames, exact)));
        }
        parent = Some((PageId(pgno), idx));
        pgno = child;
    }
}

/// Owned copy of one node, used when nodes move between pages
enum OwnedPayload {
    Data(Vec<u8>),
    Overflow(u64, usize),
    Child(u64),
}

impl OwnedPayload {
    fn borrow(&self) -> NodePayload<'_> {
        match self {
            OwnedPayload::Data(d) => NodePayload::Data(d),
            OwnedPayload::Overflow(pgno, size) => NodePayload::Overflow(*pgno, *size),
            OwnedPayload::Child(pgno) => NodePayload::Child(*pgno),
        }
    }
}

fn copy_node(page: &Page, idx: usize, branch_key0: Option<&[u8]>) -> Result<(Vec<u8>, OwnedPayload, NodeFlags)> {
    let flags = page.node_flags(idx)?;
    let key = if page.is_branch() && idx == 0 {
        branch_key0.unwrap_or(&[]).to_vec()
    } else {
        page.node_key(idx)?.to_vec()
    };
    let payload = if page.is_branch() {
        OwnedPayload::Child(page.node_child(idx)?.0)
    } else if flags.contains(NodeFlags::BIGDATA) {
        OwnedPayload::Overflow(page.node_overflow_pgno(idx)?.0, page.node_data_size(idx)?)
    } else {
        OwnedPayload::Data(page.node_data(idx)?.to_vec())
    };
    Ok((key, payload, flags))
}

/// Insert a node at `frames[level]`, splitting when the page is full.
/// Returns the final location of the new entry.
fn insert_node(
    txn: &mut Transaction<'_, Write>,
    db: &mut Db,
    frames: &mut Frames,
    level: usize,
    indx: usize,
    key: &[u8],
    payload: &NodePayload<'_>,
    nflags: NodeFlags,
) -> Result<(u64, usize)> {
    let pgno = frames[level].0;
    match txn.dirty_page_mut(PageId(pgno))?.add_node(indx, key, payload, nflags) {
        Ok(()) => {
            frames[level] = (pgno, indx);
            Ok((pgno, indx))
        }
        Err(Error::NoSpace) => split(txn, db, frames, level, indx, key, payload, nflags),
        Err(e) => Err(e),
    }
}

/// Split `frames[level]`, distributing its nodes and the new entry across
/// the page and a fresh right sibling
fn split(
    txn: &mut Transaction<'_, Write>,
    db: &mut Db,
    frames: &mut Frames,
    level: usize,
    newindx: usize,
    newkey: &[u8],
    payload: &NodePayload<'_>,
    nflags: NodeFlags,
) -> Result<(u64, usize)> {
    let mpgno = frames[level].0;
    let is_leaf = txn.get_page(PageId(mpgno))?.is_leaf();

    // A root split grows the tree: fresh branch root with a single
    // zero-key pointer back at us.
    if level == 0 {
        let rootpg = txn.alloc_page(PageFlags::BRANCH, 1)?;
        txn.dirty_page_mut(rootpg)?.add_node(
            0,
            b"",
            &NodePayload::Child(mpgno),
            NodeFlags::empty(),
        )?;
        db.root = rootpg.0;
        db.depth += 1;
        db.branch_pages += 1;
        frames.insert(0, (rootpg.0, 0));
    }
    let level = frames.iter().position(|f| f.0 == mpgno).ok_or(Error::Invalid("lost split page"))?;

    let rp = txn.alloc_page(if is_leaf { PageFlags::LEAF } else { PageFlags::BRANCH }, 1)?;
    if is_leaf {
        db.leaf_pages += 1;
    } else {
        db.branch_pages += 1;
    }

    let scratch = txn.get_page(PageId(mpgno))?.to_owned_box();
    txn.dirty_page_mut(PageId(mpgno))?.clear_nodes();

    let n = scratch.num_keys();
    let split_indx = n / 2 + 1;
    let sep: Vec<u8> = if newindx == split_indx {
        newkey.to_vec()
    } else {
        scratch.node_key(split_indx)?.to_vec()
    };
    trace!(page = mpgno, sibling = rp.0, split_indx, "page split");

    // Step the separator into the parent first; the parent may split in
    // turn, possibly moving us under a new parent.
    let old_parent_pg = frames[level - 1].0;
    let parent_indx = frames[level - 1].1 + 1;
    let (sep_pg, sep_idx) = insert_node(
        txn,
        db,
        frames,
        level - 1,
        parent_indx,
        &sep,
        &NodePayload::Child(rp.0),
        NodeFlags::empty(),
    )?;
    let level = frames.iter().position(|f| f.0 == mpgno).ok_or(Error::Invalid("lost split page"))?;
    let m_parent = if sep_idx > 0 {
        (sep_pg, sep_idx - 1)
    } else {
        // The parent split right between us and the new sibling; our
        // pointer is the last node of the left half.
        let nk = txn.get_page(PageId(old_parent_pg))?.num_keys();
        (old_parent_pg, nk - 1)
    };

    // Redistribute: scratch nodes below the split point refill this page,
    // the rest go to the sibling, with the new entry spliced in at its
    // ordered position.
    let mut landed = (mpgno, newindx);
    let mut mi = 0usize;
    let mut ri = 0usize;
    for pos in 0..=n {
        let is_new = pos == newindx;
        let to_left = if is_new {
            newindx < split_indx
        } else {
            let si = if pos < newindx { pos } else { pos - 1 };
            si < split_indx
        };
        let (tpg, tidx) = if to_left {
            let i = mi;
            mi += 1;
            (mpgno, i)
        } else {
            let i = ri;
            ri += 1;
            (rp.0, i)
        };
        if is_new {
            let key = if !is_leaf && tidx == 0 { &[][..] } else { newkey };
            txn.dirty_page_mut(PageId(tpg))?.add_node(tidx, key, payload, nflags)?;
            landed = (tpg, tidx);
        } else {
            let si = if pos < newindx { pos } else { pos - 1 };
            if si >= n {
                continue;
            }
            let (key, pl, nf) = copy_node(&scratch, si, None)?;
            let key = if !is_leaf && tidx == 0 { &[][..] } else { key.as_slice() };
            txn.dirty_page_mut(PageId(tpg))?.add_node(tidx, key, &pl.borrow(), nf)?;
        }
    }

    frames[level - 1] = if landed.0 == mpgno { m_parent } else { (sep_pg, sep_idx) };
    frames[level] = landed;
    Ok(landed)
}

/// Insert a fresh entry, spilling large values to an overflow chain
pub(crate) fn insert_record(
    txn: &mut Transaction<'_, Write>,
    db: &mut Db,
    frames: &mut Frames,
    indx: usize,
    key: &[u8],
    data: &[u8],
    nflags: NodeFlags,
) -> Result<(u64, usize)> {
    let level = frames.len() - 1;
    if !nflags.contains(NodeFlags::SUBDATA) && data.len() >= crate::page::MAX_INLINE_DATA {
        let (head, npages) = overflow::write_value(txn, data)?;
        db.overflow_pages += npages;
        insert_node(
            txn,
            db,
            frames,
            level,
            indx,
            key,
            &NodePayload::Overflow(head.0, data.len()),
            nflags | NodeFlags::BIGDATA,
        )
    } else {
        insert_node(txn, db, frames, level, indx, key, &NodePayload::Data(data), nflags)
    }
}

/// Core insert over a descriptor
pub(crate) fn put_core(
    txn: &mut Transaction<'_, Write>,
    db: &mut Db,
    tr: &TreeRef,
    key: &[u8],
    data: &[u8],
    wflags: WriteFlags,
    extra_nflags: NodeFlags,
) -> Result<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::Invalid("key too large"));
    }
    if tr.dupsort && data.len() > MAX_KEY_SIZE {
        return Err(Error::Invalid("duplicate value too large"));
    }

    let Some((mut frames, exact)) = descend_modify(txn, db, tr.cmp, SeekKey::Key(key))? else {
        // Empty tree: bootstrap a root leaf
        let leaf = txn.alloc_page(PageFlags::LEAF, 1)?;
        db.root = leaf.0;
        db.depth = 1;
        db.leaf_pages += 1;
        let mut frames = vec![(leaf.0, 0usize)];
        if tr.dupsort {
            return dupsort::put_new_key(txn, db, tr, &mut frames, 0, key, data);
        }
        insert_record(txn, db, &mut frames, 0, key, data, extra_nflags)?;
        db.entries += 1;
        return Ok(());
    };

    let (leaf, idx) = *frames.last().ok_or(Error::Invalid("empty descent"))?;
    if exact {
        if tr.dupsort {
            return dupsort::put_dup(txn, db, tr, PageId(leaf), idx, data, wflags);
        }
        if wflags.contains(WriteFlags::NOOVERWRITE) {
            return Err(Error::KeyExist);
        }
        let (nf, old_size) = {
            let page = txn.get_page(PageId(leaf))?;
            (page.node_flags(idx)?, page.node_data_size(idx)?)
        };
        if nf.contains(NodeFlags::SUBDATA) && !extra_nflags.contains(NodeFlags::SUBDATA) {
            return Err(Error::Invalid("value is a sub-database record"));
        }
        if !nf.contains(NodeFlags::BIGDATA) && old_size == data.len() {
            // Equal-size overwrite runs in place and allocates nothing
            txn.dirty_page_mut(PageId(leaf))?.set_node_data(idx, data)?;
            return Ok(());
        }
        if nf.contains(NodeFlags::BIGDATA) {
            let head = txn.get_page(PageId(leaf))?.node_overflow_pgno(idx)?;
            let count = overflow::free_chain(txn, head)?;
            db.overflow_pages -= count;
        }
        txn.dirty_page_mut(PageId(leaf))?.del_node(idx)?;
        insert_record(txn, db, &mut frames, idx, key, data, extra_nflags)?;
        return Ok(());
    }

    if tr.dupsort {
        return dupsort::put_new_key(txn, db, tr, &mut frames, idx, key, data);
    }
    insert_record(txn, db, &mut frames, idx, key, data, extra_nflags)?;
    db.entries += 1;
    Ok(())
}

/// Core delete over a descriptor; `data` selects one duplicate
pub(crate) fn del_core(
    txn: &mut Transaction<'_, Write>,
    db: &mut Db,
    tr: &TreeRef,
    key: &[u8],
    data: Option<&[u8]>,
) -> Result<()> {
    let Some((mut frames, exact)) = descend_modify(txn, db, tr.cmp, SeekKey::Key(key))? else {
        return Err(Error::NotFound);
    };
    if !exact {
        return Err(Error::NotFound);
    }
    let level = frames.len() - 1;
    let (leaf, idx) = frames[level];
    let nf = txn.get_page(PageId(leaf))?.node_flags(idx)?;

    if tr.dupsort && nf.contains(NodeFlags::SUBDATA) {
        let rec = txn.get_page(PageId(leaf))?.node_data(idx)?.to_vec();
        let mut sub = Db::from_bytes(&rec)?;
        if let Some(d) = data {
            let sub_tr = TreeRef { cmp: tr.dcmp, dcmp: tr.dcmp, dupsort: false };
            del_core(txn, &mut sub, &sub_tr, d, None)?;
            db.entries -= 1;
            if sub.entries > 0 {
                txn.dirty_page_mut(PageId(leaf))?.set_node_data(idx, &sub.to_bytes())?;
                return Ok(());
            }
            // Last duplicate gone; drop the key itself
        } else {
            db.entries -= sub.entries;
            dupsort::free_subtree(txn, &sub)?;
        }
    } else {
        if nf.contains(NodeFlags::BIGDATA) {
            let head = txn.get_page(PageId(leaf))?.node_overflow_pgno(idx)?;
            let count = overflow::free_chain(txn, head)?;
            db.overflow_pages -= count;
        }
        db.entries -= 1;
    }

    txn.dirty_page_mut(PageId(leaf))?.del_node(idx)?;
    rebalance(txn, db, &mut frames, level)
}

/// Restore fill invariants after a delete: collapse shrinking roots, then
/// borrow from or merge with a sibling
fn rebalance(
    txn: &mut Transaction<'_, Write>,
    db: &mut Db,
    frames: &mut Frames,
    level: usize,
) -> Result<()> {
    let pgno = frames[level].0;
    let (nkeys, underfull, is_leaf) = {
        let page = txn.get_page(PageId(pgno))?;
        (page.num_keys(), page.is_underfull(), page.is_leaf())
    };
    if !underfull && nkeys >= MIN_KEYS {
        return Ok(());
    }

    if level == 0 {
        if is_leaf && nkeys == 0 {
            trace!(root = pgno, "tree emptied");
            db.root = P_INVALID;
            db.depth -= 1;
            db.leaf_pages -= 1;
            txn.discard_dirty(PageId(pgno));
        } else if !is_leaf && nkeys == 1 {
            // A one-child root collapses into its child; this keeps every
            // surviving branch page at two or more children.
            let child = txn.get_page(PageId(pgno))?.node_child(0)?;
            trace!(root = pgno, child = child.0, "root collapse");
            db.root = child.0;
            db.depth -= 1;
            db.branch_pages -= 1;
            txn.discard_dirty(PageId(pgno));
        }
        return Ok(());
    }

    let (ppgno, pidx) = frames[level - 1];
    let (neighbor_idx, neighbor_is_right) =
        if pidx == 0 { (1, true) } else { (pidx - 1, false) };
    let npgno = txn.get_page(PageId(ppgno))?.node_child(neighbor_idx)?;
    let npgno = txn.touch(npgno, Some((PageId(ppgno), neighbor_idx)))?;
    let (n_nkeys, n_underfull) = {
        let page = txn.get_page(npgno)?;
        (page.num_keys(), page.is_underfull())
    };

    if !n_underfull && n_nkeys >= MIN_KEYS {
        move_node(txn, PageId(ppgno), pidx, PageId(pgno), npgno, neighbor_is_right, is_leaf)
    } else {
        if neighbor_is_right {
            merge(txn, db, npgno, neighbor_idx, PageId(pgno), PageId(ppgno), is_leaf)?;
        } else {
            merge(txn, db, PageId(pgno), pidx, npgno, PageId(ppgno), is_leaf)?;
        }
        rebalance(txn, db, frames, level - 1)
    }
}

/// Move one node from the edge of `neighbor` into `page`, fixing the parent
/// separators on whichever side changed its leftmost key
fn move_node(
    txn: &mut Transaction<'_, Write>,
    parent: PageId,
    pidx: usize,
    page: PageId,
    neighbor: PageId,
    neighbor_is_right: bool,
    is_leaf: bool,
) -> Result<()> {
    if neighbor_is_right {
        // Borrow the neighbor's first node and append it here
        let sep_idx = pidx + 1;
        let eff_key = if is_leaf {
            None
        } else {
            Some(txn.get_page(parent)?.node_key(sep_idx)?.to_vec())
        };
        let (key, payload, nf) =
            copy_node(txn.get_page(neighbor)?, 0, eff_key.as_deref())?;
        let dst = txn.get_page(page)?.num_keys();
        txn.dirty_page_mut(page)?.add_node(dst, &key, &payload.borrow(), nf)?;
        txn.dirty_page_mut(neighbor)?.del_node(0)?;
        let new_sep = if is_leaf {
            txn.get_page(neighbor)?.node_key(0)?.to_vec()
        } else {
            let k = txn.get_page(neighbor)?.node_key(0)?.to_vec();
            txn.dirty_page_mut(neighbor)?.update_key(0, b"")?;
            k
        };
        txn.dirty_page_mut(parent)?.update_key(sep_idx, &new_sep)?;
    } else {
        // Borrow the neighbor's last node and prepend it here
        let si = txn.get_page(neighbor)?.num_keys() - 1;
        let (key, payload, nf) = copy_node(txn.get_page(neighbor)?, si, None)?;
        txn.dirty_page_mut(neighbor)?.del_node(si)?;
        if is_leaf {
            txn.dirty_page_mut(page)?.add_node(0, &key, &payload.borrow(), nf)?;
        } else {
            // The old leftmost child regains its real key (the current
            // separator) before the new child takes the zero-key slot.
            let old_sep = txn.get_page(parent)?.node_key(pidx)?.to_vec();
            txn.dirty_page_mut(page)?.update_key(0, &old_sep)?;
            txn.dirty_page_mut(page)?.add_node(0, b"", &payload.borrow(), nf)?;
        }
        txn.dirty_page_mut(parent)?.update_key(pidx, &key)?;
    }
    Ok(())
}

/// Fold `src` (the right page) into `dst` (the left page) and unlink it
fn merge(
    txn: &mut Transaction<'_, Write>,
    db: &mut Db,
    src: PageId,
    src_parent_idx: usize,
    dst: PageId,
    parent: PageId,
    is_leaf: bool,
) -> Result<()> {
    trace!(src = src.0, dst = dst.0, "merging pages");
    let eff_key = if is_leaf {
        None
    } else {
        Some(txn.get_page(parent)?.node_key(src_parent_idx)?.to_vec())
    };
    let snapshot = txn.get_page(src)?.to_owned_box();
    let base = txn.get_page(dst)?.num_keys();
    for i in 0..snapshot.num_keys() {
        let (key, payload, nf) = copy_node(&snapshot, i, eff_key.as_deref())?;
        txn.dirty_page_mut(dst)?.add_node(base + i, &key, &payload.borrow(), nf)?;
    }
    txn.dirty_page_mut(parent)?.del_node(src_parent_idx)?;
    if src_parent_idx == 0 {
        // Keep the leftmost branch key zero-length
        txn.dirty_page_mut(parent)?.update_key(0, b"")?;
    }
    txn.discard_dirty(src);
    if is_leaf {
        db.leaf_pages -= 1;
    } else {
        db.branch_pages -= 1;
    }
    Ok(())
}

// ---- dbi-level wrappers ----

/// Insert `key -> data` into database `dbi`
pub(crate) fn put(
    txn: &mut Transaction<'_, Write>,
    dbi: usize,
    key: &[u8],
    data: &[u8],
    wflags: WriteFlags,
    extra_nflags: NodeFlags,
) -> Result<()> {
    txn.mark_db_dirty(dbi)?;
    let tr = tree_ref(txn, dbi);
    let mut db = txn.dbs[dbi];
    let r = put_core(txn, &mut db, &tr, key, data, wflags, extra_nflags);
    txn.dbs[dbi] = db;
    r
}

/// Delete `key` (or one duplicate of it) from database `dbi`
pub(crate) fn del(
    txn: &mut Transaction<'_, Write>,
    dbi: usize,
    key: &[u8],
    data: Option<&[u8]>,
) -> Result<()> {
    txn.mark_db_dirty(dbi)?;
    let tr = tree_ref(txn, dbi);
    let mut db = txn.dbs[dbi];
    let r = del_core(txn, &mut db, &tr, key, data);
    txn.dbs[dbi] = db;
    r
}

/// Look up `key`; returns the raw node value (overflow chains resolved,
/// sub-tree records returned as record bytes)
pub(crate) fn get<M: Mode>(
    txn: &Transaction<'_, M>,
    dbi: usize,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let db = txn.dbs[dbi];
    let cmp = txn.cmp(dbi);
    let Some((frames, exact)) = descend(txn, &db, cmp, SeekKey::Key(key))? else {
        return Ok(None);
    };
    if !exact {
        return Ok(None);
    }
    let (leaf, idx) = frames[frames.len() - 1];
    let page = txn.get_page(PageId(leaf))?;
    if page.node_flags(idx)?.contains(NodeFlags::BIGDATA) {
        let head = page.node_overflow_pgno(idx)?;
        let size = page.node_data_size(idx)?;
        return Ok(Some(overflow::read_value(txn, head, size)?.into_owned()));
    }
    Ok(Some(page.node_data(idx)?.to_vec()))
}

/// First entry of database `dbi` in key order
pub(crate) fn tree_min<M: Mode>(
    txn: &Transaction<'_, M>,
    dbi: usize,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let db = txn.dbs[dbi];
    let Some((frames, _)) = descend(txn, &db, txn.cmp(dbi), SeekKey::Lowest)? else {
        return Ok(None);
    };
    let (leaf, idx) = frames[frames.len() - 1];
    let page = txn.get_page(PageId(leaf))?;
    if page.num_keys() == 0 {
        return Ok(None);
    }
    let key = page.node_key(idx)?.to_vec();
    let value = if page.node_flags(idx)?.contains(NodeFlags::BIGDATA) {
        let head = page.node_overflow_pgno(idx)?;
        let size = page.node_data_size(idx)?;
        overflow::read_value(txn, head, size)?.into_owned()
    } else {
        page.node_data(idx)?.to_vec()
    };
    Ok(Some((key, value)))
}

/// Copy-on-write the path to `key` without changing anything else; used to
/// pin a named database's main-DB record before its first modification
pub(crate) fn cow_path(txn: &mut Transaction<'_, Write>, dbi: usize, key: &[u8]) -> Result<()> {
    txn.mark_db_dirty(dbi)?;
    let cmp = txn.cmp(dbi);
    let mut db = txn.dbs[dbi];
    let r = descend_modify(txn, &mut db, cmp, SeekKey::Key(key)).map(|_| ());
    txn.dbs[dbi] = db;
    r
}

/// Copy-on-write the rightmost path of database `dbi`
pub(crate) fn cow_rightmost(txn: &mut Transaction<'_, Write>, dbi: usize) -> Result<()> {
    txn.mark_db_dirty(dbi)?;
    let cmp = txn.cmp(dbi);
    let mut db = txn.dbs[dbi];
    let r = descend_modify(txn, &mut db, cmp, SeekKey::Highest).map(|_| ());
    txn.dbs[dbi] = db;
    r
}
