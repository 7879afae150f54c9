//! Duplicate-sorted values (DUPSORT)
//!
//! A DUPSORT database stores each key's duplicates as the keys of a nested
//! B+tree whose descriptor is embedded in the parent leaf node (SUBDATA).
//! Nested writes run against the parent transaction's dirty queue and
//! allocator directly; after each mutation the updated descriptor is
//! mirrored back into the parent leaf. The descriptor record never changes
//! size, so the write-back is always an in-place overwrite.

use crate::btree::{self, Frames, TreeRef};
use crate::db::WriteFlags;
use crate::error::{Error, PageId, Result};
use crate::meta::Db;
use crate::page::NodeFlags;
use crate::txn::{Transaction, Write};

fn sub_tree_ref(tr: &TreeRef) -> TreeRef {
    TreeRef { cmp: tr.dcmp, dcmp: tr.dcmp, dupsort: false }
}

/// First insert of a key: store an empty sub-tree descriptor under the key,
/// then insert the value as the sub-tree's first key
pub(crate) fn put_new_key(
    txn: &mut Transaction<'_, Write>,
    db: &mut Db,
    tr: &TreeRef,
    frames: &mut Frames,
    indx: usize,
    key: &[u8],
    data: &[u8],
) -> Result<()> {
    let mut sub = Db::default();
    let record = sub.to_bytes();
    let (leaf, idx) =
        btree::insert_record(txn, db, frames, indx, key, &record, NodeFlags::SUBDATA)?;

    let sub_tr = sub_tree_ref(tr);
    btree::put_core(txn, &mut sub, &sub_tr, data, b"", WriteFlags::empty(), NodeFlags::empty())?;
    txn.dirty_page_mut(PageId(leaf))?.set_node_data(idx, &sub.to_bytes())?;
    db.entries += 1;
    Ok(())
}

/// Additional duplicate for an existing key
pub(crate) fn put_dup(
    txn: &mut Transaction<'_, Write>,
    db: &mut Db,
    tr: &TreeRef,
    leaf: PageId,
    idx: usize,
    data: &[u8],
    wflags: WriteFlags,
) -> Result<()> {
    let page = txn.get_page(leaf)?;
    if !page.node_flags(idx)?.contains(NodeFlags::SUBDATA) {
        return Err(Error::Corruption {
            details: "DUPSORT leaf value is not a sub-tree record".into(),
            page_id: Some(leaf),
        });
    }
    let mut sub = Db::from_bytes(page.node_data(idx)?)?;

    let sub_tr = sub_tree_ref(tr);
    match btree::put_core(
        txn,
        &mut sub,
        &sub_tr,
        data,
        b"",
        WriteFlags::NOOVERWRITE,
        NodeFlags::empty(),
    ) {
        Ok(()) => {
            txn.dirty_page_mut(leaf)?.set_node_data(idx, &sub.to_bytes())?;
            db.entries += 1;
            Ok(())
        }
        Err(Error::KeyExist) => {
            if wflags.contains(WriteFlags::NODUPDATA) {
                Err(Error::KeyExist)
            } else {
                // The duplicate is already there; nothing to write
                Ok(())
            }
        }
        Err(e) => Err(e),
    }
}

/// Append every page of a sub-tree to the transaction's freed set,
/// root included
pub(crate) fn free_subtree(txn: &mut Transaction<'_, Write>, sub: &Db) -> Result<()> {
    if sub.root == crate::page::P_INVALID {
        return Ok(());
    }
    let mut stack = vec![sub.root];
    while let Some(pgno) = stack.pop() {
        let children: Vec<u64> = {
            let page = txn.get_page(PageId(pgno))?;
            if page.is_branch() {
                (0..page.num_keys())
                    .map(|i| page.node_child(i).map(|p| p.0))
                    .collect::<Result<_>>()?
            } else {
                Vec::new()
            }
        };
        stack.extend(children);
        if txn.is_dirty(PageId(pgno)) {
            txn.discard_dirty(PageId(pgno));
        } else {
            txn.free_page(PageId(pgno));
        }
    }
    Ok(())
}
