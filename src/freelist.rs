//! Free-DB records and page reclamation
//!
//! The free database (`dbs[0]`) maps each freeing transaction id to the IDL
//! of page numbers that transaction released. A writer pulls the oldest
//! record into its in-memory reclaim list once no live reader can still see
//! those pages, and serializes its own freed set as one record at commit.

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use crate::btree;
use crate::db::WriteFlags;
use crate::error::{Result, TransactionId};
use crate::idl::Idl;
use crate::meta::FREE_DBI;
use crate::page::NodeFlags;
use crate::txn::{Transaction, Write};

fn encode_key(txnid: TransactionId) -> [u8; 8] {
    let mut key = [0u8; 8];
    LittleEndian::write_u64(&mut key, txnid.0);
    key
}

/// Read the oldest entry of the free DB without removing it
pub(crate) fn read_oldest(
    txn: &Transaction<'_, Write>,
) -> Result<Option<(TransactionId, Idl)>> {
    let Some((key, value)) = btree::tree_min(txn, FREE_DBI)? else {
        return Ok(None);
    };
    if key.len() != 8 {
        return Err(crate::error::Error::Corruption {
            details: format!("free-DB key of length {}", key.len()),
            page_id: None,
        });
    }
    let txnid = TransactionId(LittleEndian::read_u64(&key));
    let ids = Idl::from_bytes(&value)?;
    Ok(Some((txnid, ids)))
}

/// Remove the entry keyed by `txnid` from the free DB
pub(crate) fn delete_record(txn: &mut Transaction<'_, Write>, txnid: TransactionId) -> Result<()> {
    trace!(freed_by = txnid.0, "consuming free-DB entry");
    btree::del(txn, FREE_DBI, &encode_key(txnid), None)
}

/// Write one `txnid -> IDL` record into the free DB
pub(crate) fn save_record(
    txn: &mut Transaction<'_, Write>,
    txnid: TransactionId,
    ids: &Idl,
) -> Result<()> {
    trace!(freed_by = txnid.0, pages = ids.len(), "writing free-DB record");
    btree::put(
        txn,
        FREE_DBI,
        &encode_key(txnid),
        &ids.to_bytes(),
        WriteFlags::empty(),
        NodeFlags::empty(),
    )
}

/// Copy-on-write the rightmost free-DB path so the freed set serialized
/// right after already accounts for the pages these touches free
pub(crate) fn touch_tail(txn: &mut Transaction<'_, Write>) -> Result<()> {
    btree::cow_rightmost(txn, FREE_DBI)
}
