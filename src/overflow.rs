//! Overflow chains for large values
//!
//! A value at or above a quarter page moves to a contiguous run of overflow
//! pages; the leaf node keeps only the head page number. The value bytes
//! start right after the head's page header and run contiguously across the
//! rest of the chain, so a committed value reads back as one slice of the
//! map.

use std::borrow::Cow;

use crate::error::{Error, PageId, Result};
use crate::page::{PageFlags, PageHeader, PAGE_SIZE};
use crate::txn::{mode::Mode, Transaction, Write};

/// Number of pages a value of `len` bytes needs, header included
pub(crate) fn chain_pages(len: usize) -> u64 {
    ((PAGE_SIZE + len) as u64).div_ceil(PAGE_SIZE as u64)
}

/// Allocate a chain and fill it with `data`; returns the head page and the
/// number of pages used
pub(crate) fn write_value(
    txn: &mut Transaction<'_, Write>,
    data: &[u8],
) -> Result<(PageId, u64)> {
    let npages = chain_pages(data.len());
    let head = txn.alloc_page(PageFlags::OVERFLOW, npages)?;
    let entry = txn.dirty_entry_mut(head)?;
    let head_cap = PAGE_SIZE - PageHeader::SIZE;
    let first = data.len().min(head_cap);
    entry.page.data[..first].copy_from_slice(&data[..first]);
    if data.len() > first {
        entry.tail[..data.len() - first].copy_from_slice(&data[first..]);
    }
    Ok((head, npages))
}

/// Read a value of `size` bytes out of the chain headed at `head`
pub(crate) fn read_value<'txn, M: Mode>(
    txn: &'txn Transaction<'_, M>,
    head: PageId,
    size: usize,
) -> Result<Cow<'txn, [u8]>> {
    if let Some(entry) = txn.dirty_entry(head) {
        // Uncommitted chain: stitch head and tail back together
        let head_cap = PAGE_SIZE - PageHeader::SIZE;
        if size <= head_cap {
            return Ok(Cow::Borrowed(&entry.page.data[..size]));
        }
        let mut value = Vec::with_capacity(size);
        value.extend_from_slice(&entry.page.data);
        value.extend_from_slice(&entry.tail[..size - head_cap]);
        return Ok(Cow::Owned(value));
    }
    let env = txn.env.inner();
    let offset = head.0 as usize * PAGE_SIZE + PageHeader::SIZE;
    Ok(Cow::Borrowed(env.map_slice(offset, size)?))
}

/// Free every page of the chain headed at `head`; returns the page count
pub(crate) fn free_chain(txn: &mut Transaction<'_, Write>, head: PageId) -> Result<u64> {
    let page = txn.get_page(head)?;
    if !page.is_overflow() {
        return Err(Error::Corruption {
            details: format!("page {} is not an overflow head", head.0),
            page_id: Some(head),
        });
    }
    let count = page.overflow_count() as u64;
    if txn.is_dirty(head) {
        txn.remove_dirty(head);
    }
    for pg in head.0..head.0 + count {
        txn.free_page(PageId(pg));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_chain_pages() {
        assert_eq!(chain_pages(0), 1);
        assert_eq!(chain_pages(PAGE_SIZE - PageHeader::SIZE), 1);
        assert_eq!(chain_pages(PAGE_SIZE), 2);
        assert_eq!(chain_pages(3 * PAGE_SIZE), 4);
    }

    #[test]
    fn test_write_read_free_uncommitted() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();
        let mut txn = env.begin_write().unwrap();

        let data: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        let (head, npages) = write_value(&mut txn, &data).unwrap();
        assert_eq!(npages, 4);

        let back = read_value(&txn, head, data.len()).unwrap();
        assert_eq!(back.as_ref(), &data[..]);

        let freed = free_chain(&mut txn, head).unwrap();
        assert_eq!(freed, 4);
        assert!(!txn.is_dirty(head));
    }
}
