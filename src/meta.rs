//! Meta pages and database descriptors
//!
//! Pages 0 and 1 each hold a meta record after the page header. The record
//! with the larger transaction id is authoritative; the other is the crash
//! fallback. Commits alternate between the two and rewrite only the mutable
//! tail of the record, so a torn meta write leaves the previous meta intact.

use crate::error::{Error, PageId, Result, TransactionId};
use crate::page::{Page, PageFlags, PageHeader, P_INVALID, PAGE_SIZE};
use static_assertions::const_assert;
use std::mem::{offset_of, size_of};

/// Magic number identifying database files
pub const MAGIC: u32 = 0xBEEF_C0DE;

/// On-disk format version
pub const VERSION: u32 = 1;

/// Index of the free-list database in `Meta::dbs`
pub const FREE_DBI: usize = 0;

/// Index of the main database in `Meta::dbs`
pub const MAIN_DBI: usize = 1;

/// A B+tree descriptor as stored in the meta page (and, for named
/// databases, in main-DB records)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Db {
    /// Page size of the file (meaningful in `dbs[0]` only)
    pub pad: u32,
    /// Database flags (env flags in `dbs[0]`)
    pub flags: u16,
    /// Depth of the tree; 0 when empty
    pub depth: u16,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data items
    pub entries: u64,
    /// Root page number; `P_INVALID` when the tree is empty
    pub root: u64,
}

impl Default for Db {
    fn default() -> Self {
        Self {
            pad: 0,
            flags: 0,
            depth: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: P_INVALID,
        }
    }
}

impl Db {
    /// Size of the serialized descriptor
    pub const SIZE: usize = size_of::<Self>();

    /// Serialize into the record form stored in leaf nodes
    pub fn to_bytes(&self) -> [u8; Db::SIZE] {
        let mut buf = [0u8; Db::SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self as *const Db as *const u8,
                buf.as_mut_ptr(),
                Db::SIZE,
            );
        }
        buf
    }

    /// Deserialize from a leaf-node record
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != Db::SIZE {
            return Err(Error::Corruption {
                details: format!("bad DB record length {}", data.len()),
                page_id: None,
            });
        }
        let mut db = Db::default();
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                &mut db as *mut Db as *mut u8,
                Db::SIZE,
            );
        }
        Ok(db)
    }
}

const_assert!(Db::SIZE == 48);

/// Meta record, stored at byte `PageHeader::SIZE` of pages 0 and 1
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Meta {
    /// Magic number
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Fixed map address, or 0 (FIXEDMAP)
    pub map_addr: u64,
    /// Size of the data map in bytes
    pub map_size: u64,
    /// Free-list DB descriptor, then main DB descriptor
    pub dbs: [Db; 2],
    /// Highest page number durably written
    pub last_pgno: u64,
    /// Transaction id of the commit that wrote this meta
    pub txnid: u64,
}

/// Byte offset of the mutable tail within the meta record: everything from
/// the first descriptor's `depth` onward changes across commits; the fields
/// before it are fixed at creation.
pub const META_TAIL_OFFSET: usize = offset_of!(Meta, dbs) + offset_of!(Db, depth);

const_assert!(size_of::<Meta>() + PageHeader::SIZE <= PAGE_SIZE);
// The on-disk structures assume a little-endian host, like the rest of the
// page format.
const_assert!(cfg!(target_endian = "little"));

impl Meta {
    /// A fresh meta for a newly created environment
    pub fn new(map_size: u64, env_flags: u16) -> Self {
        let mut free_db = Db { pad: PAGE_SIZE as u32, flags: env_flags, ..Db::default() };
        free_db.flags |= crate::db::DatabaseFlags::INTEGERKEY.bits();
        Self {
            magic: MAGIC,
            version: VERSION,
            map_addr: 0,
            map_size,
            dbs: [free_db, Db::default()],
            last_pgno: 1,
            txnid: 0,
        }
    }

    /// Validate magic, version and recorded page size
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Invalid("bad meta magic"));
        }
        if self.version != VERSION {
            return Err(Error::VersionMismatch { expected: VERSION, found: self.version });
        }
        if self.dbs[FREE_DBI].pad != PAGE_SIZE as u32 {
            return Err(Error::VersionMismatch {
                expected: PAGE_SIZE as u32,
                found: self.dbs[FREE_DBI].pad,
            });
        }
        Ok(())
    }

    /// Transaction id as a typed value
    pub fn txnid(&self) -> TransactionId {
        TransactionId(self.txnid)
    }

    /// Read the meta record out of a page
    pub fn from_page(page: &Page) -> Result<Self> {
        if !page.flags().contains(PageFlags::META) {
            return Err(Error::Invalid("not a meta page"));
        }
        let meta = unsafe { &*(page.data.as_ptr() as *const Meta) };
        meta.validate()?;
        Ok(*meta)
    }

    /// Build a full meta page for initial creation
    pub fn to_page(&self, pgno: PageId) -> Box<Page> {
        let mut page = Page::new(pgno, PageFlags::META);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self as *const Meta as *const u8,
                page.data.as_mut_ptr(),
                size_of::<Meta>(),
            );
        }
        page
    }

    /// The mutable tail written at commit: bytes from `META_TAIL_OFFSET` to
    /// the end of the record
    pub fn tail_bytes(&self) -> &[u8] {
        let all = unsafe {
            std::slice::from_raw_parts(self as *const Meta as *const u8, size_of::<Meta>())
        };
        &all[META_TAIL_OFFSET..]
    }

    /// File offset where this transaction's meta tail lands
    pub fn tail_file_offset(txnid: TransactionId) -> u64 {
        let toggle = txnid.0 % 2;
        toggle * PAGE_SIZE as u64 + (PageHeader::SIZE + META_TAIL_OFFSET) as u64
    }
}

/// Pick the newer of two candidate metas; either may be torn or absent
pub fn pick_meta(meta0: Result<Meta>, meta1: Result<Meta>) -> Result<(Meta, usize)> {
    match (meta0, meta1) {
        (Ok(m0), Ok(m1)) => {
            if m0.txnid >= m1.txnid {
                Ok((m0, 0))
            } else {
                Ok((m1, 1))
            }
        }
        (Ok(m0), Err(_)) => Ok((m0, 0)),
        (Err(_), Ok(m1)) => Ok((m1, 1)),
        (Err(e), Err(_)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_round_trip() {
        let meta = Meta::new(1 << 20, 0);
        assert!(meta.validate().is_ok());
        let page = meta.to_page(PageId(0));
        let back = Meta::from_page(&page).unwrap();
        assert_eq!(back.magic, MAGIC);
        assert_eq!(back.dbs[FREE_DBI].pad, PAGE_SIZE as u32);
        assert_eq!(back.dbs[MAIN_DBI].root, P_INVALID);
    }

    #[test]
    fn test_validate_rejects() {
        let mut meta = Meta::new(1 << 20, 0);
        meta.magic = 0xDEAD_BEEF;
        assert!(meta.validate().is_err());

        let mut meta = Meta::new(1 << 20, 0);
        meta.version = 9;
        assert!(matches!(
            meta.validate(),
            Err(Error::VersionMismatch { expected: VERSION, found: 9 })
        ));
    }

    #[test]
    fn test_pick_newer() {
        let mut m0 = Meta::new(1 << 20, 0);
        let mut m1 = Meta::new(1 << 20, 0);
        m0.txnid = 4;
        m1.txnid = 5;
        let (picked, idx) = pick_meta(Ok(m0), Ok(m1)).unwrap();
        assert_eq!(picked.txnid, 5);
        assert_eq!(idx, 1);

        let (picked, idx) = pick_meta(Ok(m0), Err(Error::Invalid("torn"))).unwrap();
        assert_eq!(picked.txnid, 4);
        assert_eq!(idx, 0);
    }

    #[test]
    fn test_tail_offsets() {
        // The tail starts inside the first descriptor, past pad and flags
        assert_eq!(META_TAIL_OFFSET, 24 + 6);
        assert_eq!(Meta::tail_file_offset(TransactionId(2)), (PageHeader::SIZE + 30) as u64);
        assert_eq!(
            Meta::tail_file_offset(TransactionId(3)),
            (PAGE_SIZE + PageHeader::SIZE + 30) as u64
        );
    }

    #[test]
    fn test_db_record_round_trip() {
        let db = Db {
            pad: 0,
            flags: 0x04,
            depth: 3,
            branch_pages: 7,
            leaf_pages: 40,
            overflow_pages: 2,
            entries: 1000,
            root: 99,
        };
        let bytes = db.to_bytes();
        let back = Db::from_bytes(&bytes).unwrap();
        assert_eq!(back.root, 99);
        assert_eq!(back.entries, 1000);
        assert_eq!(back.depth, 3);
        assert!(Db::from_bytes(&bytes[..20]).is_err());
    }
}
