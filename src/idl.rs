//! Compact ordered lists of page numbers
//!
//! The free database stores, per freeing transaction, the set of page
//! numbers that transaction released. The set is kept sorted ascending so
//! the allocator can pop from the tail, and is serialized with a length
//! prefix so a whole record can be read back in one slice.

use crate::error::{Error, PageId, Result};
use byteorder::{ByteOrder, LittleEndian};

/// An ordered set of page numbers
///
/// Serialized form: `u64` count at index 0, then the ids ascending. A fully
/// contiguous run may instead be written in range form: count `0`, then
/// `[start, end]` inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Idl {
    ids: Vec<u64>,
}

impl Idl {
    /// Create an empty list
    pub fn new() -> Self {
        Self { ids: Vec::new() }
    }

    /// True when the list holds no ids
    pub fn is_zero(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of ids in the list
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when the list holds no ids
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The largest id, if any
    pub fn last(&self) -> Option<u64> {
        self.ids.last().copied()
    }

    /// Insert an id, keeping the list sorted and duplicate-free
    pub fn insert(&mut self, id: u64) {
        match self.ids.binary_search(&id) {
            Ok(_) => {}
            Err(pos) => self.ids.insert(pos, id),
        }
    }

    /// Insert the page behind a [`PageId`]
    pub fn push(&mut self, id: PageId) {
        self.insert(id.0);
    }

    /// Remove and return the largest id
    pub fn pop_last(&mut self) -> Option<u64> {
        self.ids.pop()
    }

    /// Iterate ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ids.iter().copied()
    }

    /// True when the ids form one contiguous ascending run of length >= 2
    fn is_contiguous(&self) -> bool {
        match (self.ids.first(), self.ids.last()) {
            (Some(&first), Some(&last)) if self.ids.len() >= 2 => {
                last - first + 1 == self.ids.len() as u64
            }
            _ => false,
        }
    }

    /// Size of the serialized representation in bytes
    pub fn byte_size(&self) -> usize {
        if self.is_contiguous() {
            3 * 8
        } else {
            (1 + self.ids.len()) * 8
        }
    }

    /// Serialize into the length-prefixed (or range) wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.byte_size()];
        if self.is_contiguous() {
            LittleEndian::write_u64(&mut buf[0..8], 0);
            LittleEndian::write_u64(&mut buf[8..16], self.ids[0]);
            LittleEndian::write_u64(&mut buf[16..24], *self.ids.last().unwrap_or(&0));
        } else {
            LittleEndian::write_u64(&mut buf[0..8], self.ids.len() as u64);
            for (i, id) in self.ids.iter().enumerate() {
                LittleEndian::write_u64(&mut buf[(1 + i) * 8..(2 + i) * 8], *id);
            }
        }
        buf
    }

    /// Deserialize from the wire form
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 8 || data.len() % 8 != 0 {
            return Err(Error::Corruption {
                details: format!("bad IDL record length {}", data.len()),
                page_id: None,
            });
        }
        let count = LittleEndian::read_u64(&data[0..8]) as usize;
        if count == 0 && data.len() >= 24 {
            // Range form: [start, end] inclusive
            let start = LittleEndian::read_u64(&data[8..16]);
            let end = LittleEndian::read_u64(&data[16..24]);
            if end < start {
                return Err(Error::Corruption {
                    details: format!("bad IDL range {}..{}", start, end),
                    page_id: None,
                });
            }
            return Ok(Self { ids: (start..=end).collect() });
        }
        if data.len() < (1 + count) * 8 {
            return Err(Error::Corruption {
                details: format!("IDL record truncated: {} ids, {} bytes", count, data.len()),
                page_id: None,
            });
        }
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            ids.push(LittleEndian::read_u64(&data[(1 + i) * 8..(2 + i) * 8]));
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(Self { ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sorted() {
        let mut idl = Idl::new();
        assert!(idl.is_zero());
        idl.insert(30);
        idl.insert(10);
        idl.insert(20);
        idl.insert(20);
        assert_eq!(idl.iter().collect::<Vec<_>>(), vec![10, 20, 30]);
        assert_eq!(idl.last(), Some(30));
        assert_eq!(idl.pop_last(), Some(30));
        assert_eq!(idl.len(), 2);
    }

    #[test]
    fn test_round_trip() {
        let mut idl = Idl::new();
        for id in [5u64, 99, 7, 12] {
            idl.insert(id);
        }
        let bytes = idl.to_bytes();
        assert_eq!(bytes.len(), idl.byte_size());
        let back = Idl::from_bytes(&bytes).unwrap();
        assert_eq!(back, idl);
    }

    #[test]
    fn test_range_form() {
        let mut idl = Idl::new();
        for id in 100..200u64 {
            idl.insert(id);
        }
        // Contiguous runs compress to three words
        assert_eq!(idl.byte_size(), 24);
        let bytes = idl.to_bytes();
        let back = Idl::from_bytes(&bytes).unwrap();
        assert_eq!(back.len(), 100);
        assert_eq!(back.last(), Some(199));
    }

    #[test]
    fn test_bad_records() {
        assert!(Idl::from_bytes(&[1, 2, 3]).is_err());
        // Count claims more ids than the buffer holds
        let mut buf = vec![0u8; 16];
        LittleEndian::write_u64(&mut buf[0..8], 4);
        assert!(Idl::from_bytes(&buf).is_err());
    }
}
