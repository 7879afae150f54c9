//! Key ordering for databases
//!
//! Keys within a page are ordered by the database's comparator. The default
//! is plain lexicographic byte order; REVERSEKEY compares the bytes back to
//! front, and INTEGERKEY orders little-endian unsigned integers numerically
//! (which on a little-endian host is exactly byte-reverse order). A database
//! may also register a user-supplied function, and DUPSORT databases carry a
//! second comparator for the duplicate sub-tree.

use std::cmp::Ordering;

/// A key comparison function
pub type CmpFn = fn(&[u8], &[u8]) -> Ordering;

/// Plain lexicographic byte order
pub fn lexicographic(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Byte-reverse order, for REVERSEKEY databases
///
/// Compares from the last byte towards the first; a shorter key that is a
/// suffix of a longer one sorts first.
pub fn reverse_lexicographic(a: &[u8], b: &[u8]) -> Ordering {
    let mut ia = a.iter().rev();
    let mut ib = b.iter().rev();
    loop {
        match (ia.next(), ib.next()) {
            (Some(ca), Some(cb)) => match ca.cmp(cb) {
                Ordering::Equal => continue,
                other => return other,
            },
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

/// Numeric order for INTEGERKEY databases
///
/// Keys are little-endian unsigned integers of equal width within one
/// database; byte-reverse comparison yields numeric order on such keys.
pub fn integer_key(a: &[u8], b: &[u8]) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => reverse_lexicographic(a, b),
        other => other,
    }
}

/// Pick the key comparator matching a set of database flags
pub fn for_flags(flags: crate::db::DatabaseFlags) -> CmpFn {
    if flags.contains(crate::db::DatabaseFlags::INTEGERKEY) {
        integer_key
    } else if flags.contains(crate::db::DatabaseFlags::REVERSEKEY) {
        reverse_lexicographic
    } else {
        lexicographic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicographic() {
        assert_eq!(lexicographic(b"abc", b"abd"), Ordering::Less);
        assert_eq!(lexicographic(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(lexicographic(b"b", b"abc"), Ordering::Greater);
    }

    #[test]
    fn test_reverse() {
        // Compared from the tail: "cba" vs "dba" decides on the last byte
        assert_eq!(reverse_lexicographic(b"abc", b"abd"), Ordering::Less);
        assert_eq!(reverse_lexicographic(b"xa", b"yb"), Ordering::Less);
        assert_eq!(reverse_lexicographic(b"bc", b"abc"), Ordering::Less);
        assert_eq!(reverse_lexicographic(b"", b""), Ordering::Equal);
    }

    #[test]
    fn test_integer_key() {
        let k = |v: u64| v.to_le_bytes();
        assert_eq!(integer_key(&k(1), &k(2)), Ordering::Less);
        assert_eq!(integer_key(&k(255), &k(256)), Ordering::Less);
        assert_eq!(integer_key(&k(1 << 40), &k(3)), Ordering::Greater);
        assert_eq!(integer_key(&k(77), &k(77)), Ordering::Equal);
        // Numeric order must match for random pairs
        for (a, b) in [(3u64, 0x1_0000u64), (0xff00, 0x00ff), (1, u64::MAX)] {
            assert_eq!(integer_key(&k(a), &k(b)), a.cmp(&b));
        }
    }
}
