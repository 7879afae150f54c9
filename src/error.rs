//! Error types for cowdb

use std::fmt;
use std::io;
use thiserror::Error;

/// The main error type for cowdb operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(String),

    /// Key not found, empty tree, or cursor moved past the ends
    #[error("Key not found")]
    NotFound,

    /// NOOVERWRITE (or NODUPDATA) violated
    #[error("Key already exists")]
    KeyExist,

    /// A page cannot accommodate an update; internally triggers a split
    #[error("No space on page")]
    NoSpace,

    /// Format or magic incompatibility
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected on-disk version
        expected: u32,
        /// Version found in the file
        found: u32,
    },

    /// Malformed arguments, bad meta page, or wrong transaction state
    #[error("Invalid: {0}")]
    Invalid(&'static str),

    /// Write attempted through a read-only transaction or environment
    #[error("Permission denied: {0}")]
    Perm(&'static str),

    /// Allocation failed
    #[error("Out of memory")]
    NoMem,

    /// Reader table has no free slots
    #[error("Reader table full")]
    ReadersFull,

    /// Database corruption detected
    #[error("Corruption detected: {details}")]
    Corruption {
        /// Description of the corruption
        details: String,
        /// Page where corruption was detected
        page_id: Option<PageId>,
    },

    /// Transaction has seen an I/O failure and is poisoned until abort
    #[error("Bad transaction")]
    BadTransaction,
}

/// Page identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    /// Convert to byte offset in file
    pub fn to_offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type alias for cowdb operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::OutOfMemory {
            return Error::NoMem;
        }
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::other("boom").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_display() {
        let err = Error::VersionMismatch { expected: 1, found: 2 };
        assert_eq!(err.to_string(), "Version mismatch: expected 1, found 2");
        assert_eq!(PageId(7).to_string(), "7");
        assert_eq!(PageId(3).to_offset(4096), 12288);
    }
}
