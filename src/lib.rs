//! Embedded memory-mapped key-value store
//!
//! cowdb keeps one B+tree file per environment, mapped read-only and shared
//! across any number of concurrent read snapshots while a single writer
//! builds the next version out of copy-on-write pages. Commits alternate
//! between two meta pages with an fsync on either side, so a crash at any
//! point leaves one intact meta and a consistent tree behind it. Pages freed
//! by old versions return through a free-list database once no live reader
//! can still see them.

#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod comparator;
pub mod cursor;
pub mod db;
pub mod env;
pub mod error;
pub mod idl;
pub mod meta;
pub mod page;
pub mod txn;

pub(crate) mod btree;
pub(crate) mod dupsort;
pub(crate) mod freelist;
pub(crate) mod lock;
pub(crate) mod overflow;

// Re-exports
pub use cursor::Cursor;
pub use db::{Database, DatabaseFlags, Stat, WriteFlags};
pub use env::{EnvBuilder, EnvFlags, Environment};
pub use error::{Error, PageId, Result, TransactionId};
pub use txn::{ReadTransaction, Transaction, WriteTransaction};

/// A read-only transaction
pub type RoTxn<'env> = Transaction<'env, txn::Read>;
/// A read-write transaction
pub type RwTxn<'env> = Transaction<'env, txn::Write>;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
