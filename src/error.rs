//! # Error Kinds
//!
//! All fallible operations in TideDB return `eyre::Result` with rich context
//! chains. Failures that callers need to distinguish programmatically carry a
//! [`DbError`] as the root cause of the report; everything else is a plain
//! context chain.
//!
//! ## Kinds
//!
//! - `OpenFailed`: the database or lock file could not be created, opened, or
//!   locked.
//! - `CorruptHeader`: neither header slot in the database file is valid.
//! - `IoFailed`: a read, write, or flush failed mid-operation, or the handle
//!   was poisoned by an earlier fatal commit error.
//! - `TransactionMisuse`: a contract violation by the caller - beginning a
//!   transaction while one is active, committing outside a write, mutating a
//!   read view, type-mismatched cell access. Misuse never corrupts state.
//! - `Unsupported`: a file written by an incompatible format version.
//!
//! ## Matching on a kind
//!
//! ```ignore
//! match shared.begin_write() {
//!     Err(e) if matches!(e.downcast_ref(), Some(DbError::TransactionMisuse(_))) => { .. }
//!     other => { .. }
//! }
//! ```

use std::fmt;

/// Failure kinds callers can downcast to from an `eyre::Report`.
#[derive(Debug)]
pub enum DbError {
    /// The database or lock file could not be created, opened, or locked.
    OpenFailed(String),
    /// Neither header slot is valid; the file cannot be interpreted.
    CorruptHeader,
    /// A read, write, or flush failed mid-operation, or the handle was
    /// poisoned by an earlier fatal commit error.
    IoFailed(String),
    /// Caller contract violation. State is never corrupted by misuse.
    TransactionMisuse(&'static str),
    /// File written by an incompatible format version.
    Unsupported { found: u32, expected: u32 },
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::OpenFailed(what) => write!(f, "open failed: {what}"),
            DbError::CorruptHeader => write!(f, "neither database header is valid"),
            DbError::IoFailed(what) => write!(f, "i/o failed: {what}"),
            DbError::TransactionMisuse(what) => write!(f, "transaction misuse: {what}"),
            DbError::Unsupported { found, expected } => {
                write!(
                    f,
                    "unsupported format version {found} (this build reads version {expected})"
                )
            }
        }
    }
}

impl std::error::Error for DbError {}
