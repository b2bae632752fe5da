//! # TideDB - Embedded Shared-Memory Transactional Database
//!
//! TideDB is an embedded database engine built around a persistent
//! copy-on-write tree. A single on-disk file holds an immutable, append-mostly
//! history of tree nodes published through one of two alternating headers; a
//! small shared-memory region (backed by a `.lock` file) coordinates any
//! number of reading threads and processes with one writer at a time.
//!
//! - **Snapshot isolation**: a reader sees the database frozen at the moment
//!   its transaction began, regardless of concurrent commits.
//! - **Crash consistency**: a commit becomes visible through a single durable
//!   header flip; a crash at any point leaves the previous committed state.
//! - **Multi-process**: coordination runs over lock-free atomics in a shared
//!   mapping, with a brief OS file lock only around open/close.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tidedb::{ColumnType, SharedGroup, Value};
//!
//! let mut shared = SharedGroup::open("./accounts.tdb")?;
//!
//! let group = shared.begin_write()?;
//! let table = group.get_or_create_table(
//!     "balances",
//!     &[("owner", ColumnType::String), ("amount", ColumnType::Int)],
//! )?;
//! table.add_row(&[Value::String("alice".into()), Value::Int(100)])?;
//! shared.commit()?;
//!
//! let group = shared.begin_read()?;
//! let table = group.table("balances").unwrap();
//! assert_eq!(table.get_int(0, 1)?, 100);
//! shared.end_read()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        SharedGroup (per handle)         │  begin/commit/rollback
//! ├───────────────────┬─────────────────────┤
//! │  Group / Table /  │  Version ring +     │
//! │  typed columns    │  cross-process locks│  <name>.tdb.lock
//! ├───────────────────┴─────────────────────┤
//! │  Copy-on-write node heap + free list    │
//! ├─────────────────────────────────────────┤
//! │  Dual-header memory-mapped file I/O     │  <name>.tdb
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Files
//!
//! - `<name>.tdb` - the durable database: a fixed prefix, two alternating
//!   64-byte headers, and an append-only body of tree nodes. Exactly one
//!   header is current at any instant; commits flip between them.
//! - `<name>.tdb.lock` - the shared info region: one page of atomics holding
//!   the cross-process locks, the opener table, and the ring of live snapshot
//!   versions. Created by the first opener, removed by the last closer. Not a
//!   valid database on its own.
//!
//! ## Concurrency Model
//!
//! At most one writer holds the writer lock across the whole system; readers
//! are unbounded and never block writers (nor each other) except for the few
//! instructions of a ring pin or publish under the process lock. Each handle
//! runs at most one transaction at a time; everything else is a
//! `TransactionMisuse` error.
//!
//! TideDB targets 64-bit Unix, where 8-byte atomics on a `MAP_SHARED` mapping
//! are hardware-atomic across processes.
//!
//! ## Module Overview
//!
//! - [`storage`]: dual-header mmap file, node heap, persistent free list
//! - [`group`]: the copy-on-write content tree - tables and typed columns
//! - [`index`]: B-tree index mapping integer values to row indices
//! - [`shared`]: the shared info region, version ring, and `SharedGroup`
//! - [`error`]: the `DbError` failure kinds

pub mod error;
pub mod group;
pub mod index;
pub mod shared;
pub mod storage;

pub use error::DbError;
pub use group::{ColumnType, Group, Table, Value};
pub use index::Index;
pub use shared::{Durability, OpenOptions, SharedGroup};
