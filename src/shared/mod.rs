//! # Shared Transactional Core
//!
//! This module turns the single-writer persistent tree of the storage layer
//! into a concurrent, crash-consistent, multi-process database with snapshot
//! isolation. It has four parts:
//!
//! - `info`: the shared info region - a page of cross-process atomics backed
//!   by the `.tdb.lock` file, holding the process and writer locks, the
//!   opener table, and the version ring's storage
//! - `ring`: the bounded ring of live snapshot descriptors; readers pin an
//!   entry, writers publish a new one and evict what no reader needs
//! - `shared_group`: `SharedGroup`, the per-handle transaction controller
//!   driving Idle → Reading → Idle and Idle → Writing → Idle
//! - `recovery`: liveness sweeps and region reinitialization after crashes
//!
//! ## How a Commit Becomes Visible
//!
//! ```text
//! writer                                  readers
//! ──────                                  ───────
//! lock_writer()
//! stage copy-on-write nodes               pin_latest() -> version N
//! append + flush_data()                   ... read snapshot N ...
//! swap_header()      <- durable
//! ring.publish(N+1)  <- visible           pin_latest() -> version N+1
//! unlock_writer()                         ... old pins still read N ...
//! ```
//!
//! Readers and the writer only ever contend for the few instructions of a
//! ring operation under the process lock; a pinned reader never blocks a
//! commit and a commit never disturbs a pinned reader.

mod info;
mod recovery;
mod ring;
mod shared_group;

pub use shared_group::{Durability, OpenOptions, SharedGroup};
