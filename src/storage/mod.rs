//! # Storage Module
//!
//! This module provides the foundational storage layer for TideDB: a single
//! memory-mapped database file holding an immutable, append-mostly heap of
//! tree nodes, published through one of two alternating checksummed headers.
//!
//! ## Architecture Overview
//!
//! The storage layer is built around memory-mapped I/O. Instead of copying
//! data between kernel and user space, the database file is mapped directly
//! into the process address space:
//!
//! - **Zero-copy reads**: node payloads are `&[u8]` slices into the mapping
//! - **Minimal syscall overhead**: page faults are handled by the OS
//! - **Cross-process visibility**: the mapping is `MAP_SHARED`, so bytes a
//!   writer stores are immediately visible to every other mapping of the
//!   file, without waiting for writeback
//!
//! ## File Layout
//!
//! ```text
//! Offset 0:    FilePrefix (64 bytes)   magic, format version
//! Offset 64:   HeaderSlot A (64 bytes) version, root, size, freelist, crc
//! Offset 128:  HeaderSlot B (64 bytes)
//! Offset 192:  node heap (append-mostly, 8-byte aligned nodes)
//! ```
//!
//! Exactly one header slot is *current*: the one with a valid checksum and
//! the higher version. A commit writes the new header into the other slot and
//! flushes it; a torn write invalidates that slot's checksum, so a crash at
//! any instant leaves a valid current header. There is no separate selector
//! word to flip.
//!
//! ## Immutability and Copy-on-Write
//!
//! Once a node is reachable from a committed header, its bytes never change.
//! A writer stages replacement nodes, places them into free extents or at the
//! file tail, and publishes them with a single header swap. Offsets are
//! stable forever once written; unreachable extents are recorded in a
//! persistent free list and reused only when no pinned snapshot can still
//! observe them.
//!
//! ## Safety Model
//!
//! The mapping is remapped when the file grows. `grow_to`/`remap` require
//! `&mut self`, so the borrow checker proves no node slice outlives a remap.
//! This is the same compile-time discipline as holding a page reference
//! across a pager grow, with zero runtime cost.
//!
//! ## Module Organization
//!
//! - `mmap`: low-level byte-oriented mapped file (`MmapFile`)
//! - `header`: file prefix and the two alternating header slots
//! - `node`: node framing (kind + payload length) and payload cursors
//! - `store`: `PersistentStore` - append, flush, header swap, node reads
//! - `freelist`: persistent, version-tagged free extents

mod freelist;
mod header;
mod mmap;
mod node;
mod store;

pub use freelist::{FreeExtent, Freelist};
pub use header::{
    select_current, FilePrefix, HeaderSlot, BODY_START, DB_MAGIC, FILE_PREFIX_SIZE,
    FORMAT_VERSION, HEADER_SLOT_OFFSETS, HEADER_SLOT_SIZE,
};
pub use mmap::{MmapFile, GROW_CHUNK};
pub use node::{
    align_up, decode_node, encode_node, node_total_len, NodeKind, PayloadCursor, NODE_HEADER_SIZE,
};
pub use store::{CommitPoint, PersistentStore};
