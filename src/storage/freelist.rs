//! # Persistent Free List
//!
//! When a commit replaces a node, the old node's extent becomes unreachable
//! from every version at or beyond that commit - but snapshots pinned at
//! older versions may still walk it. The free list records these extents,
//! tagged with the version whose commit freed them, and is itself persisted
//! as a node referenced from the header. It is a first-class part of the
//! committed state, not a side table.
//!
//! ## Node Layout
//!
//! ```text
//! Offset  Size  Description
//! 0       4     Extent count
//! 4       24*N  Extents: {offset: u64, len: u64, freed_version: u64}
//! ```
//!
//! ## Reuse Rule
//!
//! An extent freed at version `v` is unreachable from `v` onward, so it may
//! be overwritten once every pinned snapshot is at version `v` or newer:
//!
//! ```text
//! reusable(extent)  ⟺  extent.freed_version <= reclaim_before
//! ```
//!
//! where the committing writer passes
//! `reclaim_before = min(oldest pinned version, current committed version)`.
//! The second bound keeps extents freed by the in-flight commit untouched:
//! they are still reachable from the current durable header, and a crash
//! before the header swap must find them intact.
//!
//! ## Allocation
//!
//! First-fit over reusable extents; an oversized extent is split and the
//! remainder keeps its tag. Adjacent extents are coalesced before encoding
//! (the merged extent takes the newer tag, which only delays reuse). The
//! free-list node itself is always placed at the file tail: allocating it
//! from the list it encodes would change the list being encoded.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use super::node::{encode_node, NodeKind, PayloadCursor};
use super::store::PersistentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeExtent {
    pub offset: u64,
    pub len: u64,
    pub freed_version: u64,
}

#[derive(Debug, Default)]
pub struct Freelist {
    extents: Vec<FreeExtent>,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the free list referenced by a header, or an empty list when the
    /// header carries no free-list offset.
    pub fn load(store: &PersistentStore, offset: u64, limit: u64) -> Result<Self> {
        if offset == 0 {
            return Ok(Self::new());
        }

        let (kind, payload) = store.node(offset, limit)?;
        ensure!(
            kind == NodeKind::Freelist,
            "expected freelist node at offset {}, found {:?}",
            offset,
            kind
        );

        let mut cursor = PayloadCursor::new(payload);
        let count = cursor.u32()? as usize;
        let mut extents = Vec::with_capacity(count);
        for _ in 0..count {
            extents.push(FreeExtent {
                offset: cursor.u64()?,
                len: cursor.u64()?,
                freed_version: cursor.u64()?,
            });
        }

        Ok(Self { extents })
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn total_free_bytes(&self) -> u64 {
        self.extents.iter().map(|e| e.len).sum()
    }

    /// Records a newly unreachable extent.
    pub fn push(&mut self, extent: FreeExtent) {
        debug_assert!(extent.len % 8 == 0 && extent.offset % 8 == 0);
        self.extents.push(extent);
    }

    /// First-fit allocation of `len` bytes from extents no pinned snapshot
    /// can still observe. Returns the extent offset, or `None` when nothing
    /// fits (the caller appends at the tail instead).
    pub fn allocate(&mut self, len: u64, reclaim_before: u64) -> Option<u64> {
        debug_assert!(len % 8 == 0);

        let idx = self
            .extents
            .iter()
            .position(|e| e.freed_version <= reclaim_before && e.len >= len)?;

        let extent = self.extents[idx];
        if extent.len == len {
            self.extents.swap_remove(idx);
        } else {
            self.extents[idx] = FreeExtent {
                offset: extent.offset + len,
                len: extent.len - len,
                freed_version: extent.freed_version,
            };
        }

        Some(extent.offset)
    }

    /// Sorts by offset and merges adjacent extents. A merged extent takes the
    /// newer tag: that can only delay reuse, never allow it early.
    pub fn coalesce(&mut self) {
        if self.extents.len() < 2 {
            return;
        }

        self.extents.sort_unstable_by_key(|e| e.offset);

        let mut merged: SmallVec<[FreeExtent; 16]> = SmallVec::new();
        for extent in self.extents.drain(..) {
            match merged.last_mut() {
                Some(last) if last.offset + last.len == extent.offset => {
                    last.len += extent.len;
                    last.freed_version = last.freed_version.max(extent.freed_version);
                }
                _ => merged.push(extent),
            }
        }

        self.extents = merged.into_vec();
    }

    /// Encodes the list as a framed node. An empty list encodes nothing; the
    /// header records offset 0 instead.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut payload = Vec::with_capacity(4 + self.extents.len() * 24);
        payload.extend_from_slice(&(self.extents.len() as u32).to_le_bytes());
        for extent in &self.extents {
            payload.extend_from_slice(&extent.offset.to_le_bytes());
            payload.extend_from_slice(&extent.len.to_le_bytes());
            payload.extend_from_slice(&extent.freed_version.to_le_bytes());
        }
        encode_node(NodeKind::Freelist, &payload, out);
    }

    #[cfg(test)]
    pub(crate) fn extents(&self) -> &[FreeExtent] {
        &self.extents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(offset: u64, len: u64, freed_version: u64) -> FreeExtent {
        FreeExtent {
            offset,
            len,
            freed_version,
        }
    }

    #[test]
    fn allocate_skips_extents_pinned_readers_need() {
        let mut fl = Freelist::new();
        fl.push(ext(200, 64, 5));
        fl.push(ext(400, 64, 9));

        // Oldest pinned reader sits at version 6: the extent freed at 9 is
        // still reachable from that snapshot's past and must not be reused.
        assert_eq!(fl.allocate(64, 6), Some(200));
        assert_eq!(fl.allocate(64, 6), None);

        // Once the pin advances past 9, it becomes reusable.
        assert_eq!(fl.allocate(64, 9), Some(400));
        assert!(fl.is_empty());
    }

    #[test]
    fn allocate_splits_oversized_extent() {
        let mut fl = Freelist::new();
        fl.push(ext(200, 96, 3));

        assert_eq!(fl.allocate(64, u64::MAX), Some(200));
        assert_eq!(fl.extents(), &[ext(264, 32, 3)]);
    }

    #[test]
    fn allocate_with_no_pins_reuses_everything() {
        let mut fl = Freelist::new();
        fl.push(ext(200, 32, 100));

        assert_eq!(fl.allocate(32, u64::MAX), Some(200));
    }

    #[test]
    fn coalesce_merges_adjacent_with_newer_tag() {
        let mut fl = Freelist::new();
        fl.push(ext(264, 32, 7));
        fl.push(ext(200, 64, 3));
        fl.push(ext(512, 8, 4));

        fl.coalesce();

        assert_eq!(fl.extents(), &[ext(200, 96, 7), ext(512, 8, 4)]);
    }

    #[test]
    fn encode_is_framed_and_aligned() {
        let mut fl = Freelist::new();
        fl.push(ext(200, 64, 3));

        let mut out = Vec::new();
        fl.encode(&mut out);
        assert_eq!(out.len() % 8, 0);
    }
}
