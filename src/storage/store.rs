//! # Persistent Store
//!
//! `PersistentStore` is the storage interface the transactional core drives:
//! an append-mostly node heap in a single memory-mapped file, published
//! through the dual header slots.
//!
//! ## Commit Protocol
//!
//! A writer calls, in order:
//!
//! 1. `begin_write_at(committed_size)` - start allocating at the tail
//! 2. `append(node)` / `write_at(offset, node)` - place staged nodes
//! 3. `flush_data()` - make every placed byte durable
//! 4. `swap_header(commit)` - durably publish the new root
//!
//! `flush_data` before `swap_header` guarantees no header ever points beyond
//! durable data. `swap_header` writes the complete new slot into the
//! non-current position and flushes the header region; a crash at any instant
//! leaves one valid current header (see the `header` module).
//!
//! ## Crash Windows
//!
//! - Death before `swap_header`: the appended tail is unreachable garbage;
//!   the next writer starts its tail at the old committed size and overwrites
//!   it.
//! - Death after `swap_header`: the commit is complete; the next opener reads
//!   the new root even though no snapshot was ever published in shared
//!   memory.
//!
//! ## Bounds Discipline
//!
//! Readers pass the committed size of their snapshot as `limit` to every
//! `node` call; a corrupt offset or length surfaces as an error before any
//! out-of-snapshot byte is touched.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::debug;
use zerocopy::IntoBytes;

use crate::error::DbError;

use super::header::{
    select_current, FilePrefix, HeaderSlot, BODY_START, FILE_PREFIX_SIZE, HEADER_SLOT_OFFSETS,
    HEADER_SLOT_SIZE,
};
use super::mmap::{MmapFile, GROW_CHUNK};
use super::node::{align_up, decode_node, NodeKind, NODE_HEADER_SIZE};

/// A committed database state as named by a header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPoint {
    pub version: u64,
    pub root_offset: u64,
    pub file_size: u64,
    pub freelist_offset: u64,
}

#[derive(Debug)]
pub struct PersistentStore {
    mmap: MmapFile,
    path: PathBuf,
    /// Next allocation offset during a write transaction.
    tail: u64,
    /// Byte range written since the last `flush_data`, as `[start, end)`.
    dirty: Option<(u64, u64)>,
}

impl PersistentStore {
    /// Creates a new database file whose first committed state (version 1)
    /// is `initial_root` - a single framed node placed at `BODY_START`.
    ///
    /// The caller holds the boundary lock, so creation cannot race.
    pub fn create<P: AsRef<Path>>(path: P, initial_root: &[u8]) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            !initial_root.is_empty() && initial_root.len() % 8 == 0,
            "initial root must be a framed node"
        );

        let mut mmap = MmapFile::create(path, GROW_CHUNK)?;

        mmap.slice_mut(0, FILE_PREFIX_SIZE as u64)?
            .copy_from_slice(FilePrefix::new().as_bytes());

        mmap.slice_mut(BODY_START, initial_root.len() as u64)?
            .copy_from_slice(initial_root);

        let file_size = BODY_START + initial_root.len() as u64;
        let first = HeaderSlot::new(1, BODY_START, file_size, 0);

        mmap.slice_mut(HEADER_SLOT_OFFSETS[0], HEADER_SLOT_SIZE as u64)?
            .copy_from_slice(first.as_bytes());
        mmap.slice_mut(HEADER_SLOT_OFFSETS[1], HEADER_SLOT_SIZE as u64)?
            .copy_from_slice(HeaderSlot::empty().as_bytes());

        mmap.flush()?;
        mmap.sync_metadata()?;

        debug!(path = %path.display(), file_size, "created database file");

        Ok(Self {
            mmap,
            path: path.to_path_buf(),
            tail: file_size,
            dirty: None,
        })
    }

    /// Opens an existing database file, validating the prefix and that at
    /// least one header slot is current.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mmap = MmapFile::open(path)?;

        if mmap.len() < BODY_START {
            return Err(DbError::OpenFailed(format!(
                "'{}' is too short to be a database file",
                path.display()
            ))
            .into());
        }

        FilePrefix::from_bytes(mmap.slice(0, FILE_PREFIX_SIZE as u64)?)
            .wrap_err_with(|| format!("invalid database file '{}'", path.display()))?;

        let store = Self {
            mmap,
            path: path.to_path_buf(),
            tail: 0,
            dirty: None,
        };

        let commit = store.read_root()?;
        ensure!(
            commit.file_size <= store.mmap.file_len()?,
            "committed size {} exceeds physical file length",
            commit.file_size
        );

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of this handle's current mapping.
    pub fn mapped_len(&self) -> u64 {
        self.mmap.len()
    }

    /// Reads the current header. Re-reads the slots each call: another
    /// process may have committed since, and header stores are visible
    /// through the shared mapping as soon as they happen.
    pub fn read_root(&self) -> Result<CommitPoint> {
        let a = *HeaderSlot::from_bytes(
            self.mmap
                .slice(HEADER_SLOT_OFFSETS[0], HEADER_SLOT_SIZE as u64)?,
        )?;
        let b = *HeaderSlot::from_bytes(
            self.mmap
                .slice(HEADER_SLOT_OFFSETS[1], HEADER_SLOT_SIZE as u64)?,
        )?;

        let current = if select_current(&a, &b)? == 0 { a } else { b };

        Ok(CommitPoint {
            version: current.version(),
            root_offset: current.root_offset(),
            file_size: current.file_size(),
            freelist_offset: current.freelist_offset(),
        })
    }

    /// Remaps if this handle's mapping is shorter than `file_size` (another
    /// process grew the file).
    pub fn ensure_mapped(&mut self, file_size: u64) -> Result<()> {
        if self.mmap.len() < file_size {
            self.mmap.remap()?;
        }
        ensure!(
            self.mmap.len() >= file_size,
            "database file shorter than committed size {} (externally truncated?)",
            file_size
        );
        Ok(())
    }

    /// Decodes the node at `offset`, reading no byte at or beyond `limit`
    /// (the committed size of the caller's snapshot).
    pub fn node(&self, offset: u64, limit: u64) -> Result<(NodeKind, &[u8])> {
        ensure!(
            offset >= BODY_START && offset % 8 == 0,
            "corrupt node offset {}",
            offset
        );
        ensure!(
            limit <= self.mmap.len(),
            "snapshot limit {} exceeds mapped length {}",
            limit,
            self.mmap.len()
        );
        ensure!(
            offset + NODE_HEADER_SIZE as u64 <= limit,
            "node offset {} out of snapshot bounds {}",
            offset,
            limit
        );

        decode_node(self.mmap.slice(offset, limit - offset)?)
            .wrap_err_with(|| format!("corrupt node at offset {}", offset))
    }

    /// Starts a write transaction's allocation at the committed tail.
    pub fn begin_write_at(&mut self, committed_file_size: u64) {
        self.tail = align_up(committed_file_size.max(BODY_START));
        self.dirty = None;
    }

    /// Next tail-allocation offset; after the last placement this is the new
    /// committed file size.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Places `bytes` at the tail, growing the file as needed. Not durable
    /// until `flush_data`.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.tail;
        let end = offset + bytes.len() as u64;

        self.mmap.grow_to(end)?;
        self.mmap
            .slice_mut(offset, bytes.len() as u64)?
            .copy_from_slice(bytes);

        self.mark_dirty(offset, end);
        self.tail = align_up(end);

        Ok(offset)
    }

    /// Places `bytes` into a reused free extent below the tail. Not durable
    /// until `flush_data`.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len() as u64;
        ensure!(
            offset >= BODY_START && end <= self.tail,
            "extent write [{}, {}) outside the body",
            offset,
            end
        );

        self.mmap
            .slice_mut(offset, bytes.len() as u64)?
            .copy_from_slice(bytes);

        self.mark_dirty(offset, end);
        Ok(())
    }

    fn mark_dirty(&mut self, start: u64, end: u64) {
        self.dirty = Some(match self.dirty {
            None => (start, end),
            Some((s, e)) => (s.min(start), e.max(end)),
        });
    }

    /// Durably persists every byte placed since the last flush, including
    /// the file length itself (the header must never name bytes the file
    /// cannot durably hold).
    pub fn flush_data(&mut self) -> Result<()> {
        if let Some((start, end)) = self.dirty.take() {
            self.mmap.flush_range(start, end - start)?;
            self.mmap.sync_metadata()?;
        }
        Ok(())
    }

    /// Atomically publishes `commit` by writing it into the non-current
    /// header slot. With `durable` the header region is flushed before
    /// returning; without it the new header is visible to every mapping but
    /// rides the next writeback (the relaxed-durability mode, which trades
    /// crash safety for commit latency).
    pub fn swap_header(&mut self, commit: CommitPoint, durable: bool) -> Result<()> {
        let current = self.read_root()?;
        ensure!(
            commit.version > current.version,
            "commit version {} not beyond current {}",
            commit.version,
            current.version
        );

        let a = *HeaderSlot::from_bytes(
            self.mmap
                .slice(HEADER_SLOT_OFFSETS[0], HEADER_SLOT_SIZE as u64)?,
        )?;
        let b = *HeaderSlot::from_bytes(
            self.mmap
                .slice(HEADER_SLOT_OFFSETS[1], HEADER_SLOT_SIZE as u64)?,
        )?;
        let target = 1 - select_current(&a, &b)?;

        let slot = HeaderSlot::new(
            commit.version,
            commit.root_offset,
            commit.file_size,
            commit.freelist_offset,
        );

        self.mmap
            .slice_mut(HEADER_SLOT_OFFSETS[target], HEADER_SLOT_SIZE as u64)?
            .copy_from_slice(slot.as_bytes());

        if durable {
            self.mmap
                .flush_range(FILE_PREFIX_SIZE as u64, (2 * HEADER_SLOT_SIZE) as u64)?;
        }

        debug!(
            version = commit.version,
            root = commit.root_offset,
            file_size = commit.file_size,
            slot = target,
            "published header"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::node::{encode_node, NodeKind};
    use tempfile::tempdir;

    fn empty_group_node() -> Vec<u8> {
        let mut out = Vec::new();
        encode_node(NodeKind::Group, &0u32.to_le_bytes(), &mut out);
        out
    }

    #[test]
    fn create_commits_version_one() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::create(dir.path().join("t.tdb"), &empty_group_node()).unwrap();

        let commit = store.read_root().unwrap();
        assert_eq!(commit.version, 1);
        assert_eq!(commit.root_offset, BODY_START);
        assert_eq!(commit.freelist_offset, 0);

        let (kind, payload) = store.node(commit.root_offset, commit.file_size).unwrap();
        assert_eq!(kind, NodeKind::Group);
        assert_eq!(payload, &0u32.to_le_bytes());
    }

    #[test]
    fn commit_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tdb");

        {
            let mut store = PersistentStore::create(&path, &empty_group_node()).unwrap();
            let base = store.read_root().unwrap();

            store.begin_write_at(base.file_size);
            let mut node = Vec::new();
            encode_node(NodeKind::IntColumn, &42u64.to_le_bytes(), &mut node);
            let offset = store.append(&node).unwrap();

            store.flush_data().unwrap();
            store
                .swap_header(
                    CommitPoint {
                        version: 2,
                        root_offset: offset,
                        file_size: store.tail(),
                        freelist_offset: 0,
                    },
                    true,
                )
                .unwrap();
        }

        let store = PersistentStore::open(&path).unwrap();
        let commit = store.read_root().unwrap();
        assert_eq!(commit.version, 2);

        let (kind, payload) = store.node(commit.root_offset, commit.file_size).unwrap();
        assert_eq!(kind, NodeKind::IntColumn);
        assert_eq!(payload, &42u64.to_le_bytes());
    }

    #[test]
    fn unpublished_tail_is_invisible_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tdb");
        let before;

        {
            let mut store = PersistentStore::create(&path, &empty_group_node()).unwrap();
            before = store.read_root().unwrap();

            // Simulates a writer dying after flush_data but before
            // swap_header: durable bytes, no header.
            store.begin_write_at(before.file_size);
            let mut node = Vec::new();
            encode_node(NodeKind::IntColumn, &7u64.to_le_bytes(), &mut node);
            store.append(&node).unwrap();
            store.flush_data().unwrap();
        }

        let store = PersistentStore::open(&path).unwrap();
        assert_eq!(store.read_root().unwrap(), before);
    }

    #[test]
    fn swap_alternates_slots() {
        let dir = tempdir().unwrap();
        let mut store =
            PersistentStore::create(dir.path().join("t.tdb"), &empty_group_node()).unwrap();
        let base = store.read_root().unwrap();

        for version in 2u64..6 {
            store.begin_write_at(store.read_root().unwrap().file_size);
            let mut node = Vec::new();
            encode_node(NodeKind::IntColumn, &version.to_le_bytes(), &mut node);
            let offset = store.append(&node).unwrap();
            store.flush_data().unwrap();
            store
                .swap_header(
                    CommitPoint {
                        version,
                        root_offset: offset,
                        file_size: store.tail(),
                        freelist_offset: 0,
                    },
                    true,
                )
                .unwrap();
        }

        let commit = store.read_root().unwrap();
        assert_eq!(commit.version, 5);
        assert!(commit.file_size > base.file_size);
    }

    #[test]
    fn swap_rejects_stale_version() {
        let dir = tempdir().unwrap();
        let mut store =
            PersistentStore::create(dir.path().join("t.tdb"), &empty_group_node()).unwrap();
        let base = store.read_root().unwrap();

        let result = store.swap_header(
            CommitPoint {
                version: 1,
                ..base
            },
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn node_respects_snapshot_limit() {
        let dir = tempdir().unwrap();
        let mut store =
            PersistentStore::create(dir.path().join("t.tdb"), &empty_group_node()).unwrap();
        let base = store.read_root().unwrap();

        store.begin_write_at(base.file_size);
        let mut node = Vec::new();
        encode_node(NodeKind::IntColumn, &9u64.to_le_bytes(), &mut node);
        let offset = store.append(&node).unwrap();

        // A snapshot bounded at the old size cannot see the new node.
        assert!(store.node(offset, base.file_size).is_err());
        assert!(store.node(offset, store.tail()).is_ok());
    }
}
