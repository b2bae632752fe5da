//! # Memory-Mapped File Access
//!
//! This module implements `MmapFile`, the low-level building block for
//! memory-mapped database file access. It provides bounds-checked byte slices
//! into the mapping with compile-time safety guarantees through Rust's borrow
//! checker.
//!
//! ## Design
//!
//! Traditional engines copy file data between kernel buffers and a user-space
//! cache. Memory-mapped I/O eliminates that copy by mapping the file directly
//! into the process address space; the OS page cache does the caching. The
//! mapping is `MAP_SHARED`, so a store by one process is visible to every
//! other mapping of the same file without an intervening write-back.
//!
//! ## Growth and Remapping
//!
//! Mapped regions become invalid when the file is grown and remapped. The
//! usual run-time mitigations (hazard pointers, epochs, reference counts) all
//! cost something on the read path. `MmapFile` instead leans on the borrow
//! checker:
//!
//! ```text
//! slice(&self)       -> &[u8]       // immutable borrow of self
//! slice_mut(&mut self) -> &mut [u8] // exclusive borrow
//! grow_to(&mut self)                // exclusive borrow
//! ```
//!
//! Since `grow_to` and `remap` require `&mut self`, no slice can be held
//! across a remap. Growth is chunked (`GROW_CHUNK`) so appending writers
//! remap rarely; the physical file may therefore be longer than the committed
//! database size, and the committed size always comes from the current
//! header, never from file metadata.
//!
//! ## Durability
//!
//! `flush_range` issues a ranged `msync`, blocking until the bytes are on
//! stable storage. Commit ordering (body before header) is the caller's
//! responsibility.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

/// Quantum for physical file growth. Appends extend the file to the next
/// multiple of this, so a burst of small commits remaps once, not per node.
pub const GROW_CHUNK: u64 = 64 * 1024;

#[derive(Debug)]
pub struct MmapFile {
    file: File,
    mmap: MmapMut,
    len: u64,
}

impl MmapFile {
    /// Creates a new file of `initial_len` bytes and maps it.
    ///
    /// Fails if the file already exists; the caller resolves creation races
    /// (the lifecycle layer holds the boundary file lock around creation).
    pub fn create<P: AsRef<Path>>(path: P, initial_len: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(initial_len > 0, "initial length must be nonzero");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;

        file.set_len(initial_len)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", initial_len))?;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally. This is safe because:
        // 1. We just created this file (create_new) under the boundary lock
        // 2. The file size is set before mapping
        // 3. The mmap lifetime is tied to MmapFile, preventing use-after-unmap
        // 4. All access goes through slice()/slice_mut() which bounds-check
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            len: initial_len,
        })
    }

    /// Maps an existing file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            len > 0,
            "cannot open empty database file '{}'",
            path.display()
        );

        // SAFETY: as in create(). Concurrent writers only ever store bytes
        // beyond the committed size or flip header slots; both are
        // single-writer operations serialized by the writer lock, and readers
        // never dereference beyond the committed size of their snapshot.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self { file, mmap, len })
    }

    /// Length of the current mapping (the physical file size at map time).
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current physical file length from metadata. May exceed `len()` if
    /// another process grew the file since this handle mapped it.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len())
    }

    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| eyre::eyre!("slice range overflows"))?;
        ensure!(
            end <= self.len,
            "slice [{}, {}) out of bounds (mapped={})",
            offset,
            end,
            self.len
        );
        Ok(&self.mmap[offset as usize..end as usize])
    }

    pub fn slice_mut(&mut self, offset: u64, len: u64) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| eyre::eyre!("slice range overflows"))?;
        ensure!(
            end <= self.len,
            "slice [{}, {}) out of bounds (mapped={})",
            offset,
            end,
            self.len
        );
        Ok(&mut self.mmap[offset as usize..end as usize])
    }

    /// Grows the physical file so at least `new_len` bytes are mapped,
    /// rounding up to the next `GROW_CHUNK` boundary, and remaps.
    pub fn grow_to(&mut self, new_len: u64) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }

        let rounded = new_len
            .checked_next_multiple_of(GROW_CHUNK)
            .ok_or_else(|| eyre::eyre!("file length overflows"))?;

        self.mmap
            .flush_async()
            .wrap_err("failed to flush mmap before grow")?;

        self.file
            .set_len(rounded)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", rounded))?;

        // SAFETY: grow_to requires &mut self, so no slices into the old
        // mapping can exist (borrow checker). The old mmap was flushed above
        // and is dropped when the new one is assigned; the file was extended
        // before remapping.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.len = rounded;

        Ok(())
    }

    /// Adopts the current physical file length, remapping if another process
    /// grew the file since this handle mapped it.
    pub fn remap(&mut self) -> Result<()> {
        let file_len = self.file_len()?;
        if file_len <= self.len {
            return Ok(());
        }

        // SAFETY: as in grow_to - &mut self proves no outstanding slices.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap database file")? };

        self.len = file_len;

        Ok(())
    }

    /// Durably persists the given byte range (ranged msync).
    pub fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| eyre::eyre!("flush range overflows"))?;
        ensure!(
            end <= self.len,
            "flush range [{}, {}) out of bounds (mapped={})",
            offset,
            end,
            self.len
        );
        self.mmap
            .flush_range(offset as usize, len as usize)
            .wrap_err("failed to sync mapped range to disk")
    }

    /// Durably persists the entire mapping.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mmap to disk")
    }

    /// Durably persists file metadata - in particular the file length, which
    /// `msync` alone does not cover after a `set_len`.
    pub fn sync_metadata(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err("failed to sync file metadata to disk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_maps_requested_length() {
        let dir = tempdir().unwrap();
        let mf = MmapFile::create(dir.path().join("t.tdb"), 4096).unwrap();
        assert_eq!(mf.len(), 4096);
        assert_eq!(mf.file_len().unwrap(), 4096);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tdb");
        let _first = MmapFile::create(&path, 4096).unwrap();
        assert!(MmapFile::create(&path, 4096).is_err());
    }

    #[test]
    fn writes_are_readable_through_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tdb");

        {
            let mut mf = MmapFile::create(&path, 4096).unwrap();
            mf.slice_mut(100, 4).unwrap().copy_from_slice(b"tide");
            mf.flush().unwrap();
        }

        let mf = MmapFile::open(&path).unwrap();
        assert_eq!(mf.slice(100, 4).unwrap(), b"tide");
    }

    #[test]
    fn slice_rejects_out_of_bounds() {
        let dir = tempdir().unwrap();
        let mf = MmapFile::create(dir.path().join("t.tdb"), 4096).unwrap();
        assert!(mf.slice(4090, 16).is_err());
        assert!(mf.slice(u64::MAX, 2).is_err());
    }

    #[test]
    fn grow_rounds_to_chunk() {
        let dir = tempdir().unwrap();
        let mut mf = MmapFile::create(dir.path().join("t.tdb"), 4096).unwrap();

        mf.grow_to(4097).unwrap();

        assert_eq!(mf.len(), GROW_CHUNK);
        assert!(mf.slice(GROW_CHUNK - 8, 8).is_ok());
    }

    #[test]
    fn remap_adopts_external_growth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tdb");
        let mut reader = MmapFile::create(&path, 4096).unwrap();

        {
            let mut writer = MmapFile::open(&path).unwrap();
            writer.grow_to(8192).unwrap();
            writer.slice_mut(5000, 3).unwrap().copy_from_slice(b"abc");
            writer.flush().unwrap();
        }

        assert!(reader.slice(5000, 3).is_err());
        reader.remap().unwrap();
        assert_eq!(reader.slice(5000, 3).unwrap(), b"abc");
    }
}
