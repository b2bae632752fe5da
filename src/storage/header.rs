//! # File Prefix and Header Slots
//!
//! This module defines the fixed region at the start of a `.tdb` file: a
//! 64-byte prefix identifying the format, followed by two alternating 64-byte
//! header slots.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Description
//! 0       16    Magic: "TideDB format 1\0"
//! 16      4     Format version
//! 20      4     Flags (reserved)
//! 24      40    Reserved
//! 64      64    Header slot A
//! 128     64    Header slot B
//! ```
//!
//! ### Header slot
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Commit version (strictly increasing, 0 = slot never written)
//! 8       8     Root node offset
//! 16      8     Committed file size
//! 24      8     Freelist node offset (0 = empty)
//! 32      8     CRC-64/XZ over the 32 bytes above
//! 40      24    Reserved
//! ```
//!
//! ## Crash-Atomic Publication
//!
//! The *current* header is the slot with a valid checksum and the higher
//! version. A commit writes the complete new slot into the *other* position
//! and flushes it. If the process dies mid-write, that slot's checksum does
//! not match and the previous header remains current; there is no separate
//! selector word whose update could be torn.
//!
//! ## Endianness
//!
//! All multi-byte fields are little-endian via zerocopy's `U32`/`U64` types,
//! fixed per build.

use crc::{Crc, CRC_64_XZ};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::DbError;

pub const DB_MAGIC: &[u8; 16] = b"TideDB format 1\0";
pub const FORMAT_VERSION: u32 = 1;

pub const FILE_PREFIX_SIZE: usize = 64;
pub const HEADER_SLOT_SIZE: usize = 64;
pub const HEADER_SLOT_OFFSETS: [u64; 2] = [64, 128];

/// First byte of the node heap.
pub const BODY_START: u64 = 192;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Bytes of a header slot covered by its checksum.
const CHECKSUMMED_LEN: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FilePrefix {
    magic: [u8; 16],
    format: U32,
    flags: U32,
    reserved: [u8; 40],
}

const _: () = assert!(std::mem::size_of::<FilePrefix>() == FILE_PREFIX_SIZE);

impl FilePrefix {
    pub fn new() -> Self {
        Self {
            magic: *DB_MAGIC,
            format: U32::new(FORMAT_VERSION),
            flags: U32::new(0),
            reserved: [0u8; 40],
        }
    }

    /// Parses and validates the prefix of an existing file.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_PREFIX_SIZE,
            "buffer too small for FilePrefix: {} < {}",
            bytes.len(),
            FILE_PREFIX_SIZE
        );

        let prefix = Self::ref_from_bytes(&bytes[..FILE_PREFIX_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FilePrefix: {:?}", e))?;

        if &prefix.magic != DB_MAGIC {
            return Err(DbError::OpenFailed("not a TideDB database file".into()).into());
        }

        if prefix.format.get() != FORMAT_VERSION {
            return Err(DbError::Unsupported {
                found: prefix.format.get(),
                expected: FORMAT_VERSION,
            }
            .into());
        }

        Ok(prefix)
    }

    pub fn format(&self) -> u32 {
        self.format.get()
    }
}

impl Default for FilePrefix {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HeaderSlot {
    version: U64,
    root_offset: U64,
    file_size: U64,
    freelist_offset: U64,
    checksum: U64,
    reserved: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<HeaderSlot>() == HEADER_SLOT_SIZE);

impl HeaderSlot {
    pub fn new(version: u64, root_offset: u64, file_size: u64, freelist_offset: u64) -> Self {
        let mut slot = Self {
            version: U64::new(version),
            root_offset: U64::new(root_offset),
            file_size: U64::new(file_size),
            freelist_offset: U64::new(freelist_offset),
            checksum: U64::new(0),
            reserved: [0u8; 24],
        };
        slot.checksum = U64::new(slot.compute_checksum());
        slot
    }

    /// A slot that has never been written; always invalid.
    pub fn empty() -> Self {
        Self {
            version: U64::new(0),
            root_offset: U64::new(0),
            file_size: U64::new(0),
            freelist_offset: U64::new(0),
            checksum: U64::new(0),
            reserved: [0u8; 24],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= HEADER_SLOT_SIZE,
            "buffer too small for HeaderSlot: {} < {}",
            bytes.len(),
            HEADER_SLOT_SIZE
        );

        Self::ref_from_bytes(&bytes[..HEADER_SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse HeaderSlot: {:?}", e))
    }

    fn compute_checksum(&self) -> u64 {
        CRC64.checksum(&self.as_bytes()[..CHECKSUMMED_LEN])
    }

    /// A slot is valid when it has been written at least once (version > 0)
    /// and its checksum matches. A torn write fails the checksum.
    pub fn is_valid(&self) -> bool {
        self.version.get() > 0 && self.checksum.get() == self.compute_checksum()
    }

    pub fn version(&self) -> u64 {
        self.version.get()
    }

    pub fn root_offset(&self) -> u64 {
        self.root_offset.get()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size.get()
    }

    pub fn freelist_offset(&self) -> u64 {
        self.freelist_offset.get()
    }
}

/// Picks the current header: valid checksum, higher version. Returns the slot
/// index (0 or 1), or `CorruptHeader` if neither slot is usable.
pub fn select_current(a: &HeaderSlot, b: &HeaderSlot) -> Result<usize> {
    match (a.is_valid(), b.is_valid()) {
        (true, true) => Ok(if a.version() >= b.version() { 0 } else { 1 }),
        (true, false) => Ok(0),
        (false, true) => Ok(1),
        (false, false) => Err(DbError::CorruptHeader.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_size_is_64() {
        assert_eq!(std::mem::size_of::<FilePrefix>(), 64);
    }

    #[test]
    fn slot_size_is_64() {
        assert_eq!(std::mem::size_of::<HeaderSlot>(), 64);
    }

    #[test]
    fn prefix_roundtrip() {
        let prefix = FilePrefix::new();
        let parsed = FilePrefix::from_bytes(prefix.as_bytes()).unwrap();
        assert_eq!(parsed.format(), FORMAT_VERSION);
    }

    #[test]
    fn prefix_rejects_foreign_magic() {
        let mut bytes = [0u8; 64];
        bytes[..16].copy_from_slice(b"SomeOtherFormat\0");

        let err = FilePrefix::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::OpenFailed(_))
        ));
    }

    #[test]
    fn prefix_rejects_future_format() {
        let mut prefix = FilePrefix::new();
        prefix.format = U32::new(FORMAT_VERSION + 7);

        let err = FilePrefix::from_bytes(prefix.as_bytes()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Unsupported { .. })
        ));
    }

    #[test]
    fn slot_roundtrip_preserves_fields() {
        let slot = HeaderSlot::new(7, 192, 4096, 0);
        let parsed = HeaderSlot::from_bytes(slot.as_bytes()).unwrap();

        assert!(parsed.is_valid());
        assert_eq!(parsed.version(), 7);
        assert_eq!(parsed.root_offset(), 192);
        assert_eq!(parsed.file_size(), 4096);
        assert_eq!(parsed.freelist_offset(), 0);
    }

    #[test]
    fn empty_slot_is_invalid() {
        assert!(!HeaderSlot::empty().is_valid());
    }

    #[test]
    fn torn_slot_fails_checksum() {
        let slot = HeaderSlot::new(7, 192, 4096, 0);
        let mut bytes = [0u8; HEADER_SLOT_SIZE];
        bytes.copy_from_slice(slot.as_bytes());
        bytes[8] ^= 0xff;

        let parsed = HeaderSlot::from_bytes(&bytes).unwrap();
        assert!(!parsed.is_valid());
    }

    #[test]
    fn select_prefers_higher_version() {
        let a = HeaderSlot::new(3, 192, 1024, 0);
        let b = HeaderSlot::new(4, 320, 2048, 0);

        assert_eq!(select_current(&a, &b).unwrap(), 1);
        assert_eq!(select_current(&b, &a).unwrap(), 0);
    }

    #[test]
    fn select_falls_back_to_surviving_slot() {
        let good = HeaderSlot::new(3, 192, 1024, 0);
        let torn = {
            let slot = HeaderSlot::new(4, 320, 2048, 0);
            let mut bytes = [0u8; HEADER_SLOT_SIZE];
            bytes.copy_from_slice(slot.as_bytes());
            bytes[0] ^= 0xff;
            *HeaderSlot::from_bytes(&bytes).unwrap()
        };

        assert_eq!(select_current(&good, &torn).unwrap(), 0);
        assert_eq!(select_current(&torn, &good).unwrap(), 1);
    }

    #[test]
    fn select_reports_corrupt_when_both_invalid() {
        let err = select_current(&HeaderSlot::empty(), &HeaderSlot::empty()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::CorruptHeader)
        ));
    }
}
