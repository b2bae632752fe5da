//! # Node Framing
//!
//! Every tree node in the body of a `.tdb` file is framed the same way: an
//! 8-byte header naming the node kind and payload length, then the payload,
//! padded so the next node starts on an 8-byte boundary.
//!
//! ```text
//! Offset  Size  Description
//! 0       1     Node kind
//! 1       3     Reserved
//! 4       4     Payload length in bytes
//! 8       N     Payload
//! 8+N     pad   Zero padding to the next 8-byte boundary
//! ```
//!
//! Fixed-width payload fields are little-endian. Variable payloads (the
//! group and table directories, string columns) are walked with
//! [`PayloadCursor`], which bounds-checks every read so a corrupt offset
//! surfaces as an error instead of a panic.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const NODE_HEADER_SIZE: usize = 8;
pub const NODE_ALIGN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Table,
    IntColumn,
    BoolColumn,
    StringColumn,
    Freelist,
}

impl NodeKind {
    pub fn as_u8(self) -> u8 {
        match self {
            NodeKind::Group => 1,
            NodeKind::Table => 2,
            NodeKind::IntColumn => 3,
            NodeKind::BoolColumn => 4,
            NodeKind::StringColumn => 5,
            NodeKind::Freelist => 6,
        }
    }

    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => NodeKind::Group,
            2 => NodeKind::Table,
            3 => NodeKind::IntColumn,
            4 => NodeKind::BoolColumn,
            5 => NodeKind::StringColumn,
            6 => NodeKind::Freelist,
            other => bail!("unknown node kind {}", other),
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    kind: u8,
    reserved: [u8; 3],
    payload_len: U32,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

pub fn align_up(n: u64) -> u64 {
    (n + (NODE_ALIGN - 1)) & !(NODE_ALIGN - 1)
}

/// Total on-disk footprint of a node with the given payload length.
pub fn node_total_len(payload_len: usize) -> u64 {
    align_up((NODE_HEADER_SIZE + payload_len) as u64)
}

/// Appends a complete framed node (header, payload, padding) to `out`.
pub fn encode_node(kind: NodeKind, payload: &[u8], out: &mut Vec<u8>) {
    let header = NodeHeader {
        kind: kind.as_u8(),
        reserved: [0u8; 3],
        payload_len: U32::new(payload.len() as u32),
    };
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);

    let total = node_total_len(payload.len());
    let padding = total as usize - NODE_HEADER_SIZE - payload.len();
    out.extend_from_slice(&[0u8; 8][..padding]);
}

/// Decodes the node at the start of `bytes`, returning its kind and payload.
pub fn decode_node(bytes: &[u8]) -> Result<(NodeKind, &[u8])> {
    ensure!(
        bytes.len() >= NODE_HEADER_SIZE,
        "truncated node: {} bytes",
        bytes.len()
    );

    let header = NodeHeader::ref_from_bytes(&bytes[..NODE_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to parse NodeHeader: {:?}", e))?;

    let kind = NodeKind::from_u8(header.kind)?;
    let payload_len = header.payload_len.get() as usize;

    ensure!(
        bytes.len() >= NODE_HEADER_SIZE + payload_len,
        "node payload extends past readable bytes: {} + {} > {}",
        NODE_HEADER_SIZE,
        payload_len,
        bytes.len()
    );

    Ok((kind, &bytes[NODE_HEADER_SIZE..NODE_HEADER_SIZE + payload_len]))
}

/// Bounds-checked reader over a node payload.
pub struct PayloadCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            self.remaining() >= len,
            "payload truncated: wanted {} bytes, {} remain",
            len,
            self.remaining()
        );
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().expect("4-byte slice")))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        Ok(u64::from_le_bytes(raw.try_into().expect("8-byte slice")))
    }

    pub fn i64(&mut self) -> Result<i64> {
        let raw = self.take(8)?;
        Ok(i64::from_le_bytes(raw.try_into().expect("8-byte slice")))
    }
}
