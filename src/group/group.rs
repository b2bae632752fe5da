//! # The Group
//!
//! A `Group` is the root of the content tree: the ordered, named set of
//! tables reachable from one committed root node.
//!
//! ```text
//! Offset  Size  Description
//! 0       4     Table count
//! 4       ...   Entries: {name_len: u32, name, table_offset: u64}
//! ```
//!
//! A read transaction decodes the group from its pinned snapshot and hands
//! out immutable tables. A write transaction decodes the same way but
//! writable; at commit, `serialize` walks the tree bottom-up and rewrites
//! only what changed:
//!
//! - clean columns and tables keep their existing offsets (shared subtrees)
//! - every replaced node's extent is pushed onto the free list, tagged with
//!   the committing version
//! - new nodes go into reusable free extents first, the file tail otherwise

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::error::DbError;
use crate::storage::{
    encode_node, node_total_len, FreeExtent, Freelist, NodeKind, PayloadCursor, PersistentStore,
};

use super::column::{ColumnType, StoredNode};
use super::table::Table;

#[derive(Debug)]
pub struct Group {
    tables: Vec<(String, Table)>,
    by_name: HashMap<String, usize>,
    stored: Option<StoredNode>,
    dirty: bool,
    writable: bool,
}

impl Group {
    /// The framed node of a group with no tables - the initial committed
    /// state of every new database file.
    pub(crate) fn encode_empty_node() -> Vec<u8> {
        let mut out = Vec::new();
        encode_node(NodeKind::Group, &0u32.to_le_bytes(), &mut out);
        out
    }

    /// Decodes the group tree rooted at `root_offset`, reading nothing at or
    /// beyond `limit` (the snapshot's committed size).
    pub(crate) fn decode(
        store: &PersistentStore,
        root_offset: u64,
        limit: u64,
        writable: bool,
    ) -> Result<Self> {
        let (kind, payload) = store.node(root_offset, limit)?;
        ensure!(
            kind == NodeKind::Group,
            "expected group node at offset {}, found {:?}",
            root_offset,
            kind
        );
        let stored = StoredNode {
            offset: root_offset,
            len: node_total_len(payload.len()),
        };

        let mut cursor = PayloadCursor::new(payload);
        let count = cursor.u32()? as usize;

        let mut tables = Vec::with_capacity(count);
        let mut by_name = HashMap::with_capacity(count);
        for _ in 0..count {
            let name_len = cursor.u32()? as usize;
            let name = std::str::from_utf8(cursor.take(name_len)?)
                .map_err(|_| eyre::eyre!("table name holds invalid UTF-8"))?
                .to_owned();
            let table_offset = cursor.u64()?;

            let table = Table::decode(store, table_offset, limit, writable)?;
            by_name.insert(name.clone(), tables.len());
            tables.push((name, table));
        }

        Ok(Self {
            tables,
            by_name,
            stored: Some(stored),
            dirty: false,
            writable,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|(name, _)| name.as_str())
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.by_name.get(name).map(|&idx| &self.tables[idx].1)
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(DbError::TransactionMisuse("cannot mutate a read transaction's view").into())
        }
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.check_writable()?;
        match self.by_name.get(name) {
            Some(&idx) => Ok(&mut self.tables[idx].1),
            None => Err(DbError::TransactionMisuse("no such table in group").into()),
        }
    }

    /// Returns the named table, creating it with the given column layout if
    /// absent. An existing table must match the layout exactly.
    pub fn get_or_create_table(
        &mut self,
        name: &str,
        spec: &[(&str, ColumnType)],
    ) -> Result<&mut Table> {
        self.check_writable()?;

        if let Some(&idx) = self.by_name.get(name) {
            let table = &mut self.tables[idx].1;
            if !table.spec_matches(spec) {
                return Err(
                    DbError::TransactionMisuse("table exists with a different layout").into(),
                );
            }
            return Ok(table);
        }

        let idx = self.tables.len();
        self.tables.push((name.to_string(), Table::new_empty(spec)));
        self.by_name.insert(name.to_string(), idx);
        self.dirty = true;
        Ok(&mut self.tables[idx].1)
    }

    /// Whether anything in the tree needs rewriting.
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty || self.tables.iter().any(|(_, t)| t.dirty)
    }

    fn encode_group_node(&self, table_offsets: &[u64], out: &mut Vec<u8>) {
        debug_assert_eq!(table_offsets.len(), self.tables.len());

        let mut payload = Vec::new();
        payload.extend_from_slice(&(self.tables.len() as u32).to_le_bytes());
        for ((name, _), offset) in self.tables.iter().zip(table_offsets) {
            payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
            payload.extend_from_slice(name.as_bytes());
            payload.extend_from_slice(&offset.to_le_bytes());
        }

        encode_node(NodeKind::Group, &payload, out);
    }

    /// Writes every dirty node bottom-up and returns the new root offset.
    /// Replaced extents are pushed onto `freelist` tagged with `new_version`;
    /// placements reuse extents no snapshot older than `reclaim_before` can
    /// observe. Nothing is durable until the caller flushes and swaps the
    /// header.
    pub(crate) fn serialize(
        &mut self,
        store: &mut PersistentStore,
        freelist: &mut Freelist,
        new_version: u64,
        reclaim_before: u64,
    ) -> Result<u64> {
        let mut scratch = Vec::new();
        let mut table_offsets = Vec::with_capacity(self.tables.len());

        for (_, table) in &mut self.tables {
            let offset = match table.stored {
                Some(stored) if !table.dirty => stored.offset,
                _ => {
                    let mut col_offsets = Vec::with_capacity(table.column_count());
                    for col in table.columns_mut() {
                        let col_offset = match col.stored {
                            Some(stored) if !col.dirty => stored.offset,
                            _ => {
                                scratch.clear();
                                col.encode(&mut scratch);
                                if let Some(old) = col.stored.take() {
                                    freelist.push(FreeExtent {
                                        offset: old.offset,
                                        len: old.len,
                                        freed_version: new_version,
                                    });
                                }
                                let offset =
                                    place(store, freelist, reclaim_before, &scratch)?;
                                col.stored = Some(StoredNode {
                                    offset,
                                    len: scratch.len() as u64,
                                });
                                col.dirty = false;
                                offset
                            }
                        };
                        col_offsets.push(col_offset);
                    }

                    scratch.clear();
                    table.encode_node(&col_offsets, &mut scratch);
                    if let Some(old) = table.stored.take() {
                        freelist.push(FreeExtent {
                            offset: old.offset,
                            len: old.len,
                            freed_version: new_version,
                        });
                    }
                    let offset = place(store, freelist, reclaim_before, &scratch)?;
                    table.stored = Some(StoredNode {
                        offset,
                        len: scratch.len() as u64,
                    });
                    table.dirty = false;
                    offset
                }
            };
            table_offsets.push(offset);
        }

        scratch.clear();
        self.encode_group_node(&table_offsets, &mut scratch);
        if let Some(old) = self.stored.take() {
            freelist.push(FreeExtent {
                offset: old.offset,
                len: old.len,
                freed_version: new_version,
            });
        }
        let root_offset = place(store, freelist, reclaim_before, &scratch)?;
        self.stored = Some(StoredNode {
            offset: root_offset,
            len: scratch.len() as u64,
        });
        self.dirty = false;

        Ok(root_offset)
    }
}

fn place(
    store: &mut PersistentStore,
    freelist: &mut Freelist,
    reclaim_before: u64,
    bytes: &[u8],
) -> Result<u64> {
    if let Some(offset) = freelist.allocate(bytes.len() as u64, reclaim_before) {
        store.write_at(offset, bytes)?;
        Ok(offset)
    } else {
        store.append(bytes)
    }
}
