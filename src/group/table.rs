//! # Tables
//!
//! A table is a declared sequence of named, typed columns plus the rows
//! stored in them. The table node is a directory:
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Row count
//! 8       4     Column count
//! 12      ...   Entries: {type: u8, name_len: u32, name, column_offset: u64}
//! ```
//!
//! Rows are materialized column-wise; `add_row` pushes one value onto every
//! column. Cell access through a read view never allocates beyond the decoded
//! data; mutation through a read view is refused.

use eyre::{ensure, Result};

use crate::error::DbError;
use crate::storage::{encode_node, NodeKind, PayloadCursor, PersistentStore};

use super::column::{Column, ColumnType, StoredNode, Value};

#[derive(Debug)]
pub struct Table {
    spec: Vec<(String, ColumnType)>,
    columns: Vec<Column>,
    pub(crate) stored: Option<StoredNode>,
    pub(crate) dirty: bool,
    pub(crate) writable: bool,
}

impl Table {
    pub(crate) fn new_empty(spec: &[(&str, ColumnType)]) -> Self {
        Self {
            spec: spec.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
            columns: spec.iter().map(|(_, t)| Column::new_empty(*t)).collect(),
            stored: None,
            dirty: true,
            writable: true,
        }
    }

    pub(crate) fn decode(
        store: &PersistentStore,
        offset: u64,
        limit: u64,
        writable: bool,
    ) -> Result<Self> {
        let (kind, payload) = store.node(offset, limit)?;
        ensure!(
            kind == NodeKind::Table,
            "expected table node at offset {}, found {:?}",
            offset,
            kind
        );
        let stored = StoredNode {
            offset,
            len: crate::storage::node_total_len(payload.len()),
        };

        let mut cursor = PayloadCursor::new(payload);
        let row_count = cursor.u64()? as usize;
        let column_count = cursor.u32()? as usize;

        let mut spec = Vec::with_capacity(column_count);
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let ty = ColumnType::from_u8(cursor.take(1)?[0])?;
            let name_len = cursor.u32()? as usize;
            let name = std::str::from_utf8(cursor.take(name_len)?)
                .map_err(|_| eyre::eyre!("column name holds invalid UTF-8"))?
                .to_owned();
            let col_offset = cursor.u64()?;

            let (col_kind, col_payload) = store.node(col_offset, limit)?;
            let col_stored = StoredNode {
                offset: col_offset,
                len: crate::storage::node_total_len(col_payload.len()),
            };
            let column = Column::decode(col_kind, col_payload, col_stored)?;

            ensure!(
                column.ty() == ty && column.len() == row_count,
                "column '{}' does not match its table directory entry",
                name
            );

            spec.push((name, ty));
            columns.push(column);
        }

        Ok(Self {
            spec,
            columns,
            stored: Some(stored),
            dirty: false,
            writable,
        })
    }

    /// Encodes the table directory node given the final column offsets.
    pub(crate) fn encode_node(&self, col_offsets: &[u64], out: &mut Vec<u8>) {
        debug_assert_eq!(col_offsets.len(), self.columns.len());

        let mut payload = Vec::new();
        payload.extend_from_slice(&(self.row_count() as u64).to_le_bytes());
        payload.extend_from_slice(&(self.columns.len() as u32).to_le_bytes());
        for ((name, ty), offset) in self.spec.iter().zip(col_offsets) {
            payload.push(ty.as_u8());
            payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
            payload.extend_from_slice(name.as_bytes());
            payload.extend_from_slice(&offset.to_le_bytes());
        }

        encode_node(NodeKind::Table, &payload, out);
    }

    pub(crate) fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    pub(crate) fn spec_matches(&self, spec: &[(&str, ColumnType)]) -> bool {
        self.spec.len() == spec.len()
            && self
                .spec
                .iter()
                .zip(spec)
                .all(|((name, ty), (n, t))| name == n && ty == t)
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn column_count(&self) -> usize {
        self.spec.len()
    }

    pub fn column_name(&self, col: usize) -> &str {
        &self.spec[col].0
    }

    pub fn column_type(&self, col: usize) -> ColumnType {
        self.spec[col].1
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(DbError::TransactionMisuse("cannot mutate a read transaction's view").into())
        }
    }

    fn check_cell(&self, row: usize, col: usize) -> Result<()> {
        if col >= self.columns.len() {
            return Err(DbError::TransactionMisuse("column index out of bounds").into());
        }
        if row >= self.row_count() {
            return Err(DbError::TransactionMisuse("row index out of bounds").into());
        }
        Ok(())
    }

    /// Appends one row; `values` must match the declared columns in arity and
    /// type.
    pub fn add_row(&mut self, values: &[Value]) -> Result<()> {
        self.check_writable()?;
        if values.len() != self.columns.len() {
            return Err(DbError::TransactionMisuse("row arity does not match table").into());
        }

        for (col, value) in self.columns.iter_mut().zip(values) {
            col.push(value.clone())?;
        }
        self.dirty = true;
        Ok(())
    }

    pub fn get(&self, row: usize, col: usize) -> Result<Value> {
        self.check_cell(row, col)?;
        Ok(self.columns[col].value(row))
    }

    pub fn set(&mut self, row: usize, col: usize, value: Value) -> Result<()> {
        self.check_writable()?;
        self.check_cell(row, col)?;
        self.columns[col].set(row, value)?;
        self.dirty = true;
        Ok(())
    }

    pub fn get_int(&self, row: usize, col: usize) -> Result<i64> {
        self.check_cell(row, col)?;
        self.columns[col].int(row)
    }

    pub fn get_bool(&self, row: usize, col: usize) -> Result<bool> {
        self.check_cell(row, col)?;
        self.columns[col].bool(row)
    }

    pub fn get_string(&self, row: usize, col: usize) -> Result<&str> {
        self.check_cell(row, col)?;
        self.columns[col].string(row)
    }

    pub fn set_int(&mut self, row: usize, col: usize, value: i64) -> Result<()> {
        self.set(row, col, Value::Int(value))
    }

    /// Adds `delta` to an Int cell; the increment workload primitive.
    pub fn add_int(&mut self, row: usize, col: usize, delta: i64) -> Result<()> {
        self.check_writable()?;
        self.check_cell(row, col)?;
        self.columns[col].add_int(row, delta)?;
        self.dirty = true;
        Ok(())
    }

    /// Values of one row in column order.
    pub fn row(&self, row: usize) -> Result<Vec<Value>> {
        ensure!(
            row < self.row_count(),
            "row {} out of bounds ({} rows)",
            row,
            self.row_count()
        );
        Ok(self.columns.iter().map(|c| c.value(row)).collect())
    }
}
