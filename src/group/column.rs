//! # Typed Columns
//!
//! Columns are the leaves of the group tree. Each column node holds every
//! value of one column, in row order:
//!
//! ```text
//! IntColumn     count: u64, values: i64 * count
//! BoolColumn    count: u64, bits packed LSB-first, ceil(count / 8) bytes
//! StringColumn  count: u64, end offsets: u32 * count, UTF-8 blob
//! ```
//!
//! A decoded `Column` owns its values. Mutation marks it dirty; commit
//! re-encodes only dirty columns and leaves clean ones at their existing
//! offsets.

use eyre::{ensure, Result};

use crate::error::DbError;
use crate::storage::{encode_node, NodeKind, PayloadCursor};

/// Declared type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Bool,
    String,
}

impl ColumnType {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ColumnType::Int => 0,
            ColumnType::Bool => 1,
            ColumnType::String => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => ColumnType::Int,
            1 => ColumnType::Bool,
            2 => ColumnType::String,
            other => eyre::bail!("unknown column type {}", other),
        })
    }
}

/// One cell value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    String(String),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Int(_) => ColumnType::Int,
            Value::Bool(_) => ColumnType::Bool,
            Value::String(_) => ColumnType::String,
        }
    }
}

/// Where a committed node lives on disk, including its framed length, so the
/// extent can be returned to the free list when the node is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoredNode {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug)]
pub(crate) enum ColumnData {
    Int(Vec<i64>),
    Bool(Vec<bool>),
    String(Vec<String>),
}

#[derive(Debug)]
pub(crate) struct Column {
    data: ColumnData,
    pub(crate) stored: Option<StoredNode>,
    pub(crate) dirty: bool,
}

impl Column {
    pub fn new_empty(ty: ColumnType) -> Self {
        let data = match ty {
            ColumnType::Int => ColumnData::Int(Vec::new()),
            ColumnType::Bool => ColumnData::Bool(Vec::new()),
            ColumnType::String => ColumnData::String(Vec::new()),
        };
        Self {
            data,
            stored: None,
            dirty: true,
        }
    }

    pub fn ty(&self) -> ColumnType {
        match self.data {
            ColumnData::Int(_) => ColumnType::Int,
            ColumnData::Bool(_) => ColumnType::Bool,
            ColumnData::String(_) => ColumnType::String,
        }
    }

    pub fn len(&self) -> usize {
        match &self.data {
            ColumnData::Int(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::String(v) => v.len(),
        }
    }

    pub fn decode(kind: NodeKind, payload: &[u8], stored: StoredNode) -> Result<Self> {
        let mut cursor = PayloadCursor::new(payload);
        let count = cursor.u64()? as usize;

        let data = match kind {
            NodeKind::IntColumn => {
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(cursor.i64()?);
                }
                ColumnData::Int(values)
            }
            NodeKind::BoolColumn => {
                let bytes = cursor.take(count.div_ceil(8))?;
                let mut values = Vec::with_capacity(count);
                for row in 0..count {
                    values.push(bytes[row / 8] >> (row % 8) & 1 == 1);
                }
                ColumnData::Bool(values)
            }
            NodeKind::StringColumn => {
                let mut ends = Vec::with_capacity(count);
                for _ in 0..count {
                    ends.push(cursor.u32()? as usize);
                }
                let blob = cursor.take(ends.last().copied().unwrap_or(0))?;

                let mut values = Vec::with_capacity(count);
                let mut start = 0usize;
                for end in ends {
                    ensure!(end >= start, "string column offsets not monotonic");
                    let raw = blob
                        .get(start..end)
                        .ok_or_else(|| eyre::eyre!("string column blob truncated"))?;
                    values.push(
                        std::str::from_utf8(raw)
                            .map_err(|_| eyre::eyre!("string column holds invalid UTF-8"))?
                            .to_owned(),
                    );
                    start = end;
                }
                ColumnData::String(values)
            }
            other => eyre::bail!("expected a column node, found {:?}", other),
        };

        Ok(Self {
            data,
            stored: Some(stored),
            dirty: false,
        })
    }

    /// Encodes the column as a complete framed node.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(self.len() as u64).to_le_bytes());

        let kind = match &self.data {
            ColumnData::Int(values) => {
                for v in values {
                    payload.extend_from_slice(&v.to_le_bytes());
                }
                NodeKind::IntColumn
            }
            ColumnData::Bool(values) => {
                let mut bytes = vec![0u8; values.len().div_ceil(8)];
                for (row, v) in values.iter().enumerate() {
                    if *v {
                        bytes[row / 8] |= 1 << (row % 8);
                    }
                }
                payload.extend_from_slice(&bytes);
                NodeKind::BoolColumn
            }
            ColumnData::String(values) => {
                let mut end = 0u32;
                for v in values {
                    end += v.len() as u32;
                    payload.extend_from_slice(&end.to_le_bytes());
                }
                for v in values {
                    payload.extend_from_slice(v.as_bytes());
                }
                NodeKind::StringColumn
            }
        };

        encode_node(kind, &payload, out);
    }

    pub fn value(&self, row: usize) -> Value {
        match &self.data {
            ColumnData::Int(v) => Value::Int(v[row]),
            ColumnData::Bool(v) => Value::Bool(v[row]),
            ColumnData::String(v) => Value::String(v[row].clone()),
        }
    }

    pub fn int(&self, row: usize) -> Result<i64> {
        match &self.data {
            ColumnData::Int(v) => Ok(v[row]),
            _ => Err(DbError::TransactionMisuse("column is not an Int column").into()),
        }
    }

    pub fn bool(&self, row: usize) -> Result<bool> {
        match &self.data {
            ColumnData::Bool(v) => Ok(v[row]),
            _ => Err(DbError::TransactionMisuse("column is not a Bool column").into()),
        }
    }

    pub fn string(&self, row: usize) -> Result<&str> {
        match &self.data {
            ColumnData::String(v) => Ok(&v[row]),
            _ => Err(DbError::TransactionMisuse("column is not a String column").into()),
        }
    }

    pub fn set(&mut self, row: usize, value: Value) -> Result<()> {
        match (&mut self.data, value) {
            (ColumnData::Int(v), Value::Int(x)) => v[row] = x,
            (ColumnData::Bool(v), Value::Bool(x)) => v[row] = x,
            (ColumnData::String(v), Value::String(x)) => v[row] = x,
            _ => return Err(DbError::TransactionMisuse("value type does not match column").into()),
        }
        self.dirty = true;
        Ok(())
    }

    pub fn push(&mut self, value: Value) -> Result<()> {
        match (&mut self.data, value) {
            (ColumnData::Int(v), Value::Int(x)) => v.push(x),
            (ColumnData::Bool(v), Value::Bool(x)) => v.push(x),
            (ColumnData::String(v), Value::String(x)) => v.push(x),
            _ => return Err(DbError::TransactionMisuse("value type does not match column").into()),
        }
        self.dirty = true;
        Ok(())
    }

    pub fn add_int(&mut self, row: usize, delta: i64) -> Result<()> {
        match &mut self.data {
            ColumnData::Int(v) => {
                v[row] += delta;
                self.dirty = true;
                Ok(())
            }
            _ => Err(DbError::TransactionMisuse("column is not an Int column").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::decode_node;

    fn roundtrip(col: &Column) -> Column {
        let mut out = Vec::new();
        col.encode(&mut out);
        let (kind, payload) = decode_node(&out).unwrap();
        Column::decode(
            kind,
            payload,
            StoredNode {
                offset: 192,
                len: out.len() as u64,
            },
        )
        .unwrap()
    }

    #[test]
    fn int_column_roundtrip() {
        let mut col = Column::new_empty(ColumnType::Int);
        for v in [0, -1, i64::MAX, i64::MIN, 42] {
            col.push(Value::Int(v)).unwrap();
        }

        let back = roundtrip(&col);
        assert_eq!(back.len(), 5);
        assert_eq!(back.int(2).unwrap(), i64::MAX);
        assert_eq!(back.int(3).unwrap(), i64::MIN);
        assert!(!back.dirty);
    }

    #[test]
    fn bool_column_packs_bits() {
        let mut col = Column::new_empty(ColumnType::Bool);
        for row in 0..11 {
            col.push(Value::Bool(row % 3 == 0)).unwrap();
        }

        let back = roundtrip(&col);
        assert_eq!(back.len(), 11);
        for row in 0..11 {
            assert_eq!(back.bool(row).unwrap(), row % 3 == 0, "row {}", row);
        }
    }

    #[test]
    fn string_column_roundtrip() {
        let mut col = Column::new_empty(ColumnType::String);
        for s in ["test", "", "even more test", "naïve"] {
            col.push(Value::String(s.into())).unwrap();
        }

        let back = roundtrip(&col);
        assert_eq!(back.string(0).unwrap(), "test");
        assert_eq!(back.string(1).unwrap(), "");
        assert_eq!(back.string(3).unwrap(), "naïve");
    }

    #[test]
    fn type_mismatch_is_misuse() {
        let mut col = Column::new_empty(ColumnType::Int);
        let err = col.push(Value::Bool(true)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::TransactionMisuse(_))
        ));
    }

    #[test]
    fn mutation_marks_dirty() {
        let mut col = Column::new_empty(ColumnType::Int);
        col.push(Value::Int(1)).unwrap();

        let mut back = roundtrip(&col);
        assert!(!back.dirty);
        back.set(0, Value::Int(2)).unwrap();
        assert!(back.dirty);
    }
}
