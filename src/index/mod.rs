//! # Integer Value Index
//!
//! This module implements a B-tree index mapping `i64` values to row indices,
//! built over an `Int` column of a [`Table`](crate::group::Table). The index
//! is a client of the storage primitive's data, not of the transactional
//! core: it is built inside a transaction from a table view and maintained by
//! the caller alongside row operations.
//!
//! ## Structure
//!
//! Keys are `(value, row)` pairs ordered lexicographically, so duplicate
//! values sort by row and `find` returns the lowest matching row. Leaves hold
//! keys; interior nodes hold separator keys and children:
//!
//! ```text
//!                [ Interior ]
//!                /     |     \
//!        [ Leaf ]  [ Leaf ]  [ Leaf ]
//! ```
//!
//! ## Insert Algorithm
//!
//! ```text
//! 1. Descend to the leaf that owns the key
//! 2. Insert at the sorted position
//! 3. If the leaf overflows: split at the midpoint, hand the split key up
//! 4. Propagate splits; a root split grows the tree by one level
//! ```
//!
//! Deletion removes the key without rebalancing. Underflow handling adds
//! complexity with marginal benefit at this fan-out; an emptied subtree is
//! simply skipped by search.
//!
//! ## Row Maintenance
//!
//! Inserting or deleting a row in the middle of a column shifts every later
//! row index by one. `insert`/`remove` take `is_last` exactly like the row
//! operations they mirror, and apply the shift to stored keys before or after
//! the key change.

use eyre::Result;

use crate::group::Table;

/// Keys per node before a split. With 16-byte keys a full node stays inside
/// a couple of cache lines.
const MAX_KEYS: usize = 32;

type Key = (i64, usize);

#[derive(Debug)]
enum Node {
    Leaf { keys: Vec<Key> },
    Interior { seps: Vec<Key>, children: Vec<Node> },
}

impl Node {
    fn empty_leaf() -> Self {
        Node::Leaf { keys: Vec::new() }
    }

    /// Inserts `key`, returning the split key and new right sibling when this
    /// node overflowed.
    fn insert(&mut self, key: Key) -> Option<(Key, Node)> {
        match self {
            Node::Leaf { keys } => {
                let pos = keys.partition_point(|k| *k < key);
                keys.insert(pos, key);

                if keys.len() <= MAX_KEYS {
                    return None;
                }

                let right: Vec<Key> = keys.split_off(keys.len() / 2);
                let sep = right[0];
                Some((sep, Node::Leaf { keys: right }))
            }
            Node::Interior { seps, children } => {
                let slot = seps.partition_point(|s| *s <= key);
                if let Some((sep, right)) = children[slot].insert(key) {
                    seps.insert(slot, sep);
                    children.insert(slot + 1, right);
                }

                if children.len() <= MAX_KEYS {
                    return None;
                }

                let mid = seps.len() / 2;
                let up = seps[mid];
                let right_seps: Vec<Key> = seps.split_off(mid + 1);
                seps.pop();
                let right_children: Vec<Node> = children.split_off(mid + 1);
                Some((
                    up,
                    Node::Interior {
                        seps: right_seps,
                        children: right_children,
                    },
                ))
            }
        }
    }

    fn remove(&mut self, key: Key) -> bool {
        match self {
            Node::Leaf { keys } => {
                let pos = keys.partition_point(|k| *k < key);
                if keys.get(pos) == Some(&key) {
                    keys.remove(pos);
                    true
                } else {
                    false
                }
            }
            Node::Interior { seps, children } => {
                let slot = seps.partition_point(|s| *s <= key);
                children[slot].remove(key)
            }
        }
    }

    /// Lowest row holding `value`, if any.
    fn find(&self, value: i64) -> Option<usize> {
        let probe = (value, 0usize);
        match self {
            Node::Leaf { keys } => {
                let pos = keys.partition_point(|k| *k < probe);
                match keys.get(pos) {
                    Some(&(v, row)) if v == value => Some(row),
                    _ => None,
                }
            }
            Node::Interior { seps, children } => {
                let mut slot = seps.partition_point(|s| *s < probe);
                // A separator equal to the probe means the match could start
                // in either subtree; search left first.
                loop {
                    if let Some(row) = children[slot].find(value) {
                        return Some(row);
                    }
                    match seps.get(slot) {
                        Some(&(v, _)) if v == value => slot += 1,
                        _ => return None,
                    }
                }
            }
        }
    }

    /// Shifts every stored row index at or beyond `pos` by `diff`.
    fn update_refs(&mut self, pos: usize, diff: isize) {
        match self {
            Node::Leaf { keys } => {
                for key in keys {
                    if key.1 >= pos {
                        key.1 = key.1.wrapping_add_signed(diff);
                    }
                }
            }
            Node::Interior { seps, children } => {
                for sep in seps {
                    if sep.1 >= pos {
                        sep.1 = sep.1.wrapping_add_signed(diff);
                    }
                }
                for child in children {
                    child.update_refs(pos, diff);
                }
            }
        }
    }

    fn key_count(&self) -> usize {
        match self {
            Node::Leaf { keys } => keys.len(),
            Node::Interior { children, .. } => children.iter().map(Node::key_count).sum(),
        }
    }

    fn verify(&self, lower: Option<Key>, upper: Option<Key>) {
        let in_bounds = |k: &Key| {
            lower.map_or(true, |lo| *k >= lo) && upper.map_or(true, |hi| *k < hi)
        };
        match self {
            Node::Leaf { keys } => {
                assert!(keys.windows(2).all(|w| w[0] < w[1]), "leaf keys unsorted");
                assert!(keys.iter().all(in_bounds), "leaf key outside bounds");
            }
            Node::Interior { seps, children } => {
                assert_eq!(children.len(), seps.len() + 1);
                assert!(seps.windows(2).all(|w| w[0] < w[1]), "separators unsorted");
                assert!(seps.iter().all(in_bounds), "separator outside bounds");
                for (i, child) in children.iter().enumerate() {
                    let lo = if i == 0 { lower } else { Some(seps[i - 1]) };
                    let hi = if i == seps.len() { upper } else { Some(seps[i]) };
                    child.verify(lo, hi);
                }
            }
        }
    }
}

/// B-tree index over the `i64` values of one table column.
#[derive(Debug)]
pub struct Index {
    root: Node,
    len: usize,
}

impl Index {
    pub fn new() -> Self {
        Self {
            root: Node::empty_leaf(),
            len: 0,
        }
    }

    /// Builds an index over an `Int` column of `table`.
    pub fn build(table: &Table, col: usize) -> Result<Self> {
        let mut index = Self::new();
        for row in 0..table.row_count() {
            index.insert(row, table.get_int(row, col)?, true);
        }
        Ok(index)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Records that `value` was inserted at `row`. When the row was spliced
    /// into the middle of the column (`is_last == false`), later rows shift
    /// up by one first.
    pub fn insert(&mut self, row: usize, value: i64, is_last: bool) {
        if !is_last {
            self.root.update_refs(row, 1);
        }

        if let Some((sep, right)) = self.root.insert((value, row)) {
            let old_root = std::mem::replace(&mut self.root, Node::empty_leaf());
            self.root = Node::Interior {
                seps: vec![sep],
                children: vec![old_root, right],
            };
        }
        self.len += 1;
    }

    /// Records that the row holding `value` at `row` was deleted. When the
    /// deletion was from the middle of the column, later rows shift down.
    pub fn remove(&mut self, row: usize, value: i64, is_last: bool) {
        if self.root.remove((value, row)) {
            self.len -= 1;
        }
        if !is_last {
            self.root.update_refs(row + 1, -1);
        }
    }

    /// Records an in-place overwrite of `row` from `old` to `new`.
    pub fn set(&mut self, row: usize, old: i64, new: i64) {
        self.remove(row, old, true);
        self.insert(row, new, true);
    }

    /// Lowest row whose value equals `value`.
    pub fn find(&self, value: i64) -> Option<usize> {
        self.root.find(value)
    }

    /// Structural self-check: panics when ordering, balance bounds, or the
    /// key count are violated.
    pub fn verify(&self) {
        self.root.verify(None, None);
        assert_eq!(self.root.key_count(), self.len, "key count mismatch");
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{ColumnType, Value};

    fn int_table(values: &[i64]) -> Table {
        let mut table = Table::new_empty(&[("v", ColumnType::Int)]);
        for v in values {
            table.add_row(&[Value::Int(*v)]).unwrap();
        }
        table
    }

    #[test]
    fn build_and_find() {
        let table = int_table(&[30, 10, 20, 10]);
        let index = Index::build(&table, 0).unwrap();

        assert_eq!(index.len(), 4);
        assert_eq!(index.find(10), Some(1), "duplicates find the lowest row");
        assert_eq!(index.find(20), Some(2));
        assert_eq!(index.find(30), Some(0));
        assert_eq!(index.find(99), None);
    }

    #[test]
    fn empty_index_finds_nothing() {
        let index = Index::new();
        assert!(index.is_empty());
        assert_eq!(index.find(0), None);
    }

    #[test]
    fn splits_survive_many_inserts() {
        let mut index = Index::new();
        for row in 0..1000 {
            index.insert(row, (row as i64 * 7919) % 257, true);
        }

        assert_eq!(index.len(), 1000);
        index.verify();

        for row in 0..1000 {
            let value = (row as i64 * 7919) % 257;
            let found = index.find(value).unwrap();
            assert_eq!((found as i64 * 7919) % 257, value);
        }
    }

    #[test]
    fn mid_column_insert_shifts_rows() {
        let mut index = Index::new();
        index.insert(0, 100, true);
        index.insert(1, 200, true);

        // Splice a row in at position 0: old rows 0 and 1 become 1 and 2.
        index.insert(0, 50, false);

        assert_eq!(index.find(50), Some(0));
        assert_eq!(index.find(100), Some(1));
        assert_eq!(index.find(200), Some(2));
        index.verify();
    }

    #[test]
    fn mid_column_remove_shifts_rows() {
        let mut index = Index::new();
        index.insert(0, 100, true);
        index.insert(1, 200, true);
        index.insert(2, 300, true);

        index.remove(1, 200, false);

        assert_eq!(index.len(), 2);
        assert_eq!(index.find(100), Some(0));
        assert_eq!(index.find(200), None);
        assert_eq!(index.find(300), Some(1));
        index.verify();
    }

    #[test]
    fn set_replaces_value_in_place() {
        let mut index = Index::new();
        index.insert(0, 100, true);
        index.insert(1, 200, true);

        index.set(0, 100, 150);

        assert_eq!(index.find(100), None);
        assert_eq!(index.find(150), Some(0));
        assert_eq!(index.find(200), Some(1));
        index.verify();
    }

    #[test]
    fn remove_unknown_key_is_a_no_op() {
        let mut index = Index::new();
        index.insert(0, 100, true);
        index.remove(5, 999, true);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn duplicate_values_across_splits_find_lowest_row() {
        let mut index = Index::new();
        for row in 0..200 {
            index.insert(row, 42, true);
        }
        assert_eq!(index.find(42), Some(0));
        index.verify();
    }
}
