//! # Group Data Layer
//!
//! The content of a TideDB database is a *group*: an ordered set of named
//! tables, each with a declared layout of typed columns (`Int`, `Bool`,
//! `String`). On disk the group is a small copy-on-write tree:
//!
//! ```text
//! group node ──> table node ──> column nodes
//!           ──> table node ──> column nodes
//! ```
//!
//! Every node is immutable once committed. A write transaction decodes the
//! committed tree into an owned working copy, tracks which tables and columns
//! it touched, and at commit rewrites only the dirty nodes - clean subtrees
//! are referenced by their existing offsets, so consecutive versions share
//! everything that did not change.
//!
//! Read views are decoded from the pinned snapshot's bytes and are inert:
//! mutation through a read view is a `TransactionMisuse` error.
//!
//! - `column`: value/column types and their node encodings
//! - `table`: the row surface (`add_row`, cell get/set)
//! - `group`: the table directory, decode and copy-on-write serialization

mod column;
mod group;
mod table;

pub use column::{ColumnType, Value};
pub use group::Group;
pub use table::Table;
