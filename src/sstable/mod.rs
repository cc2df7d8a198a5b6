//! Immutable sorted table files: block format, Bloom filters, builder and
//! reader.

pub mod block;
pub mod bloom;
pub mod table;

pub use table::{BuiltTable, Table, TableBuilder, TableIterator};
