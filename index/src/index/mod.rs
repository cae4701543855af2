//! The B+Tree index: entries, nodes, blocks and the coordinator that ties
//! them to a hosting record.

pub mod block;
mod cursor;
pub mod entry;
mod error;
pub mod header;
pub mod node;
mod tree;

pub use cursor::{Entries, FindAll};
pub use entry::{EntryFlags, IndexEntry, Vcn};
pub use error::IndexError;
pub use header::{IndexHeader, IndexRoot};
pub use node::IndexNode;
pub use tree::Index;
