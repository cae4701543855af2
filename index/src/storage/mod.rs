//! Collaborators that hold an index's bytes.
//!
//! The engine never touches a disk directly. It sees its hosting file record
//! through [`IndexHost`]:
//!
//! - the resident root payload, plus the record's current free space
//! - the allocation stream, a sequence of fixed-size index blocks
//! - the bitmap stream, one bit per block slot
//!
//! Both streams are created lazily, the first time the tree grows past its root.

mod bitmap;
mod file;
mod host;
mod memory;

pub use bitmap::Bitmap;
pub use file::{FileHost, FileStream};
pub use host::{AttributeStream, HostError, IndexHost, StreamKind};
pub use memory::{MemoryHost, MemoryStream};
