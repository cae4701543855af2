//! B+Tree index engine for NTFS-style directory and catalog indexes.
//!
//! An index lives in three places inside its hosting file record:
//! - a resident root (`$INDEX_ROOT`) holding the root node,
//! - an allocation stream (`$INDEX_ALLOCATION`) of fixed-size `INDX` blocks,
//! - a bitmap stream (`$BITMAP`) with one bit per block slot.
//!
//! The hosting record and its streams are supplied by the caller through the
//! [`storage::IndexHost`] trait. Everything else (entry layout, collation,
//! node splitting and merging, block allocation) happens here.
//!
//! ```
//! use ntfs_index::{CollationRule, Index, IndexConfig, keys, storage::MemoryHost};
//!
//! let host = MemoryHost::new(1024);
//! let mut index = Index::create(
//!     host, "$SII", 0, CollationRule::UnsignedLong, &IndexConfig::default(), None,
//! )?;
//! index.set(&keys::u32_key(7), b"seven".to_vec())?;
//! assert_eq!(index.get(&keys::u32_key(7))?, Some(b"seven".to_vec()));
//! # Ok::<(), ntfs_index::IndexError>(())
//! ```

#![cfg_attr(test, allow(clippy::disallowed_methods, clippy::expect_used, clippy::unwrap_used))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod collation;
pub mod config;
pub mod index;
pub mod keys;
pub mod storage;

#[cfg(test)]
mod testing;

pub use collation::{CollationRule, Collator, UpCaseTable};
pub use config::{ConfigError, IndexConfig};
pub use index::{Entries, FindAll, Index, IndexEntry, IndexError, Vcn};
