//! Fixed headers framing a node: the node header shared by root and blocks,
//! and the index-root header that precedes the root node.

use crate::index::IndexError;
use crate::index::entry::{read_u16, read_u32, write_u16, write_u32};

/// Node header flag: entries in this node have children.
const HAS_CHILD_NODES: u16 = 0x01;

/// The header at the start of every node.
///
/// Offsets and sizes are relative to the header's own start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexHeader {
    pub offset_to_first_entry: u32,
    pub total_size_of_entries: u32,
    pub allocated_size_of_entries: u32,
    pub has_child_nodes: bool,
}

impl IndexHeader {
    pub const SIZE: usize = 0x10;

    pub fn read(buffer: &[u8], offset: usize) -> Result<Self, IndexError> {
        if offset + Self::SIZE > buffer.len() {
            return Err(IndexError::Malformed(format!(
                "node header at {offset} past end of {}-byte buffer",
                buffer.len()
            )));
        }

        Ok(Self {
            offset_to_first_entry: read_u32(buffer, offset),
            total_size_of_entries: read_u32(buffer, offset + 0x04),
            allocated_size_of_entries: read_u32(buffer, offset + 0x08),
            has_child_nodes: read_u16(buffer, offset + 0x0C) & HAS_CHILD_NODES != 0,
        })
    }

    pub fn write(&self, buffer: &mut [u8], offset: usize) {
        buffer[offset..offset + Self::SIZE].fill(0);
        write_u32(buffer, offset, self.offset_to_first_entry);
        write_u32(buffer, offset + 0x04, self.total_size_of_entries);
        write_u32(buffer, offset + 0x08, self.allocated_size_of_entries);
        let flags = if self.has_child_nodes { HAS_CHILD_NODES } else { 0 };
        write_u16(buffer, offset + 0x0C, flags);
    }
}

/// The `$INDEX_ROOT` header: what the index holds and how its blocks are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRoot {
    /// Attribute type code of the indexed attribute (0x30 for file names, 0 for views).
    pub attribute_type: u32,
    pub collation_rule: u32,
    /// Bytes per allocation block.
    pub index_allocation_size: u32,
    pub clusters_per_index_record: u8,
}

impl IndexRoot {
    pub const SIZE: usize = 0x10;

    pub fn read(buffer: &[u8]) -> Result<Self, IndexError> {
        if buffer.len() < Self::SIZE {
            return Err(IndexError::Malformed(format!(
                "index root of {} bytes is shorter than its header",
                buffer.len()
            )));
        }

        Ok(Self {
            attribute_type: read_u32(buffer, 0),
            collation_rule: read_u32(buffer, 0x04),
            index_allocation_size: read_u32(buffer, 0x08),
            clusters_per_index_record: buffer[0x0C],
        })
    }

    pub fn write(&self, buffer: &mut [u8]) {
        buffer[..Self::SIZE].fill(0);
        write_u32(buffer, 0, self.attribute_type);
        write_u32(buffer, 0x04, self.collation_rule);
        write_u32(buffer, 0x08, self.index_allocation_size);
        buffer[0x0C] = self.clusters_per_index_record;
    }
}
