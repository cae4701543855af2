//! `INDX` allocation blocks.
//!
//! Block layout:
//! - 0x00: magic `INDX`
//! - 0x04: update sequence array offset (u16)
//! - 0x06: update sequence array count (u16)
//! - 0x08: log sequence number (u64)
//! - 0x10: VCN of this block (u64)
//! - 0x18: node header, followed by the update sequence array and entries
//!
//! Multi-sector fixups are left to the layer below.

#![allow(clippy::cast_possible_truncation)]

use crate::index::entry::{Vcn, read_u64, write_u16};
use crate::index::header::IndexHeader;
use crate::index::node::IndexNode;
use crate::index::IndexError;

const MAGIC: [u8; 4] = *b"INDX";

/// Offset of the node header inside a block.
pub const NODE_HEADER_OFFSET: usize = 0x18;

const UPDATE_SEQUENCE_OFFSET: u16 = 0x28;

const SECTOR_SIZE: u32 = 512;

/// One update sequence number plus one slot per sector.
#[must_use]
pub const fn update_sequence_count(block_size: u32) -> u16 {
    (block_size / SECTOR_SIZE + 1) as u16
}

/// Bytes the update sequence array takes ahead of the first entry.
#[must_use]
pub const fn storage_overhead(block_size: u32) -> usize {
    update_sequence_count(block_size) as usize * 2
}

/// A fresh, empty node sized for a block.
#[must_use]
pub fn new_node(block_size: u32, is_file_index: bool) -> IndexNode {
    IndexNode::new(
        storage_overhead(block_size),
        block_size as usize - NODE_HEADER_OFFSET,
        is_file_index,
    )
}

/// Parse the block read from the allocation stream for `vcn`.
pub fn read_block(
    buffer: &[u8],
    vcn: Vcn,
    block_size: u32,
    is_file_index: bool,
) -> Result<IndexNode, IndexError> {
    if buffer.len() < NODE_HEADER_OFFSET + IndexHeader::SIZE {
        return Err(IndexError::Malformed(format!(
            "block {vcn} is only {} bytes",
            buffer.len()
        )));
    }
    if buffer[..4] != MAGIC {
        return Err(IndexError::Malformed(format!(
            "block {vcn} has bad magic {:02x?}",
            &buffer[..4]
        )));
    }

    let stored = read_u64(buffer, 0x10);
    if stored != vcn {
        return Err(IndexError::Inconsistent(format!(
            "block read for vcn {vcn} records vcn {stored}"
        )));
    }

    let mut node = IndexNode::parse(
        buffer,
        NODE_HEADER_OFFSET,
        storage_overhead(block_size),
        is_file_index,
    )?;
    node.set_total_space_available(block_size as usize - NODE_HEADER_OFFSET);
    Ok(node)
}

/// Serialize a node into a full block image.
pub fn write_block(node: &IndexNode, vcn: Vcn, block_size: u32) -> Result<Vec<u8>, IndexError> {
    let needed = NODE_HEADER_OFFSET + node.calc_size();
    if needed > block_size as usize {
        return Err(IndexError::Inconsistent(format!(
            "block {vcn} needs {needed} bytes, blocks hold {block_size}"
        )));
    }

    let mut buffer = vec![0u8; block_size as usize];
    buffer[..4].copy_from_slice(&MAGIC);
    write_u16(&mut buffer, 0x04, UPDATE_SEQUENCE_OFFSET);
    write_u16(&mut buffer, 0x06, update_sequence_count(block_size));
    buffer[0x10..0x18].copy_from_slice(&vcn.to_le_bytes());
    node.write_to(&mut buffer, NODE_HEADER_OFFSET);
    Ok(buffer)
}
