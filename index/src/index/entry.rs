//! Index entries and their on-disk layout.
//!
//! Layout (all integers little-endian):
//! - 0x00: value offset (u16) / first half of the file reference for `$I30`
//! - 0x02: value length (u16)
//! - 0x04: reserved (4 bytes); for `$I30` the rest of the file reference
//! - 0x08: entry length (u16)
//! - 0x0A: key length (u16)
//! - 0x0C: flags (u16): bit 0 = `Node`, bit 1 = `End`
//! - 0x10: key bytes, then value bytes (non-file indexes only)
//!
//! The record is padded to 8 bytes. A `Node` entry carries the child block's
//! VCN in its final 8 bytes.

#![allow(clippy::cast_possible_truncation)]

use crate::index::IndexError;

/// Block address of a non-root node (virtual cluster number).
pub type Vcn = u64;

/// Size of the fixed entry header.
pub const ENTRY_HEADER_SIZE: usize = 0x10;

/// Size of a file reference, the value of every `$I30` entry.
pub const FILE_REFERENCE_SIZE: usize = 8;

/// Size of the trailing child pointer of a `Node` entry.
const CHILD_POINTER_SIZE: usize = 8;

/// Entry flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags(u16);

impl EntryFlags {
    /// A plain leaf entry.
    pub const NONE: Self = Self(0);
    /// The entry points at a child block.
    pub const NODE: Self = Self(0x01);
    /// The entry is the sentinel closing its node.
    pub const END: Self = Self(0x02);

    /// Raw flag bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Build from raw bits, keeping unknown bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Whether every bit in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for EntryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// A key/value record plus navigation flags.
///
/// An `End` entry has no key or value. A `Node` entry owns the VCN of the
/// block holding every key between the previous entry and itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    flags: EntryFlags,
    key: Vec<u8>,
    data: Vec<u8>,
    child: Vcn,
}

impl IndexEntry {
    /// A plain entry.
    #[must_use]
    pub const fn new(key: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            flags: EntryFlags::NONE,
            key,
            data,
            child: 0,
        }
    }

    /// A sentinel entry without a child.
    #[must_use]
    pub const fn end() -> Self {
        Self {
            flags: EntryFlags::END,
            key: Vec::new(),
            data: Vec::new(),
            child: 0,
        }
    }

    #[must_use]
    pub const fn flags(&self) -> EntryFlags {
        self.flags
    }

    #[must_use]
    pub const fn is_end(&self) -> bool {
        self.flags.contains(EntryFlags::END)
    }

    #[must_use]
    pub const fn is_node(&self) -> bool {
        self.flags.contains(EntryFlags::NODE)
    }

    /// The key, or `None` for an `End` entry.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        (!self.is_end()).then_some(self.key.as_slice())
    }

    /// Key bytes; empty for an `End` entry.
    #[must_use]
    pub fn key_bytes(&self) -> &[u8] {
        &self.key
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The child block, if the entry has one.
    #[must_use]
    pub const fn child(&self) -> Option<Vcn> {
        if self.is_node() {
            Some(self.child)
        } else {
            None
        }
    }

    /// Point the entry at a child block.
    pub const fn set_child(&mut self, vcn: Vcn) {
        self.flags = self.flags.with(EntryFlags::NODE);
        self.child = vcn;
    }

    /// Copy the child pointer (or its absence) from another entry.
    pub const fn take_child_from(&mut self, other: &Self) {
        match other.child() {
            Some(vcn) => self.set_child(vcn),
            None => self.clear_child(),
        }
    }

    /// Drop the child pointer.
    pub const fn clear_child(&mut self) {
        self.flags = self.flags.without(EntryFlags::NODE);
        self.child = 0;
    }

    /// Replace the key and value, keeping flags and child.
    pub fn replace_key_data(&mut self, key: Vec<u8>, data: Vec<u8>) {
        self.key = key;
        self.data = data;
    }

    /// Turn this entry into the sentinel, keeping its child.
    pub fn make_end(&mut self) {
        self.flags = self.flags.with(EntryFlags::END);
        self.key.clear();
        self.data.clear();
    }

    /// Consume the entry, returning its key and value.
    #[must_use]
    pub fn into_key_data(self) -> (Vec<u8>, Vec<u8>) {
        (self.key, self.data)
    }

    /// Serialized size, including padding and the child pointer.
    #[must_use]
    pub fn size(&self, is_file_index: bool) -> usize {
        let mut size = ENTRY_HEADER_SIZE;

        if !self.is_end() {
            size += self.key.len();
            if !is_file_index {
                size += self.data.len();
            }
        }

        size = size.next_multiple_of(8);

        if self.is_node() {
            size += CHILD_POINTER_SIZE;
        }

        size
    }

    /// Parse an entry at `offset`, returning it and the bytes it occupies.
    pub fn read(buffer: &[u8], offset: usize, is_file_index: bool) -> Result<(Self, usize), IndexError> {
        if offset + ENTRY_HEADER_SIZE > buffer.len() {
            return Err(IndexError::Malformed(format!(
                "entry header at {offset} past end of {}-byte buffer",
                buffer.len()
            )));
        }

        let value_offset = usize::from(read_u16(buffer, offset));
        let value_length = usize::from(read_u16(buffer, offset + 0x02));
        let length = usize::from(read_u16(buffer, offset + 0x08));
        let key_length = usize::from(read_u16(buffer, offset + 0x0A));
        let flags = EntryFlags::from_bits(read_u16(buffer, offset + 0x0C));

        if length < ENTRY_HEADER_SIZE || offset + length > buffer.len() {
            return Err(IndexError::Malformed(format!(
                "entry at {offset} declares length {length}"
            )));
        }

        let is_node = flags.contains(EntryFlags::NODE);
        let body_end = if is_node {
            length.checked_sub(CHILD_POINTER_SIZE).filter(|&end| end >= ENTRY_HEADER_SIZE)
        } else {
            Some(length)
        }
        .ok_or_else(|| {
            IndexError::Malformed(format!("node entry at {offset} too short for child pointer"))
        })?;

        let mut entry = Self {
            flags,
            key: Vec::new(),
            data: Vec::new(),
            child: 0,
        };

        if !entry.is_end() {
            if ENTRY_HEADER_SIZE + key_length > body_end {
                return Err(IndexError::Malformed(format!(
                    "entry at {offset}: key of {key_length} bytes overruns entry of {length}"
                )));
            }
            let key_start = offset + ENTRY_HEADER_SIZE;
            entry.key = buffer[key_start..key_start + key_length].to_vec();

            if is_file_index {
                entry.data = buffer[offset..offset + FILE_REFERENCE_SIZE].to_vec();
            } else {
                if value_offset + value_length > body_end {
                    return Err(IndexError::Malformed(format!(
                        "entry at {offset}: value at {value_offset}+{value_length} overruns entry of {length}"
                    )));
                }
                let value_start = offset + value_offset;
                entry.data = buffer[value_start..value_start + value_length].to_vec();
            }
        }

        if is_node {
            entry.child = read_u64(buffer, offset + length - CHILD_POINTER_SIZE);
        }

        Ok((entry, length))
    }

    /// Serialize the entry at `offset`, returning the bytes written.
    ///
    /// The caller guarantees `size()` bytes are available.
    pub fn write(&self, buffer: &mut [u8], offset: usize, is_file_index: bool) -> usize {
        let length = self.size(is_file_index);
        buffer[offset..offset + length].fill(0);

        if !self.is_end() {
            let key_length = self.key.len();

            if is_file_index {
                let n = self.data.len().min(FILE_REFERENCE_SIZE);
                buffer[offset..offset + n].copy_from_slice(&self.data[..n]);
            } else {
                let value_offset = ENTRY_HEADER_SIZE + key_length;
                write_u16(buffer, offset, value_offset as u16);
                write_u16(buffer, offset + 0x02, self.data.len() as u16);
                buffer[offset + value_offset..offset + value_offset + self.data.len()]
                    .copy_from_slice(&self.data);
            }

            write_u16(buffer, offset + 0x0A, key_length as u16);
            let key_start = offset + ENTRY_HEADER_SIZE;
            buffer[key_start..key_start + key_length].copy_from_slice(&self.key);
        }

        write_u16(buffer, offset + 0x08, length as u16);
        write_u16(buffer, offset + 0x0C, self.flags.bits());
        if self.is_node() {
            let at = offset + length - CHILD_POINTER_SIZE;
            buffer[at..at + 8].copy_from_slice(&self.child.to_le_bytes());
        }

        length
    }
}

pub(crate) fn read_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

pub(crate) fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

pub(crate) fn read_u64(buffer: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn write_u16(buffer: &mut [u8], offset: usize, value: u16) {
    buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(IndexEntry::end().size(false), 0x10);

        let mut end = IndexEntry::end();
        end.set_child(4);
        assert_eq!(end.size(false), 0x18);

        // 0x10 + 4 + 4 = 0x18
        let entry = IndexEntry::new(vec![1, 0, 0, 0], vec![9, 9, 9, 9]);
        assert_eq!(entry.size(false), 0x18);

        // 0x10 + 5 + 4 = 0x19, padded to 0x20
        let entry = IndexEntry::new(vec![1; 5], vec![9; 4]);
        assert_eq!(entry.size(false), 0x20);

        // File indexes keep the value in the header
        let entry = IndexEntry::new(vec![1; 0x42], vec![0; 8]);
        assert_eq!(entry.size(true), 0x58);
    }

    #[test]
    fn test_layout() {
        let mut entry = IndexEntry::new(vec![0xAA; 4], vec![0xBB; 3]);
        entry.set_child(0x1122);
        let mut buf = vec![0u8; 64];

        let written = entry.write(&mut buf, 8, false);
        assert_eq!(written, 0x20);
        assert_eq!(read_u16(&buf, 8), 0x14); // value offset
        assert_eq!(read_u16(&buf, 8 + 2), 3); // value length
        assert_eq!(read_u16(&buf, 8 + 8), 0x20); // entry length
        assert_eq!(read_u16(&buf, 8 + 0xA), 4); // key length
        assert_eq!(read_u16(&buf, 8 + 0xC), 1); // Node
        assert_eq!(&buf[8 + 0x10..8 + 0x14], &[0xAA; 4]);
        assert_eq!(&buf[8 + 0x14..8 + 0x17], &[0xBB; 3]);
        assert_eq!(read_u64(&buf, 8 + 0x18), 0x1122);

        let (parsed, consumed) = IndexEntry::read(&buf, 8, false).expect("parse");
        assert_eq!(consumed, 0x20);
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_file_index_layout() {
        let entry = IndexEntry::new(vec![7; 0x44], vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = vec![0u8; 0x58];
        entry.write(&mut buf, 0, true);

        assert_eq!(&buf[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(read_u16(&buf, 0x0A), 0x44);

        let (parsed, _) = IndexEntry::read(&buf, 0, true).expect("parse");
        assert_eq!(parsed.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(parsed.key(), Some(&[7u8; 0x44][..]));
    }

    #[test]
    fn test_end_entry_has_no_key() {
        let mut end = IndexEntry::end();
        end.set_child(12);
        let mut buf = vec![0xFFu8; 0x18];
        end.write(&mut buf, 0, false);

        let (parsed, consumed) = IndexEntry::read(&buf, 0, false).expect("parse");
        assert_eq!(consumed, 0x18);
        assert!(parsed.is_end());
        assert_eq!(parsed.key(), None);
        assert_eq!(parsed.child(), Some(12));
    }

    #[test]
    fn test_key_overrun_is_malformed() {
        let entry = IndexEntry::new(vec![1; 8], vec![2; 8]);
        let mut buf = vec![0u8; 0x20];
        entry.write(&mut buf, 0, false);
        write_u16(&mut buf, 0x0A, 0x40);

        let err = IndexEntry::read(&buf, 0, false).unwrap_err();
        assert!(matches!(err, IndexError::Malformed(_)));
    }

    #[test]
    fn test_value_overrun_is_malformed() {
        let entry = IndexEntry::new(vec![1; 8], vec![2; 8]);
        let mut buf = vec![0u8; 0x20];
        entry.write(&mut buf, 0, false);
        write_u16(&mut buf, 0x02, 0x30);

        let err = IndexEntry::read(&buf, 0, false).unwrap_err();
        assert!(matches!(err, IndexError::Malformed(_)));
    }

    #[test]
    fn test_truncated_buffer_is_malformed() {
        assert!(IndexEntry::read(&[0u8; 8], 0, false).is_err());

        let entry = IndexEntry::new(vec![1; 8], vec![2; 8]);
        let mut buf = vec![0u8; 0x20];
        entry.write(&mut buf, 0, false);
        assert!(IndexEntry::read(&buf[..0x18], 0, false).is_err());
    }

    #[test]
    fn test_child_manipulation() {
        let mut entry = IndexEntry::new(vec![1], vec![]);
        assert_eq!(entry.child(), None);

        entry.set_child(3);
        assert!(entry.is_node());

        let mut end = IndexEntry::end();
        end.take_child_from(&entry);
        assert_eq!(end.child(), Some(3));

        entry.clear_child();
        end.take_child_from(&entry);
        assert_eq!(end.child(), None);
        assert!(end.is_end());

        let mut promoted = IndexEntry::new(vec![5], vec![6]);
        promoted.set_child(8);
        promoted.make_end();
        assert!(promoted.is_end());
        assert_eq!(promoted.child(), Some(8));
        assert_eq!(promoted.key(), None);
    }
}
