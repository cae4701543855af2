//! A single tree node: an ordered run of entries closed by an `End` sentinel.

#![allow(clippy::cast_possible_truncation)]

use crate::collation::Collator;
use crate::index::entry::{IndexEntry, Vcn};
use crate::index::header::IndexHeader;
use crate::index::IndexError;

/// Where a node lives: the resident root or an allocation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Root,
    Block(Vcn),
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Block(vcn) => write!(f, "block {vcn}"),
        }
    }
}

/// An in-memory node.
///
/// Entries are kept sorted by the index's collation; the last one is always
/// the `End` sentinel. Either every entry has a child or none does.
#[derive(Debug, Clone)]
pub struct IndexNode {
    entries: Vec<IndexEntry>,
    /// Bytes between the node header and the first entry (update sequence array).
    storage_overhead: usize,
    /// Allocated size recorded in the node header.
    allocated_size: usize,
    /// Byte budget the node must fit in.
    total_space_available: usize,
    is_file_index: bool,
    parent: Option<NodeRef>,
}

impl IndexNode {
    /// An empty node holding only a bare `End` entry.
    #[must_use]
    pub fn new(storage_overhead: usize, allocated_size: usize, is_file_index: bool) -> Self {
        Self {
            entries: vec![IndexEntry::end()],
            storage_overhead,
            allocated_size,
            total_space_available: allocated_size,
            is_file_index,
            parent: None,
        }
    }

    /// Parse a node whose header starts at `offset`.
    pub fn parse(
        buffer: &[u8],
        offset: usize,
        storage_overhead: usize,
        is_file_index: bool,
    ) -> Result<Self, IndexError> {
        let header = IndexHeader::read(buffer, offset)?;
        let first = header.offset_to_first_entry as usize;
        let total = header.total_size_of_entries as usize;

        if first < IndexHeader::SIZE || first > total || offset + total > buffer.len() {
            return Err(IndexError::Malformed(format!(
                "node header at {offset}: first entry {first}, total size {total}, buffer {}",
                buffer.len()
            )));
        }

        let end = offset + total;
        let mut pos = offset + first;
        let mut entries = Vec::new();

        loop {
            if pos >= end {
                return Err(IndexError::Malformed(format!(
                    "node at {offset} has no End entry"
                )));
            }
            let (entry, consumed) = IndexEntry::read(&buffer[..end], pos, is_file_index)?;
            pos += consumed;
            let is_end = entry.is_end();
            entries.push(entry);
            if is_end {
                break;
            }
        }

        let allocated_size = header.allocated_size_of_entries as usize;
        Ok(Self {
            entries,
            storage_overhead,
            allocated_size,
            total_space_available: allocated_size,
            is_file_index,
            parent: None,
        })
    }

    /// Serialize the header and entries at `offset`, returning the bytes written.
    pub fn write_to(&self, buffer: &mut [u8], offset: usize) -> usize {
        let header = self.header();
        header.write(buffer, offset);

        let mut pos = offset + header.offset_to_first_entry as usize;
        for entry in &self.entries {
            pos += entry.write(buffer, pos, self.is_file_index);
        }

        pos - offset
    }

    /// The header describing the node as it would be written.
    #[must_use]
    pub fn header(&self) -> IndexHeader {
        IndexHeader {
            offset_to_first_entry: self.first_entry_offset() as u32,
            total_size_of_entries: self.calc_size() as u32,
            allocated_size_of_entries: self.allocated_size as u32,
            has_child_nodes: self.has_children(),
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub(crate) const fn entries_mut(&mut self) -> &mut Vec<IndexEntry> {
        &mut self.entries
    }

    /// Offset of the first entry from the node header.
    #[must_use]
    pub const fn first_entry_offset(&self) -> usize {
        (IndexHeader::SIZE + self.storage_overhead).next_multiple_of(8)
    }

    #[must_use]
    pub fn calc_entries_size(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.size(self.is_file_index))
            .sum()
    }

    /// Bytes the node occupies from its header to the end of its entries.
    #[must_use]
    pub fn calc_size(&self) -> usize {
        self.first_entry_offset() + self.calc_entries_size()
    }

    /// Bytes left in the budget, zero when over it.
    #[must_use]
    pub fn space_free(&self) -> usize {
        self.total_space_available.saturating_sub(self.calc_size())
    }

    #[must_use]
    pub fn is_over_budget(&self) -> bool {
        self.calc_size() > self.total_space_available
    }

    #[must_use]
    pub const fn total_space_available(&self) -> usize {
        self.total_space_available
    }

    pub const fn set_total_space_available(&mut self, size: usize) {
        self.total_space_available = size;
    }

    pub const fn set_allocated_size(&mut self, size: usize) {
        self.allocated_size = size;
    }

    #[must_use]
    pub fn has_children(&self) -> bool {
        self.entries.first().is_some_and(IndexEntry::is_node)
    }

    #[must_use]
    pub const fn parent(&self) -> Option<NodeRef> {
        self.parent
    }

    pub const fn set_parent(&mut self, parent: Option<NodeRef>) {
        self.parent = parent;
    }

    /// Locate `key`: the index of the first entry not less than it, and
    /// whether that entry is an exact match. Lands on `End` when the key is
    /// greater than every entry.
    #[must_use]
    pub fn find_slot(&self, key: &[u8], collator: &Collator) -> (usize, bool) {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.is_end() {
                return (idx, false);
            }
            match collator.compare_keys(key, entry.key_bytes()) {
                std::cmp::Ordering::Greater => {}
                std::cmp::Ordering::Equal => return (idx, true),
                std::cmp::Ordering::Less => return (idx, false),
            }
        }
        (self.entries.len(), false)
    }

    /// Insert an entry at its sorted position within this node only.
    pub fn insert_here(&mut self, entry: IndexEntry, collator: &Collator) -> Result<usize, IndexError> {
        let (idx, exact) = self.find_slot(entry.key_bytes(), collator);
        if exact {
            return Err(IndexError::Inconsistent(
                "duplicate key promoted into node".to_string(),
            ));
        }
        self.entries.insert(idx, entry);
        Ok(idx)
    }

    /// Index of the entry pointing at `vcn`.
    #[must_use]
    pub fn child_slot(&self, vcn: Vcn) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.child() == Some(vcn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collation::CollationRule;
    use crate::keys::u32_key;

    fn collator() -> Collator {
        Collator::new(CollationRule::UnsignedLong, None)
    }

    fn node_with(keys: &[u32]) -> IndexNode {
        let collator = collator();
        let mut node = IndexNode::new(0, 512, false);
        for &k in keys {
            node.insert_here(IndexEntry::new(u32_key(k), vec![0xAB; 4]), &collator)
                .expect("insert");
        }
        node
    }

    #[test]
    fn test_empty_node() {
        let node = IndexNode::new(0, 512, false);
        assert_eq!(node.entries().len(), 1);
        assert!(node.entries()[0].is_end());
        assert_eq!(node.first_entry_offset(), 0x10);
        assert_eq!(node.calc_size(), 0x20);
        assert_eq!(node.space_free(), 512 - 0x20);
        assert!(!node.has_children());
    }

    #[test]
    fn test_first_entry_offset_with_overhead() {
        // A 4096-byte block carries a 9-slot update sequence array.
        let node = IndexNode::new(18, 4096 - 0x18, false);
        assert_eq!(node.first_entry_offset(), 0x28);

        let node = IndexNode::new(2, 128 - 0x18, false);
        assert_eq!(node.first_entry_offset(), 0x18);
    }

    #[test]
    fn test_find_slot() {
        let node = node_with(&[10, 30, 20]);
        let collator = collator();

        let keys: Vec<_> = node.entries().iter().filter_map(IndexEntry::key).collect();
        assert_eq!(keys, vec![&u32_key(10)[..], &u32_key(20)[..], &u32_key(30)[..]]);

        assert_eq!(node.find_slot(&u32_key(5), &collator), (0, false));
        assert_eq!(node.find_slot(&u32_key(20), &collator), (1, true));
        assert_eq!(node.find_slot(&u32_key(25), &collator), (2, false));
        assert_eq!(node.find_slot(&u32_key(99), &collator), (3, false));
    }

    #[test]
    fn test_insert_duplicate_is_rejected() {
        let mut node = node_with(&[1]);
        let err = node
            .insert_here(IndexEntry::new(u32_key(1), vec![]), &collator())
            .unwrap_err();
        assert!(matches!(err, IndexError::Inconsistent(_)));
    }

    #[test]
    fn test_roundtrip() {
        let mut node = node_with(&[3, 1, 2]);
        for (vcn, entry) in node.entries_mut().iter_mut().enumerate() {
            entry.set_child(vcn as u64 * 2);
        }

        let mut buf = vec![0u8; 8 + node.calc_size()];
        let written = node.write_to(&mut buf, 8);
        assert_eq!(written, node.calc_size());

        let parsed = IndexNode::parse(&buf, 8, 0, false).expect("parse");
        assert_eq!(parsed.entries(), node.entries());
        assert!(parsed.has_children());
        assert_eq!(parsed.header(), node.header());
    }

    #[test]
    fn test_budget() {
        let mut node = node_with(&[1, 2]);
        node.set_total_space_available(node.calc_size());
        assert!(!node.is_over_budget());
        assert_eq!(node.space_free(), 0);

        node.insert_here(IndexEntry::new(u32_key(3), vec![]), &collator())
            .expect("insert");
        assert!(node.is_over_budget());
        assert_eq!(node.space_free(), 0);
    }

    #[test]
    fn test_missing_end_is_malformed() {
        let node = node_with(&[1, 2]);
        let mut buf = vec![0u8; node.calc_size()];
        node.write_to(&mut buf, 0);

        // Shrink the declared size so the End entry falls outside it.
        let mut header = node.header();
        header.total_size_of_entries -= 0x10;
        header.write(&mut buf, 0);

        let err = IndexNode::parse(&buf, 0, 0, false).unwrap_err();
        assert!(matches!(err, IndexError::Malformed(_)));
    }

    #[test]
    fn test_bad_header_offsets_are_malformed() {
        let node = node_with(&[1]);
        let mut buf = vec![0u8; node.calc_size()];
        node.write_to(&mut buf, 0);

        let mut header = node.header();
        header.offset_to_first_entry = 4;
        header.write(&mut buf, 0);
        assert!(IndexNode::parse(&buf, 0, 0, false).is_err());

        let mut header = node.header();
        header.total_size_of_entries = 0x1000;
        header.write(&mut buf, 0);
        assert!(IndexNode::parse(&buf, 0, 0, false).is_err());
    }

    #[test]
    fn test_child_slot() {
        let mut node = node_with(&[1, 2]);
        node.entries_mut()[1].set_child(40);
        assert_eq!(node.child_slot(40), Some(1));
        assert_eq!(node.child_slot(41), None);
    }
}
