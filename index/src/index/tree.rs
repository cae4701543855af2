//! The index coordinator: owns the root, pages blocks in and out of a cache,
//! and runs the tree algorithms over them.
//!
//! Nodes are addressed by [`NodeRef`]. The root lives in `root`; every other
//! node is an entry of `cache` keyed by its VCN, loaded from the allocation
//! stream on first use. Splits hand the promoted separators back to the
//! caller, which inserts them into the node one level up.

#![allow(clippy::cast_possible_truncation)]

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::collation::{CollationRule, Collator, UpCaseTable};
use crate::config::IndexConfig;
use crate::index::IndexError;
use crate::index::block;
use crate::index::cursor::{Entries, FindAll};
use crate::index::entry::{FILE_REFERENCE_SIZE, IndexEntry, Vcn};
use crate::index::header::IndexRoot;
use crate::index::node::{IndexNode, NodeRef};
use crate::keys;
use crate::storage::{AttributeStream, Bitmap, HostError, IndexHost, StreamKind};

/// Directory indexes are named `$I30` and carry file references as values.
const FILE_INDEX_NAME: &str = "$I30";

/// A B+Tree index stored in a hosting record.
pub struct Index<H: IndexHost> {
    host: H,
    name: String,
    root_header: IndexRoot,
    root: IndexNode,
    /// Length of the root payload as last written to the host.
    root_stored_len: usize,
    collator: Collator,
    is_file_index: bool,
    cache: HashMap<Vcn, IndexNode>,
    allocation: Option<H::Stream>,
    bitmap: Option<Bitmap<H::Stream>>,
}

impl<H: IndexHost> Index<H> {
    /// Create an empty index and write its root to `host`.
    pub fn create(
        host: H,
        name: &str,
        attribute_type: u32,
        rule: CollationRule,
        config: &IndexConfig,
        upcase: Option<Arc<UpCaseTable>>,
    ) -> Result<Self, IndexError> {
        config.validate()?;

        let is_file_index = name == FILE_INDEX_NAME;
        let mut index = Self {
            host,
            name: name.to_string(),
            root_header: IndexRoot {
                attribute_type,
                collation_rule: rule.code(),
                index_allocation_size: config.block_size,
                clusters_per_index_record: config.clusters_per_block,
            },
            root: IndexNode::new(0, 0, is_file_index),
            root_stored_len: 0,
            collator: Collator::new(rule, upcase),
            is_file_index,
            cache: HashMap::new(),
            allocation: None,
            bitmap: None,
        };
        index.write_root()?;

        debug!(
            index = %index.name,
            ?rule,
            block_size = config.block_size,
            "created index"
        );
        Ok(index)
    }

    /// Open an existing index from the root stored in `host`.
    pub fn open(
        mut host: H,
        name: &str,
        upcase: Option<Arc<UpCaseTable>>,
    ) -> Result<Self, IndexError> {
        let payload = host.read_root()?;
        let root_header = IndexRoot::read(&payload)?;
        let collator = Collator::from_code(root_header.collation_rule, upcase)?;

        IndexConfig {
            block_size: root_header.index_allocation_size,
            clusters_per_block: root_header.clusters_per_index_record,
        }
        .validate()
        .map_err(|e| IndexError::Malformed(format!("stored block geometry: {e}")))?;

        let is_file_index = name == FILE_INDEX_NAME;
        let root = IndexNode::parse(&payload, IndexRoot::SIZE, 0, is_file_index)
            .inspect_err(|e| warn!(index = name, error = %e, "corrupt index root"))?;

        let allocation = host.open_stream(StreamKind::Allocation)?;
        let bitmap = host
            .open_stream(StreamKind::Bitmap)?
            .map(Bitmap::new)
            .transpose()?;

        debug!(
            index = name,
            rule = ?collator.rule(),
            blocks = bitmap.as_ref().map_or(0, Bitmap::count_present),
            "opened index"
        );

        Ok(Self {
            host,
            name: name.to_string(),
            root_header,
            root,
            root_stored_len: payload.len(),
            collator,
            is_file_index,
            cache: HashMap::new(),
            allocation,
            bitmap,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_file_index(&self) -> bool {
        self.is_file_index
    }

    #[must_use]
    pub const fn collator(&self) -> &Collator {
        &self.collator
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.root_header.index_allocation_size
    }

    #[must_use]
    pub const fn host(&self) -> &H {
        &self.host
    }

    /// Mutable access to the host, e.g. to change the record's free space.
    pub const fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    #[must_use]
    pub fn into_host(self) -> H {
        self.host
    }

    /// Number of blocks marked in use in the bitmap.
    #[must_use]
    pub fn allocated_blocks(&self) -> u64 {
        self.bitmap.as_ref().map_or(0, Bitmap::count_present)
    }

    /// Look up the value stored under `key`.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexError> {
        let Some((at, idx)) = self.lookup(key)? else {
            return Ok(None);
        };
        Ok(self
            .node(at)?
            .entries()
            .get(idx)
            .map(|entry| entry.data().to_vec()))
    }

    pub fn contains_key(&mut self, key: &[u8]) -> Result<bool, IndexError> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Insert `key`, or update the value of an existing key.
    ///
    /// Updates must not change the entry's serialized size.
    pub fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), IndexError> {
        if self.is_file_index && value.len() != FILE_REFERENCE_SIZE {
            return Err(IndexError::Unsupported(format!(
                "file index values are {FILE_REFERENCE_SIZE}-byte file references, got {} bytes",
                value.len()
            )));
        }

        self.refresh_root_budget();

        if let Some((at, idx)) = self.lookup(key)? {
            return self.update(at, idx, value);
        }

        let entry = IndexEntry::new(key.to_vec(), value);
        self.check_fits(&entry)?;

        let promoted = self.add_entry(NodeRef::Root, entry)?;
        if !promoted.is_empty() {
            return Err(self.inconsistent("root split promoted entries past the root".to_string()));
        }
        Ok(())
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool, IndexError> {
        self.refresh_root_budget();

        let (found, promoted) = self.remove_entry(NodeRef::Root, key)?;
        if !promoted.is_empty() {
            return Err(self.inconsistent("root overflowed while removing".to_string()));
        }
        Ok(found)
    }

    /// All entries in collation order.
    pub fn entries(&mut self) -> Entries<'_, H> {
        Entries::new(self)
    }

    /// Entries matching `query`, in collation order.
    ///
    /// `query` compares the searched range against an entry's key: `Equal`
    /// for a match, `Greater` when the range lies above the key, `Less` when
    /// it lies below.
    pub fn find_all<Q>(&mut self, query: Q) -> FindAll<'_, H, Q>
    where
        Q: FnMut(&[u8]) -> std::cmp::Ordering,
    {
        FindAll::new(self, query)
    }

    /// Number of entries, by full traversal.
    pub fn count(&mut self) -> Result<usize, IndexError> {
        let mut count = 0;
        for entry in self.entries() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Move every root entry into a block, freeing space in the hosting record.
    ///
    /// Returns `false` when the root was already empty.
    pub fn shrink_root(&mut self) -> Result<bool, IndexError> {
        self.refresh_root_budget();
        if self.root.entries().len() <= 1 {
            return Ok(false);
        }

        let child = self.depose()?;
        let promoted = self.ensure_size(NodeRef::Block(child))?;
        self.insert_promoted(NodeRef::Root, promoted)?;
        self.ensure_size(NodeRef::Root)?;
        Ok(true)
    }

    /// Check the structure of the whole tree.
    pub fn verify(&mut self) -> Result<(), IndexError> {
        self.refresh_root_budget();

        let mut reachable = HashSet::new();
        self.verify_node(NodeRef::Root, None, None, None, &mut reachable)?;

        let clusters = u64::from(self.root_header.clusters_per_index_record);
        let allocated: Vec<Vcn> = self.bitmap.as_ref().map_or_else(Vec::new, |bitmap| {
            bitmap.present_indices().map(|slot| slot * clusters).collect()
        });
        if let Some(vcn) = allocated.into_iter().find(|vcn| !reachable.contains(vcn)) {
            return Err(self.inconsistent(format!("block {vcn} is allocated but unreachable")));
        }
        Ok(())
    }

    /// Render the tree, one entry per line, children indented under their entry.
    pub fn dump(&mut self) -> Result<String, IndexError> {
        let mut out = String::new();
        self.dump_node(NodeRef::Root, "", "R", &mut out)?;
        Ok(out)
    }

    fn dump_node(
        &mut self,
        at: NodeRef,
        prefix: &str,
        id: &str,
        out: &mut String,
    ) -> Result<(), IndexError> {
        let _ = writeln!(out, "{prefix}{id}:");

        let entries = self.node(at)?.entries().to_vec();
        for entry in entries {
            if entry.is_end() {
                let _ = writeln!(out, "{prefix}      E");
            } else {
                let _ = writeln!(out, "{prefix}      {}", describe_entry(&self.name, &entry));
            }

            if let Some(child) = entry.child() {
                self.descend(at, child)?;
                self.dump_node(
                    NodeRef::Block(child),
                    &format!("{prefix}        "),
                    &format!(":i{child}"),
                    out,
                )?;
            }
        }
        Ok(())
    }

    // ---- node access ----

    /// The node at `at`, loading it if it is not cached.
    pub(crate) fn node(&mut self, at: NodeRef) -> Result<&mut IndexNode, IndexError> {
        match at {
            NodeRef::Root => Ok(&mut self.root),
            NodeRef::Block(vcn) => self.get_block(vcn),
        }
    }

    /// The node at `at` together with the collator.
    fn parts(&mut self, at: NodeRef) -> Result<(&mut IndexNode, &Collator), IndexError> {
        if let NodeRef::Block(vcn) = at {
            self.get_block(vcn)?;
        }
        let node = match at {
            NodeRef::Root => &mut self.root,
            NodeRef::Block(vcn) => self
                .cache
                .get_mut(&vcn)
                .ok_or_else(|| IndexError::Inconsistent(format!("block {vcn} left the cache")))?,
        };
        Ok((node, &self.collator))
    }

    /// Load the child `vcn` of `parent` and record the parent link.
    pub(crate) fn descend(&mut self, parent: NodeRef, vcn: Vcn) -> Result<(), IndexError> {
        self.get_block(vcn)?.set_parent(Some(parent));
        Ok(())
    }

    fn get_block(&mut self, vcn: Vcn) -> Result<&mut IndexNode, IndexError> {
        if !self.cache.contains_key(&vcn) {
            let node = self.load_block(vcn)?;
            self.cache.insert(vcn, node);
        }
        self.cache
            .get_mut(&vcn)
            .ok_or_else(|| IndexError::Inconsistent(format!("block {vcn} left the cache")))
    }

    fn load_block(&mut self, vcn: Vcn) -> Result<IndexNode, IndexError> {
        let slot = self.vcn_to_slot(vcn)?;
        if !self.bitmap.as_ref().is_some_and(|bitmap| bitmap.is_present(slot)) {
            return Err(self.inconsistent(format!("block {vcn} is not marked in the bitmap")));
        }

        let block_size = self.block_size();
        let Some(stream) = self.allocation.as_mut() else {
            return Err(self.inconsistent(format!("block {vcn} referenced without an allocation stream")));
        };

        let mut buffer = vec![0u8; block_size as usize];
        match stream.read_at(slot * u64::from(block_size), &mut buffer) {
            Ok(()) => {}
            Err(HostError::OutOfBounds { pos, len }) => {
                return Err(self.inconsistent(format!(
                    "block {vcn} at {pos} lies past the allocation stream (length {len})"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        trace!(index = %self.name, vcn, "loaded index block");
        block::read_block(&buffer, vcn, block_size, self.is_file_index).inspect_err(
            |e| warn!(index = %self.name, vcn, error = %e, "corrupt index block"),
        )
    }

    fn vcn_to_slot(&self, vcn: Vcn) -> Result<u64, IndexError> {
        let clusters = u64::from(self.root_header.clusters_per_index_record);
        if vcn % clusters != 0 {
            return Err(IndexError::Inconsistent(format!(
                "vcn {vcn} is not a multiple of {clusters} clusters per block"
            )));
        }
        Ok(vcn / clusters)
    }

    fn allocate_block(&mut self) -> Result<Vcn, IndexError> {
        if self.allocation.is_none() {
            self.allocation = Some(self.host.create_stream(StreamKind::Allocation)?);
        }
        if self.bitmap.is_none() {
            let stream = self.host.create_stream(StreamKind::Bitmap)?;
            self.bitmap = Some(Bitmap::new(stream)?);
        }

        let slot = match self.bitmap.as_mut() {
            Some(bitmap) => bitmap.allocate_first_available()?,
            None => return Err(IndexError::Host(HostError::MissingStream(StreamKind::Bitmap))),
        };
        let vcn = slot * u64::from(self.root_header.clusters_per_index_record);

        self.cache
            .insert(vcn, block::new_node(self.block_size(), self.is_file_index));
        debug!(index = %self.name, vcn, "allocated index block");
        Ok(vcn)
    }

    fn free_block(&mut self, vcn: Vcn) -> Result<(), IndexError> {
        let slot = self.vcn_to_slot(vcn)?;
        match self.bitmap.as_mut() {
            Some(bitmap) => bitmap.mark_absent(slot)?,
            None => return Err(IndexError::Host(HostError::MissingStream(StreamKind::Bitmap))),
        }
        self.cache.remove(&vcn);
        debug!(index = %self.name, vcn, "freed index block");
        Ok(())
    }

    fn free_subtree(&mut self, vcn: Vcn) -> Result<(), IndexError> {
        let children: Vec<Vcn> = self
            .get_block(vcn)?
            .entries()
            .iter()
            .filter_map(IndexEntry::child)
            .collect();
        for child in children {
            self.free_subtree(child)?;
        }
        self.free_block(vcn)
    }

    fn store(&mut self, at: NodeRef) -> Result<(), IndexError> {
        match at {
            NodeRef::Root => self.write_root(),
            NodeRef::Block(vcn) => self.write_block(vcn),
        }
    }

    fn write_root(&mut self) -> Result<(), IndexError> {
        let size = self.root.calc_size();
        self.root.set_allocated_size(size);

        let mut payload = vec![0u8; IndexRoot::SIZE + size];
        self.root_header.write(&mut payload);
        self.root.write_to(&mut payload, IndexRoot::SIZE);

        self.host.write_root(&payload)?;
        self.root_stored_len = payload.len();
        Ok(())
    }

    fn write_block(&mut self, vcn: Vcn) -> Result<(), IndexError> {
        let slot = self.vcn_to_slot(vcn)?;
        let block_size = self.block_size();
        let node = self
            .cache
            .get(&vcn)
            .ok_or_else(|| IndexError::Inconsistent(format!("block {vcn} left the cache")))?;
        let image = block::write_block(node, vcn, block_size)?;

        match self.allocation.as_mut() {
            Some(stream) => stream.write_at(slot * u64::from(block_size), &image)?,
            None => return Err(IndexError::Host(HostError::MissingStream(StreamKind::Allocation))),
        }
        Ok(())
    }

    /// The root may grow into whatever its hosting record has free right now.
    fn refresh_root_budget(&mut self) {
        let stored = self.root_stored_len.saturating_sub(IndexRoot::SIZE);
        self.root
            .set_total_space_available(stored + self.host.free_space());
    }

    /// Reject entries that could never fit a block, even alone.
    fn check_fits(&self, entry: &IndexEntry) -> Result<(), IndexError> {
        let empty = block::new_node(self.block_size(), self.is_file_index);
        let capacity = empty
            .total_space_available()
            .saturating_sub(empty.first_entry_offset());

        let mut probe = entry.clone();
        probe.set_child(0);
        let mut end = IndexEntry::end();
        end.set_child(0);

        // Entry lengths are stored in 16 bits.
        let entry_size = probe.size(self.is_file_index);
        if entry_size > usize::from(u16::MAX) {
            return Err(IndexError::Exhausted {
                entry_size,
                capacity: usize::from(u16::MAX),
            });
        }
        if entry_size + end.size(self.is_file_index) > capacity {
            return Err(IndexError::Exhausted {
                entry_size: entry.size(self.is_file_index),
                capacity,
            });
        }
        Ok(())
    }

    fn inconsistent(&self, message: String) -> IndexError {
        warn!(index = %self.name, "{message}");
        IndexError::Inconsistent(message)
    }

    // ---- tree algorithms ----

    /// Locate `key`: the node holding it and its position there.
    fn lookup(&mut self, key: &[u8]) -> Result<Option<(NodeRef, usize)>, IndexError> {
        let mut at = NodeRef::Root;
        loop {
            let (node, collator) = self.parts(at)?;
            let (idx, exact) = node.find_slot(key, collator);
            if exact {
                return Ok(Some((at, idx)));
            }

            match node.entries().get(idx).and_then(IndexEntry::child) {
                Some(child) => {
                    self.descend(at, child)?;
                    at = NodeRef::Block(child);
                }
                None => return Ok(None),
            }
        }
    }

    fn update(&mut self, at: NodeRef, idx: usize, value: Vec<u8>) -> Result<(), IndexError> {
        let is_file_index = self.is_file_index;
        let node = self.node(at)?;
        let Some(entry) = node.entries_mut().get_mut(idx) else {
            return Err(IndexError::Inconsistent(format!("entry {idx} vanished from {at}")));
        };

        let old_size = entry.size(is_file_index);
        let mut updated = entry.clone();
        let key = updated.key_bytes().to_vec();
        updated.replace_key_data(key, value);

        let new_size = updated.size(is_file_index);
        if new_size != old_size {
            return Err(IndexError::Unsupported(format!(
                "update would change the entry size from {old_size} to {new_size} bytes"
            )));
        }

        *entry = updated;
        self.store(at)
    }

    /// Insert into the subtree at `at`, descending to a leaf first.
    ///
    /// Returns separators the node promoted while splitting; the caller
    /// inserts them one level up.
    fn add_entry(&mut self, at: NodeRef, entry: IndexEntry) -> Result<Vec<IndexEntry>, IndexError> {
        let (node, collator) = self.parts(at)?;
        let (idx, exact) = node.find_slot(entry.key_bytes(), collator);
        if exact {
            return Err(IndexError::Inconsistent(format!("key already present in {at}")));
        }

        match node.entries().get(idx).and_then(IndexEntry::child) {
            Some(child) => {
                self.descend(at, child)?;
                let promoted = self.add_entry(NodeRef::Block(child), entry)?;
                if promoted.is_empty() {
                    return Ok(promoted);
                }
                self.insert_promoted(at, promoted)?;
            }
            None => node.entries_mut().insert(idx, entry),
        }

        self.ensure_size(at)
    }

    fn insert_promoted(&mut self, at: NodeRef, promoted: Vec<IndexEntry>) -> Result<(), IndexError> {
        if promoted.is_empty() {
            return Ok(());
        }
        let (node, collator) = self.parts(at)?;
        for entry in promoted {
            node.insert_here(entry, collator)?;
        }
        Ok(())
    }

    /// Bring the node back within its budget, then write it.
    ///
    /// Blocks split and return the promoted separators; the root moves its
    /// entries into a new child instead.
    fn ensure_size(&mut self, at: NodeRef) -> Result<Vec<IndexEntry>, IndexError> {
        let is_file_index = self.is_file_index;
        let mut promoted = Vec::new();

        loop {
            let node = self.node(at)?;
            if !node.is_over_budget() {
                break;
            }

            match at {
                NodeRef::Block(vcn) => {
                    if node.entries().len() <= 2 {
                        return Err(exhausted(node, is_file_index));
                    }
                    let (middle, lower) = self.divide(vcn)?;
                    promoted.push(middle);
                    promoted.extend(self.ensure_size(NodeRef::Block(lower))?);
                }
                NodeRef::Root => {
                    if node.entries().len() <= 1 {
                        return Err(exhausted(node, is_file_index));
                    }
                    let child = self.depose()?;
                    let below = self.ensure_size(NodeRef::Block(child))?;
                    self.insert_promoted(NodeRef::Root, below)?;
                }
            }
        }

        self.store(at)?;
        Ok(promoted)
    }

    /// Split block `vcn` around its middle entry.
    ///
    /// The lower half moves to a new block; the middle entry, now pointing at
    /// it, is returned for promotion.
    fn divide(&mut self, vcn: Vcn) -> Result<(IndexEntry, Vcn), IndexError> {
        let lower_vcn = self.allocate_block()?;

        let node = self.get_block(vcn)?;
        let parent = node.parent();
        let entries = node.entries_mut();
        let mid = (entries.len() - 1) / 2;
        let upper = entries.split_off(mid + 1);
        let Some(mut middle) = entries.pop() else {
            return Err(IndexError::Inconsistent(format!("block {vcn} emptied while dividing")));
        };
        let mut lower_entries = std::mem::replace(entries, upper);

        let mut end = IndexEntry::end();
        end.take_child_from(&middle);
        lower_entries.push(end);
        middle.set_child(lower_vcn);

        for child in lower_entries.iter().filter_map(IndexEntry::child) {
            if let Some(node) = self.cache.get_mut(&child) {
                node.set_parent(Some(NodeRef::Block(lower_vcn)));
            }
        }

        let lower = self.get_block(lower_vcn)?;
        *lower.entries_mut() = lower_entries;
        lower.set_parent(parent);

        debug!(index = %self.name, vcn, lower = lower_vcn, "divided index block");
        Ok((middle, lower_vcn))
    }

    /// Move every root entry into a new block, leaving the root as a single
    /// `End` entry pointing at it.
    fn depose(&mut self) -> Result<Vcn, IndexError> {
        let child = self.allocate_block()?;
        let entries = std::mem::take(self.root.entries_mut());

        for grandchild in entries.iter().filter_map(IndexEntry::child) {
            if let Some(node) = self.cache.get_mut(&grandchild) {
                node.set_parent(Some(NodeRef::Block(child)));
            }
        }

        let node = self.get_block(child)?;
        *node.entries_mut() = entries;
        node.set_parent(Some(NodeRef::Root));

        let mut end = IndexEntry::end();
        end.set_child(child);
        self.root.entries_mut().push(end);

        debug!(index = %self.name, vcn = child, "deposed root into block");
        Ok(child)
    }

    /// Remove `key` from the subtree at `at`.
    ///
    /// Returns whether the key was found, plus any separators promoted while
    /// rebalancing.
    fn remove_entry(
        &mut self,
        at: NodeRef,
        key: &[u8],
    ) -> Result<(bool, Vec<IndexEntry>), IndexError> {
        let (node, collator) = self.parts(at)?;
        let (idx, exact) = node.find_slot(key, collator);
        let Some(child) = node.entries().get(idx).map(IndexEntry::child) else {
            return Err(IndexError::Inconsistent(format!("{at} has no End entry")));
        };

        let changed = match (exact, child) {
            (false, None) => return Ok((false, Vec::new())),
            (true, None) => {
                node.entries_mut().remove(idx);
                self.store(at)?;
                return Ok((true, Vec::new()));
            }
            (true, Some(child)) => {
                let next_is_bare_end = node
                    .entries()
                    .get(idx + 1)
                    .is_some_and(|next| next.is_end() && !next.is_node());
                if next_is_bare_end {
                    let entries = node.entries_mut();
                    entries.remove(idx + 1);
                    entries[idx].make_end();
                    self.store(at)?;
                    return Ok((true, Vec::new()));
                }

                self.descend(at, child)?;
                let Some((predecessor, data)) = self.largest_key(NodeRef::Block(child))? else {
                    // Nothing below sorts before this key: the subtree holds no keys.
                    self.free_subtree(child)?;
                    self.node(at)?.entries_mut().remove(idx);
                    self.store(at)?;
                    return Ok((true, Vec::new()));
                };

                self.node(at)?.entries_mut()[idx].replace_key_data(predecessor.clone(), data);
                let (found, promoted) = self.remove_entry(NodeRef::Block(child), &predecessor)?;
                if !found {
                    return Err(self.inconsistent(format!(
                        "largest key of block {child} not found while removing it"
                    )));
                }
                self.insert_promoted(at, promoted)?;
                child
            }
            (false, Some(child)) => {
                self.descend(at, child)?;
                let (found, promoted) = self.remove_entry(NodeRef::Block(child), key)?;
                if !found {
                    return Ok((false, Vec::new()));
                }
                self.insert_promoted(at, promoted)?;
                child
            }
        };

        let Some(slot) = self.node(at)?.child_slot(changed) else {
            return Err(self.inconsistent(format!("{at} lost its pointer to block {changed}")));
        };
        let lifted = self.lift_node(at, slot)?;
        self.insert_promoted(at, lifted)?;
        let populated = self.populate_end(at)?;
        self.insert_promoted(at, populated)?;

        let promoted = self.ensure_size(at)?;
        Ok((true, promoted))
    }

    /// Collapse the child of `entries[idx]` if only its `End` entry remains.
    fn lift_node(&mut self, at: NodeRef, idx: usize) -> Result<Vec<IndexEntry>, IndexError> {
        let Some(child) = self
            .node(at)?
            .entries()
            .get(idx)
            .and_then(IndexEntry::child)
        else {
            return Ok(Vec::new());
        };

        self.descend(at, child)?;
        let child_node = self.get_block(child)?;
        if child_node.entries().len() == 1 {
            let end = child_node.entries()[0].clone();
            self.node(at)?.entries_mut()[idx].take_child_from(&end);
            if let Some(node) = end.child().and_then(|vcn| self.cache.get_mut(&vcn)) {
                node.set_parent(Some(at));
            }
            self.free_block(child)?;
            debug!(index = %self.name, vcn = child, "lifted empty index block");
        }

        let node = self.node(at)?;
        let entry = &node.entries()[idx];
        if entry.is_node() || entry.is_end() {
            return Ok(Vec::new());
        }

        // A separator left without a child belongs in the subtree that follows it.
        let entry = node.entries_mut().remove(idx);
        match node.entries().get(idx).and_then(IndexEntry::child) {
            Some(next) => {
                self.descend(at, next)?;
                self.add_entry(NodeRef::Block(next), entry)
            }
            None => {
                node.entries_mut().insert(idx, entry);
                Ok(Vec::new())
            }
        }
    }

    /// Give a bare `End` entry its predecessor's child, pushing the
    /// predecessor down into that subtree.
    fn populate_end(&mut self, at: NodeRef) -> Result<Vec<IndexEntry>, IndexError> {
        let node = self.node(at)?;
        let count = node.entries().len();
        if count < 2 {
            return Ok(Vec::new());
        }

        let last = &node.entries()[count - 1];
        let Some(child) = node.entries()[count - 2].child() else {
            return Ok(Vec::new());
        };
        if !last.is_end() || last.is_node() {
            return Ok(Vec::new());
        }

        let mut moved = node.entries_mut().remove(count - 2);
        node.entries_mut()[count - 2].set_child(child);
        moved.clear_child();

        self.descend(at, child)?;
        self.add_entry(NodeRef::Block(child), moved)
    }

    /// Key and value of the largest entry in the subtree at `at`.
    fn largest_key(&mut self, at: NodeRef) -> Result<Option<(Vec<u8>, Vec<u8>)>, IndexError> {
        let node = self.node(at)?;
        let entries = node.entries();
        let rightmost = entries.last().and_then(IndexEntry::child);
        let last_key = entries
            .len()
            .checked_sub(2)
            .map(|i| (entries[i].key_bytes().to_vec(), entries[i].data().to_vec()));

        if let Some(child) = rightmost {
            self.descend(at, child)?;
            if let Some(found) = self.largest_key(NodeRef::Block(child))? {
                return Ok(Some(found));
            }
        }
        Ok(last_key)
    }

    fn verify_node(
        &mut self,
        at: NodeRef,
        parent: Option<NodeRef>,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        reachable: &mut HashSet<Vcn>,
    ) -> Result<(), IndexError> {
        if let NodeRef::Block(vcn) = at {
            if !reachable.insert(vcn) {
                return Err(self.inconsistent(format!("block {vcn} is reachable twice")));
            }
            let node = self.get_block(vcn)?;
            let cached = node.parent();
            node.set_parent(parent);
            if cached.is_some() && cached != parent {
                return Err(self.inconsistent(format!(
                    "block {vcn} records parent {cached:?}, reached from {parent:?}"
                )));
            }
        }

        let (node, collator) = self.parts(at)?;
        let checked = check_node(node, collator, lower, upper);
        let children = checked.map_err(|message| self.inconsistent(format!("{at}: {message}")))?;

        for (child, low, high) in children {
            self.verify_node(
                NodeRef::Block(child),
                Some(at),
                low.as_deref(),
                high.as_deref(),
                reachable,
            )?;
        }
        Ok(())
    }
}

impl<H: IndexHost> std::fmt::Debug for Index<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("root_header", &self.root_header)
            .field("collator", &self.collator)
            .field("cached_blocks", &self.cache.len())
            .finish_non_exhaustive()
    }
}

type ChildBounds = (Vcn, Option<Vec<u8>>, Option<Vec<u8>>);

/// Check one node's sentinel, budget, uniformity and ordering against the
/// key range its parent allows. Returns its children with their key ranges.
fn check_node(
    node: &IndexNode,
    collator: &Collator,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
) -> Result<Vec<ChildBounds>, String> {
    let entries = node.entries();
    let Some((last, keyed)) = entries.split_last() else {
        return Err("node has no entries".to_string());
    };
    if !last.is_end() || keyed.iter().any(IndexEntry::is_end) {
        return Err("End entry is not last".to_string());
    }
    if node.is_over_budget() {
        return Err(format!(
            "{} bytes exceed the budget of {}",
            node.calc_size(),
            node.total_space_available()
        ));
    }
    if entries.iter().any(|entry| entry.is_node() != last.is_node()) {
        return Err("node mixes leaf and branch entries".to_string());
    }

    let mut previous = lower;
    for entry in keyed {
        let key = entry.key_bytes();
        // An absent lower bound sorts before every key.
        if collator.compare(previous, Some(key)) != std::cmp::Ordering::Less {
            return Err(format!("key {} is out of order", hex(key)));
        }
        previous = Some(key);
    }
    if let (Some(p), Some(u)) = (previous, upper) {
        if collator.compare_keys(p, u) != std::cmp::Ordering::Less {
            return Err(format!("key {} is not below its separator", hex(p)));
        }
    }

    let mut children = Vec::new();
    let mut low = lower.map(<[u8]>::to_vec);
    for entry in entries {
        let high = if entry.is_end() {
            upper.map(<[u8]>::to_vec)
        } else {
            Some(entry.key_bytes().to_vec())
        };
        if let Some(child) = entry.child() {
            children.push((child, low.clone(), high.clone()));
        }
        low = high;
    }
    Ok(children)
}

fn exhausted(node: &IndexNode, is_file_index: bool) -> IndexError {
    let entry_size = node
        .entries()
        .iter()
        .map(|entry| entry.size(is_file_index))
        .max()
        .unwrap_or_default();
    IndexError::Exhausted {
        entry_size,
        capacity: node.total_space_available(),
    }
}

/// `{key-->data}`, decoded for the catalog indexes whose layouts are known
/// and in hex otherwise.
fn describe_entry(index_name: &str, entry: &IndexEntry) -> String {
    let key = entry.key_bytes();
    let data = entry.data();

    let decoded = match index_name {
        FILE_INDEX_NAME => keys::file_name_from_key(key).zip(
            keys::split_file_reference(data).map(|(record, seq)| format!("{record}#{seq}")),
        ),
        "$SII" => <[u8; 4]>::try_from(key)
            .ok()
            .map(|id| (format!("id {}", u32::from_le_bytes(id)), hex(data))),
        "$SDH" => <[u8; 8]>::try_from(key).ok().map(|k| {
            let hash = u32::from_le_bytes([k[0], k[1], k[2], k[3]]);
            let id = u32::from_le_bytes([k[4], k[5], k[6], k[7]]);
            (format!("hash {hash:#010x} id {id}"), hex(data))
        }),
        _ => None,
    };

    let (key_text, data_text) = decoded.unwrap_or_else(|| (hex(key), hex(data)));
    format!("{{{key_text}-->{data_text}}}")
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
