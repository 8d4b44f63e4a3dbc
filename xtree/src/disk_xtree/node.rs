//! Node and entry model of the X-tree, plus the byte layout of node pages.
//!
//! A node page starts with a fixed 14 byte header (page id, leaf flag,
//! supernode flag, entry count, capacity) followed by the entries. Pages of
//! supernodes carry only the header; the full supernode is written to the
//! supernode region at commit time.

use std::io::Cursor;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::split_history::SplitHistory;
use super::splitter::SplitSorting;
use super::xtree_types::{ObjectId, PageId, XTreeError, XTreeResult};
use crate::bounding_box::{HyperBoundingBox, SpatialComparable};

// ============================================================================
// Entries
// ============================================================================

/// A data point stored in a leaf.
#[derive(Clone, Debug, PartialEq)]
pub struct LeafEntry {
    pub id: ObjectId,
    pub coords: Vec<f64>,
}

impl LeafEntry {
    pub fn new(id: ObjectId, coords: Vec<f64>) -> Self {
        Self { id, coords }
    }
}

impl SpatialComparable for LeafEntry {
    fn dimensionality(&self) -> usize {
        self.coords.len()
    }

    fn min(&self, d: usize) -> f64 {
        self.coords[d]
    }

    fn max(&self, d: usize) -> f64 {
        self.coords[d]
    }
}

/// Reference from a directory node to one child, with the child's bounding
/// box and the axes its subtree has been split along.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectoryEntry {
    pub child: PageId,
    pub mbr: HyperBoundingBox,
    pub history: SplitHistory,
}

impl DirectoryEntry {
    pub fn new(child: PageId, mbr: HyperBoundingBox) -> Self {
        let history = SplitHistory::new(mbr.dimensionality());
        Self {
            child,
            mbr,
            history,
        }
    }

    pub fn with_history(child: PageId, mbr: HyperBoundingBox, history: SplitHistory) -> Self {
        Self {
            child,
            mbr,
            history,
        }
    }
}

impl SpatialComparable for DirectoryEntry {
    fn dimensionality(&self) -> usize {
        self.mbr.dimensionality()
    }

    fn min(&self, d: usize) -> f64 {
        self.mbr.min(d)
    }

    fn max(&self, d: usize) -> f64 {
        self.mbr.max(d)
    }
}

/// An entry detached from its node, e.g. while it waits for reinsertion.
#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    Leaf(LeafEntry),
    Directory(DirectoryEntry),
}

/// The entries of a node; the variant decides whether the node is a leaf.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEntries {
    Leaf(Vec<LeafEntry>),
    Directory(Vec<DirectoryEntry>),
}

impl NodeEntries {
    fn len(&self) -> usize {
        match self {
            NodeEntries::Leaf(entries) => entries.len(),
            NodeEntries::Directory(entries) => entries.len(),
        }
    }
}

// ============================================================================
// Node
// ============================================================================

/// A leaf, directory or supernode page.
///
/// `capacity` counts the reserved overflow slot: a node holding `capacity`
/// entries has overflowed and must be repaired before the insertion ends.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    page_id: PageId,
    capacity: usize,
    supernode: bool,
    entries: NodeEntries,
}

impl Node {
    pub fn new_leaf(page_id: PageId, capacity: usize) -> Self {
        Self {
            page_id,
            capacity,
            supernode: false,
            entries: NodeEntries::Leaf(Vec::with_capacity(capacity)),
        }
    }

    pub fn new_directory(page_id: PageId, capacity: usize) -> Self {
        Self {
            page_id,
            capacity,
            supernode: false,
            entries: NodeEntries::Directory(Vec::with_capacity(capacity)),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn set_page_id(&mut self, page_id: PageId) {
        self.page_id = page_id;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.entries, NodeEntries::Leaf(_))
    }

    pub fn is_supernode(&self) -> bool {
        self.supernode
    }

    /// `true` once the overflow slot is in use.
    pub fn is_overflowing(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn entries(&self) -> &NodeEntries {
        &self.entries
    }

    pub fn leaf_entries(&self) -> XTreeResult<&[LeafEntry]> {
        match &self.entries {
            NodeEntries::Leaf(entries) => Ok(entries),
            NodeEntries::Directory(_) => Err(Self::kind_mismatch(self.page_id, "leaf")),
        }
    }

    pub fn directory_entries(&self) -> XTreeResult<&[DirectoryEntry]> {
        match &self.entries {
            NodeEntries::Directory(entries) => Ok(entries),
            NodeEntries::Leaf(_) => Err(Self::kind_mismatch(self.page_id, "directory")),
        }
    }

    pub fn directory_entry(&self, index: usize) -> XTreeResult<&DirectoryEntry> {
        let page_id = self.page_id;
        self.directory_entries()?.get(index).ok_or_else(|| {
            XTreeError::InvariantViolation(format!(
                "node {} has no entry at index {}",
                page_id, index
            ))
        })
    }

    pub fn directory_entry_mut(&mut self, index: usize) -> XTreeResult<&mut DirectoryEntry> {
        let page_id = self.page_id;
        match &mut self.entries {
            NodeEntries::Directory(entries) => entries.get_mut(index).ok_or_else(|| {
                XTreeError::InvariantViolation(format!(
                    "node {} has no entry at index {}",
                    page_id, index
                ))
            }),
            NodeEntries::Leaf(_) => Err(Self::kind_mismatch(page_id, "directory")),
        }
    }

    /// Appends a point; the overflow slot may be consumed.
    pub fn add_leaf_entry(&mut self, entry: LeafEntry) -> XTreeResult<usize> {
        self.check_room()?;
        let page_id = self.page_id;
        match &mut self.entries {
            NodeEntries::Leaf(entries) => {
                entries.push(entry);
                Ok(entries.len() - 1)
            }
            NodeEntries::Directory(_) => Err(Self::kind_mismatch(page_id, "leaf")),
        }
    }

    /// Appends a child reference; the overflow slot may be consumed.
    pub fn add_directory_entry(&mut self, entry: DirectoryEntry) -> XTreeResult<usize> {
        self.check_room()?;
        let page_id = self.page_id;
        match &mut self.entries {
            NodeEntries::Directory(entries) => {
                entries.push(entry);
                Ok(entries.len() - 1)
            }
            NodeEntries::Leaf(_) => Err(Self::kind_mismatch(page_id, "directory")),
        }
    }

    /// Bounding box of all entries, `None` for an empty node.
    pub fn compute_mbr(&self) -> Option<HyperBoundingBox> {
        match &self.entries {
            NodeEntries::Leaf(entries) => HyperBoundingBox::union_of(entries.iter()),
            NodeEntries::Directory(entries) => HyperBoundingBox::union_of(entries.iter()),
        }
    }

    /// Rewrites `entry`'s box to this node's box. Returns whether it changed.
    pub fn adjust_entry(&self, entry: &mut DirectoryEntry) -> XTreeResult<bool> {
        let mbr = self.compute_mbr().ok_or_else(|| {
            XTreeError::InvariantViolation(format!("node {} has no entries", self.page_id))
        })?;
        if entry.mbr == mbr {
            Ok(false)
        } else {
            entry.mbr = mbr;
            Ok(true)
        }
    }

    // ------------------------------------------------------------------------
    // Supernode transitions
    // ------------------------------------------------------------------------

    /// Turns an overflowing directory into a supernode of capacity `2C - 1`.
    pub fn make_supernode(&mut self) -> XTreeResult<usize> {
        if self.is_leaf() {
            return Err(XTreeError::InvalidOperation(format!(
                "leaf {} cannot become a supernode",
                self.page_id
            )));
        }
        if self.supernode {
            return Err(XTreeError::InvalidOperation(format!(
                "node {} already is a supernode",
                self.page_id
            )));
        }
        if !self.is_overflowing() {
            return Err(XTreeError::InvalidOperation(format!(
                "node {} is not overflowing",
                self.page_id
            )));
        }
        self.supernode = true;
        self.capacity = 2 * self.capacity - 1;
        Ok(self.capacity)
    }

    /// Grows an overflowing supernode from `C` to `2C - 1` entries.
    pub fn grow_supernode(&mut self) -> XTreeResult<usize> {
        if !self.supernode {
            return Err(XTreeError::InvalidOperation(format!(
                "node {} is not a supernode",
                self.page_id
            )));
        }
        if !self.is_overflowing() {
            return Err(XTreeError::InvalidOperation(format!(
                "supernode {} is not overflowing ({} of {} entries)",
                self.page_id,
                self.len(),
                self.capacity
            )));
        }
        self.capacity = 2 * self.capacity - 1;
        Ok(self.capacity)
    }

    /// `true` if a supernode holds fewer entries than its capacity minus one
    /// ordinary directory page and the entries fit the halved capacity with
    /// the overflow slot still free.
    pub fn has_supernode_underflow(&self, dir_capacity: usize) -> bool {
        self.supernode
            && self.len() + dir_capacity < self.capacity
            && self.len() < self.capacity / 2 + 1
    }

    /// Shrinks an underflowing supernode from `C` to `C / 2 + 1` entries.
    ///
    /// Refuses with [`XTreeError::InvariantViolation`] when the entries would
    /// not fit the smaller capacity.
    ///
    /// When the new capacity equals `dir_capacity` the node becomes an
    /// ordinary directory node again.
    pub fn shrink_supernode(&mut self, dir_capacity: usize) -> XTreeResult<usize> {
        if !self.supernode {
            return Err(XTreeError::InvalidOperation(format!(
                "node {} is not a supernode",
                self.page_id
            )));
        }
        if self.len() + dir_capacity >= self.capacity {
            return Err(XTreeError::InvalidOperation(format!(
                "supernode {} is not underflowing ({} of {} entries)",
                self.page_id,
                self.len(),
                self.capacity
            )));
        }
        let shrunk = self.capacity / 2 + 1;
        if self.len() >= shrunk {
            return Err(XTreeError::InvariantViolation(format!(
                "supernode {} holds {} entries, shrinking to {} would drop below its entry count",
                self.page_id,
                self.len(),
                shrunk
            )));
        }
        self.capacity = shrunk;
        if self.capacity == dir_capacity {
            self.supernode = false;
        }
        Ok(self.capacity)
    }

    // ------------------------------------------------------------------------
    // Splitting and reinsertion
    // ------------------------------------------------------------------------

    /// Reorders the entries as `sorting` says, keeps the first `split_point`
    /// and moves the rest into a new node with id `sibling_id`.
    pub fn split_off(&mut self, sorting: &SplitSorting, sibling_id: PageId) -> XTreeResult<Node> {
        if sorting.order.len() != self.len()
            || sorting.split_point == 0
            || sorting.split_point >= self.len()
        {
            return Err(XTreeError::InvariantViolation(format!(
                "split of node {} does not match its {} entries",
                self.page_id,
                self.len()
            )));
        }
        let sibling_entries = match &mut self.entries {
            NodeEntries::Leaf(entries) => {
                let (kept, moved) = reorder_and_split(entries, sorting);
                *entries = kept;
                NodeEntries::Leaf(moved)
            }
            NodeEntries::Directory(entries) => {
                let (kept, moved) = reorder_and_split(entries, sorting);
                *entries = kept;
                NodeEntries::Directory(moved)
            }
        };
        Ok(Node {
            page_id: sibling_id,
            capacity: self.capacity,
            supernode: false,
            entries: sibling_entries,
        })
    }

    /// Removes the `count` entries whose centres lie farthest from the centre
    /// of this node's box, returned farthest first.
    pub fn remove_farthest(&mut self, count: usize) -> XTreeResult<Vec<Entry>> {
        let center = self
            .compute_mbr()
            .ok_or_else(|| {
                XTreeError::InvariantViolation(format!("node {} has no entries", self.page_id))
            })?
            .center();
        let distance = |s: &dyn SpatialComparable| -> f64 {
            center
                .iter()
                .enumerate()
                .map(|(d, c)| {
                    let diff = (s.min(d) + s.max(d)) / 2.0 - c;
                    diff * diff
                })
                .sum()
        };

        let mut ranked: Vec<(usize, f64)> = match &self.entries {
            NodeEntries::Leaf(entries) => entries
                .iter()
                .enumerate()
                .map(|(i, e)| (i, distance(e)))
                .collect(),
            NodeEntries::Directory(entries) => entries
                .iter()
                .enumerate()
                .map(|(i, e)| (i, distance(e)))
                .collect(),
        };
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let order: Vec<usize> = ranked.iter().take(count).map(|(i, _)| *i).collect();

        let removed = match &mut self.entries {
            NodeEntries::Leaf(entries) => take_indices(entries, &order)
                .into_iter()
                .map(Entry::Leaf)
                .collect(),
            NodeEntries::Directory(entries) => take_indices(entries, &order)
                .into_iter()
                .map(Entry::Directory)
                .collect(),
        };
        Ok(removed)
    }

    /// Drops all entries past `len`.
    #[cfg(test)]
    pub fn truncate(&mut self, len: usize) {
        match &mut self.entries {
            NodeEntries::Leaf(entries) => entries.truncate(len),
            NodeEntries::Directory(entries) => entries.truncate(len),
        }
    }

    // ------------------------------------------------------------------------
    // Page codec
    // ------------------------------------------------------------------------

    /// Bytes stored on the node's own page. Supernodes write the header only.
    pub fn encode_page(&self) -> XTreeResult<Vec<u8>> {
        self.encode(!self.supernode)
    }

    /// Header plus every entry, used for the supernode region.
    pub fn encode_full(&self) -> XTreeResult<Vec<u8>> {
        self.encode(true)
    }

    /// Decodes a node page. A supernode page decodes to a stub without entries.
    pub fn decode_page(bytes: &[u8], dim: usize) -> XTreeResult<Node> {
        Self::decode(bytes, dim, false)
    }

    /// Decodes a node including the entries of supernodes.
    pub fn decode_full(bytes: &[u8], dim: usize) -> XTreeResult<Node> {
        Self::decode(bytes, dim, true)
    }

    /// Reads just the page header.
    pub fn peek_header(bytes: &[u8]) -> XTreeResult<NodePageHeader> {
        let mut cursor = Cursor::new(bytes);
        get(&mut cursor)
    }

    fn encode(&self, with_entries: bool) -> XTreeResult<Vec<u8>> {
        let header = NodePageHeader {
            page_id: self.page_id,
            is_leaf: self.is_leaf(),
            is_supernode: self.supernode,
            num_entries: self.len() as i32,
            capacity: self.capacity as i32,
        };
        let mut buf = Vec::new();
        put(&mut buf, &header)?;
        if !with_entries {
            return Ok(buf);
        }
        match &self.entries {
            NodeEntries::Leaf(entries) => {
                for entry in entries {
                    put(&mut buf, &entry.id)?;
                    for c in &entry.coords {
                        put(&mut buf, c)?;
                    }
                }
            }
            NodeEntries::Directory(entries) => {
                for entry in entries {
                    put(&mut buf, &entry.child)?;
                    for v in entry.mbr.min_coords().iter().chain(entry.mbr.max_coords()) {
                        put(&mut buf, v)?;
                    }
                    for word in entry.history.words() {
                        put(&mut buf, word)?;
                    }
                }
            }
        }
        Ok(buf)
    }

    fn decode(bytes: &[u8], dim: usize, supernode_entries: bool) -> XTreeResult<Node> {
        let mut cursor = Cursor::new(bytes);
        let header: NodePageHeader = get(&mut cursor)?;
        if header.num_entries < 0 || header.capacity < header.num_entries {
            return Err(XTreeError::Corrupted(format!(
                "page {} claims {} entries with capacity {}",
                header.page_id, header.num_entries, header.capacity
            )));
        }
        if header.is_leaf && header.is_supernode {
            return Err(XTreeError::Corrupted(format!(
                "page {} is flagged as a leaf supernode",
                header.page_id
            )));
        }
        let capacity = header.capacity as usize;
        let count = if header.is_supernode && !supernode_entries {
            0
        } else {
            header.num_entries as usize
        };

        let entries = if header.is_leaf {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let id: ObjectId = get(&mut cursor)?;
                let coords = (0..dim)
                    .map(|_| get::<f64>(&mut cursor))
                    .collect::<XTreeResult<Vec<_>>>()?;
                entries.push(LeafEntry { id, coords });
            }
            NodeEntries::Leaf(entries)
        } else {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let child: PageId = get(&mut cursor)?;
                let min = (0..dim)
                    .map(|_| get::<f64>(&mut cursor))
                    .collect::<XTreeResult<Vec<_>>>()?;
                let max = (0..dim)
                    .map(|_| get::<f64>(&mut cursor))
                    .collect::<XTreeResult<Vec<_>>>()?;
                let words = (0..SplitHistory::word_count(dim))
                    .map(|_| get::<u64>(&mut cursor))
                    .collect::<XTreeResult<Vec<_>>>()?;
                entries.push(DirectoryEntry {
                    child,
                    mbr: HyperBoundingBox::new(min, max),
                    history: SplitHistory::from_words(dim, &words),
                });
            }
            NodeEntries::Directory(entries)
        };

        Ok(Node {
            page_id: header.page_id,
            capacity,
            supernode: header.is_supernode,
            entries,
        })
    }

    fn check_room(&self) -> XTreeResult<()> {
        if self.len() >= self.capacity {
            return Err(XTreeError::InvariantViolation(format!(
                "node {} is full ({} entries)",
                self.page_id, self.capacity
            )));
        }
        Ok(())
    }

    fn kind_mismatch(page_id: PageId, expected: &str) -> XTreeError {
        XTreeError::InvariantViolation(format!("node {} is not a {} node", page_id, expected))
    }
}

/// Fixed header at the start of every node page and supernode block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePageHeader {
    pub page_id: PageId,
    pub is_leaf: bool,
    pub is_supernode: bool,
    pub num_entries: i32,
    pub capacity: i32,
}

fn put<T: Serialize>(buf: &mut Vec<u8>, value: &T) -> XTreeResult<()> {
    bincode::serde::encode_into_std_write(value, buf, bincode::config::legacy())?;
    Ok(())
}

fn get<T: DeserializeOwned>(cursor: &mut Cursor<&[u8]>) -> XTreeResult<T> {
    Ok(bincode::serde::decode_from_std_read(
        cursor,
        bincode::config::legacy(),
    )?)
}

fn reorder_and_split<T: Clone>(entries: &[T], sorting: &SplitSorting) -> (Vec<T>, Vec<T>) {
    let mut sorted: Vec<T> = sorting.order.iter().map(|&i| entries[i].clone()).collect();
    let moved = sorted.split_off(sorting.split_point);
    (sorted, moved)
}

fn take_indices<T>(entries: &mut Vec<T>, order: &[usize]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = entries.drain(..).map(Some).collect();
    let taken = order.iter().filter_map(|&i| slots[i].take()).collect();
    entries.extend(slots.into_iter().flatten());
    taken
}
