//! DiskXTree implementation.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::header::TreeHeader;
use super::integrity::{IntegrityReport, TreeSummary};
use super::node::{DirectoryEntry, Entry, LeafEntry, Node, NodeEntries};
use super::overflow::{overflow_treatment_for, OverflowTreatment};
use super::settings::{OverlapType, TreeParameters, XTreeSettings};
use super::split_history::SplitHistory;
use super::splitter::{DataCounter, SplitSorting, XSplitter};
use super::xtree_cache::PageCache;
use super::xtree_constants::ROOT_PAGE_ID;
use super::xtree_storage::{MemoryPageFile, PageFile, PersistentPageFile};
use super::xtree_types::{ObjectId, PageId, TreeStats, XTreeError, XTreeResult};
use crate::bounding_box::{HyperBoundingBox, SpatialComparable};

/// Path from the root to a node: `(page id, index of the node's entry in its
/// parent)` per level. The root's index is always 0.
pub type TreePath = Vec<(PageId, usize)>;

/// A disk-based X-tree over `D`-dimensional points.
///
/// Ordinary nodes live on fixed-size pages behind an LRU cache; supernodes
/// are held in memory and appended to the file on [`commit`](Self::commit).
/// Mutating operations take `&mut self`, so a tree has a single writer.
pub struct DiskXTree {
    store: Box<dyn PageFile>,
    cache: Mutex<PageCache>,
    /// Every current supernode, consulted before the cache
    supernodes: BTreeMap<PageId, Node>,
    settings: XTreeSettings,
    params: TreeParameters,
    height: usize,
    num_elements: u64,
    overflow: Box<dyn OverflowTreatment>,
    stats: TreeStatistics,
    closed: bool,
}

/// Internal statistics tracking
struct TreeStatistics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl TreeStatistics {
    fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }
}

impl DiskXTree {
    /// Create a new, empty X-tree file at the given path.
    ///
    /// The file starts with the tree header and a single empty leaf as root.
    pub fn create(path: impl AsRef<Path>, settings: XTreeSettings) -> XTreeResult<Self> {
        let params = settings.derive_parameters()?;
        let store = PersistentPageFile::create(path.as_ref(), settings.page_size)?;
        let mut tree = Self::assemble(Box::new(store), settings, params);
        tree.initialize_root()?;
        tree.store.write_header(&tree.header(0))?;
        tree.flush()?;
        debug!(
            "created X-tree at {} (dir capacity {}, leaf capacity {})",
            path.as_ref().display(),
            params.dir_capacity,
            params.leaf_capacity
        );
        Ok(tree)
    }

    /// Create an X-tree that lives in memory only. It cannot be committed.
    pub fn in_memory(settings: XTreeSettings) -> XTreeResult<Self> {
        let params = settings.derive_parameters()?;
        let store = MemoryPageFile::new(settings.page_size);
        let mut tree = Self::assemble(Box::new(store), settings, params);
        tree.initialize_root()?;
        Ok(tree)
    }

    /// Open an existing X-tree file with default runtime settings.
    pub fn open(path: impl AsRef<Path>) -> XTreeResult<Self> {
        Self::open_with_settings(path, XTreeSettings::default())
    }

    /// Open an existing X-tree file.
    ///
    /// Node sizing, dimensionality and the overlap criterion come from the
    /// file; `settings` contributes only the runtime options (cache size,
    /// reinsertion, overlap evaluation for supernodes). Only the header and
    /// the supernode region are read; ordinary pages load on demand.
    pub fn open_with_settings(
        path: impl AsRef<Path>,
        mut settings: XTreeSettings,
    ) -> XTreeResult<Self> {
        let store = PersistentPageFile::open(path.as_ref())?;
        let header = store.read_header()?;
        header.validate()?;

        let params = header.parameters();
        settings.dimensionality = header.dimensionality as usize;
        settings.page_size = header.page_size as usize;
        settings.dir_capacity = Some(params.dir_capacity);
        settings.leaf_capacity = Some(params.leaf_capacity);
        settings.max_overlap = header.max_overlap;
        settings.overlap_type = OverlapType::from_code(header.overlap_type)?;

        let page_size = header.page_size as u64;
        let region_len = store.region_len()?;
        let offset = header.supernode_offset as u64;
        let region_end = if offset > 0 { offset } else { region_len };
        let next_page_id = region_end / page_size;
        store.set_next_page_id(next_page_id as PageId);

        let mut tree = Self::assemble(Box::new(store), settings, params);
        tree.num_elements = header.num_elements as u64;
        if offset > 0 {
            tree.load_supernodes(offset, region_len)?;
        }
        tree.height = tree.compute_height()?;
        debug!(
            "opened X-tree at {}: {} elements, height {}, {} supernodes",
            path.as_ref().display(),
            tree.num_elements,
            tree.height,
            tree.supernodes.len()
        );
        Ok(tree)
    }

    fn assemble(
        store: Box<dyn PageFile>,
        settings: XTreeSettings,
        params: TreeParameters,
    ) -> Self {
        Self {
            cache: Mutex::new(PageCache::new(settings.cache_pages)),
            overflow: overflow_treatment_for(settings.reinsert_fraction),
            store,
            supernodes: BTreeMap::new(),
            settings,
            params,
            height: 0,
            num_elements: 0,
            stats: TreeStatistics::new(),
            closed: false,
        }
    }

    fn initialize_root(&mut self) -> XTreeResult<()> {
        let root_id = self.store.allocate_page();
        if root_id != ROOT_PAGE_ID {
            return Err(XTreeError::InvariantViolation(format!(
                "root allocated on page {}",
                root_id
            )));
        }
        let root = Node::new_leaf(root_id, self.params.leaf_capacity);
        self.write_node(&root)?;
        self.height = 1;
        Ok(())
    }

    /// Bulk loading is not available for X-trees.
    pub fn bulk_load<I>(&mut self, _entries: I) -> XTreeResult<()>
    where
        I: IntoIterator<Item = LeafEntry>,
    {
        Err(XTreeError::Unsupported(
            "bulk loading is not supported by the X-tree".to_string(),
        ))
    }

    /// Check if tree is closed
    fn check_closed(&self) -> XTreeResult<()> {
        if self.closed {
            Err(XTreeError::Closed)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn settings(&self) -> &XTreeSettings {
        &self.settings
    }

    pub fn dir_capacity(&self) -> usize {
        self.params.dir_capacity
    }

    pub fn leaf_capacity(&self) -> usize {
        self.params.leaf_capacity
    }

    pub fn dir_minimum(&self) -> usize {
        self.params.dir_minimum
    }

    pub fn leaf_minimum(&self) -> usize {
        self.params.leaf_minimum
    }

    pub fn min_fanout(&self) -> usize {
        self.params.min_fanout
    }

    pub fn max_overlap(&self) -> f32 {
        self.settings.max_overlap
    }

    pub fn overlap_type(&self) -> OverlapType {
        self.settings.overlap_type
    }

    pub fn dimensionality(&self) -> usize {
        self.settings.dimensionality
    }

    /// Number of points stored in the tree.
    pub fn num_elements(&self) -> u64 {
        self.num_elements
    }

    /// Levels of the tree; a lone root leaf has height 1.
    pub fn height(&self) -> usize {
        self.height
    }

    /// The registered supernodes in page order.
    pub fn get_supernodes(&self) -> Vec<&Node> {
        self.supernodes.values().collect()
    }

    /// Get comprehensive statistics
    pub fn stats(&self) -> TreeStats {
        TreeStats {
            num_elements: self.num_elements,
            height: self.height as u32,
            supernodes: self.supernodes.len() as u64,
            cached_pages: self.cache.lock().len() as u64,
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            page_reads: self.store.reads(),
            page_writes: self.store.writes(),
        }
    }

    // ========================================================================
    // Node access
    // ========================================================================

    /// Read a node: supernode registry first, then the cache, then the page
    /// store.
    pub fn get_node(&self, page_id: PageId) -> XTreeResult<Node> {
        if let Some(node) = self.supernodes.get(&page_id) {
            return Ok(node.clone());
        }
        {
            let mut cache = self.cache.lock();
            if let Some(node) = cache.get(page_id) {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(node.clone());
            }
        }

        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        let bytes = self.store.read_page(page_id)?;
        let node = Node::decode_page(&bytes, self.dimensionality())?;
        if node.page_id() != page_id {
            return Err(XTreeError::Corrupted(format!(
                "page {} holds node {}",
                page_id,
                node.page_id()
            )));
        }
        if node.is_supernode() {
            return Err(XTreeError::Corrupted(format!(
                "supernode {} is missing from the supernode region",
                page_id
            )));
        }
        self.cache_node(node.clone(), false)?;
        Ok(node)
    }

    /// Store a node. Supernodes go to the registry and leave a header-only
    /// stub on their page; other nodes go to the cache as dirty.
    fn write_node(&mut self, node: &Node) -> XTreeResult<()> {
        let page_id = node.page_id();
        if node.is_supernode() {
            self.cache.lock().remove(page_id);
            self.store.write_page(page_id, &node.encode_page()?)?;
            self.supernodes.insert(page_id, node.clone());
            Ok(())
        } else {
            self.supernodes.remove(&page_id);
            self.cache_node(node.clone(), true)
        }
    }

    /// Add a node to cache, handling eviction if necessary.
    /// Evicted dirty pages are written to the page store.
    fn cache_node(&self, node: Node, dirty: bool) -> XTreeResult<()> {
        let mut cache = self.cache.lock();
        while cache.needs_eviction() {
            match cache.evict_oldest() {
                Some((evict_id, evicted, true)) => {
                    self.store.write_page(evict_id, &evicted.encode_page()?)?;
                }
                Some(_) => {}
                None => break,
            }
        }
        cache.insert(node.page_id(), node, dirty);
        Ok(())
    }

    fn write_dirty_pages(&self) -> XTreeResult<()> {
        let mut cache = self.cache.lock();
        for page_id in cache.dirty_pages() {
            if let Some(node) = cache.peek(page_id) {
                self.store.write_page(page_id, &node.encode_page()?)?;
            }
            cache.mark_clean(page_id);
        }
        Ok(())
    }

    /// Write all dirty pages to the page store and sync it.
    ///
    /// Supernodes and the header are written by [`commit`](Self::commit) only.
    pub fn flush(&self) -> XTreeResult<()> {
        self.check_closed()?;
        self.write_dirty_pages()?;
        self.store.sync()
    }

    fn node_level(&self, path: &[(PageId, usize)]) -> usize {
        self.height - (path.len() - 1)
    }

    // ========================================================================
    // Insertion
    // ========================================================================

    /// Insert one data point.
    pub fn insert(&mut self, entry: LeafEntry) -> XTreeResult<()> {
        self.check_closed()?;
        self.check_point(&entry.coords)?;
        self.overflow.reinitialize();
        self.insert_leaf_entry(entry)?;
        self.num_elements += 1;
        Ok(())
    }

    /// Insert a point given by id and coordinates.
    pub fn insert_point(&mut self, id: ObjectId, coords: &[f64]) -> XTreeResult<()> {
        self.insert(LeafEntry::new(id, coords.to_vec()))
    }

    fn check_point(&self, coords: &[f64]) -> XTreeResult<()> {
        if coords.len() != self.dimensionality() {
            return Err(XTreeError::InvalidOperation(format!(
                "point has {} coordinates, tree has {} dimensions",
                coords.len(),
                self.dimensionality()
            )));
        }
        if let Some(bad) = coords.iter().find(|c| !c.is_finite()) {
            return Err(XTreeError::InvalidGeometry(format!(
                "coordinate {} is not finite",
                bad
            )));
        }
        Ok(())
    }

    fn insert_leaf_entry(&mut self, entry: LeafEntry) -> XTreeResult<()> {
        let mbr = HyperBoundingBox::from_point(&entry.coords);
        let path = self.choose_insertion_path(&mbr, 1)?;
        let mut node = self.get_node(Self::last_page(&path)?)?;
        node.add_leaf_entry(entry)?;
        self.finish_insertion(node, path, &mbr)
    }

    /// Insert a child reference into a node at `level`.
    fn insert_directory_entry(&mut self, entry: DirectoryEntry, level: usize) -> XTreeResult<()> {
        let mbr = entry.mbr.clone();
        let path = self.choose_insertion_path(&mbr, level)?;
        let mut node = self.get_node(Self::last_page(&path)?)?;
        node.add_directory_entry(entry)?;
        self.finish_insertion(node, path, &mbr)
    }

    fn finish_insertion(
        &mut self,
        node: Node,
        path: TreePath,
        mbr: &HyperBoundingBox,
    ) -> XTreeResult<()> {
        let overflowing = node.is_overflowing();
        self.write_node(&node)?;
        if !overflowing {
            if path.len() == 1 {
                return Ok(());
            }
            let (parent_id, _) = path[path.len() - 2];
            let (_, index) = path[path.len() - 1];
            let parent = self.get_node(parent_id)?;
            if parent.directory_entry(index)?.mbr.contains(mbr) {
                return Ok(());
            }
        }
        self.adjust_tree(path)
    }

    fn last_page(path: &[(PageId, usize)]) -> XTreeResult<PageId> {
        path.last()
            .map(|(page_id, _)| *page_id)
            .ok_or_else(|| XTreeError::InvariantViolation("empty tree path".to_string()))
    }

    /// Descend from the root to the node at `level` best suited to receive
    /// an entry with box `mbr`. Leaves are level 1.
    pub fn choose_insertion_path(
        &self,
        mbr: &HyperBoundingBox,
        level: usize,
    ) -> XTreeResult<TreePath> {
        if level == 0 || level > self.height {
            return Err(XTreeError::InvalidOperation(format!(
                "level {} does not exist in a tree of height {}",
                level, self.height
            )));
        }
        let mut path: TreePath = vec![(ROOT_PAGE_ID, 0)];
        loop {
            let node_level = self.node_level(&path);
            if node_level == level {
                return Ok(path);
            }
            let node = self.get_node(Self::last_page(&path)?)?;
            let entries = node.directory_entries()?;
            let index = self.choose_subtree(&node, entries, mbr, node_level)?;
            trace!(
                "routing {} at level {}: node {} entry {}",
                mbr,
                node_level,
                node.page_id(),
                index
            );
            path.push((entries[index].child, index));
        }
    }

    fn choose_subtree(
        &self,
        node: &Node,
        entries: &[DirectoryEntry],
        mbr: &HyperBoundingBox,
        node_level: usize,
    ) -> XTreeResult<usize> {
        if entries.is_empty() {
            return Err(XTreeError::InvariantViolation(format!(
                "directory node {} has no entries",
                node.page_id()
            )));
        }

        // a containing child needs no enlargement; take the smallest
        let mut contained: Option<(usize, f64)> = None;
        for (i, entry) in entries.iter().enumerate() {
            if entry.mbr.contains(mbr) {
                let volume = entry.mbr.volume();
                if contained.map_or(true, |(_, best)| volume < best) {
                    contained = Some((i, volume));
                }
            }
        }
        if let Some((index, _)) = contained {
            return Ok(index);
        }

        let test_overlap = node_level == 2
            && !(self.settings.omit_overlap_increase_for_supernodes && node.is_supernode());

        let mut best_index = 0;
        let mut best = (f64::INFINITY, f64::INFINITY, f64::INFINITY);
        for (i, entry) in entries.iter().enumerate() {
            let test_mbr = entry.mbr.union(mbr);
            let overlap_inc = if test_overlap {
                overlap_increase(entries, i, &test_mbr)
            } else {
                0.0
            };
            let volume = entry.mbr.volume();
            let volume_inc = test_mbr.volume() - volume;
            for (what, value) in [
                ("overlap increase", overlap_inc),
                ("volume", volume),
                ("volume increase", volume_inc),
            ] {
                if !value.is_finite() {
                    return Err(XTreeError::InvalidGeometry(format!(
                        "{} of entry {} in node {} is {}",
                        what,
                        i,
                        node.page_id(),
                        value
                    )));
                }
            }
            let candidate = (overlap_inc, volume_inc, volume);
            if candidate < best {
                best = candidate;
                best_index = i;
            }
        }
        Ok(best_index)
    }

    // ========================================================================
    // Tree repair
    // ========================================================================

    /// Repair the tree bottom-up from the node at the end of `path`:
    /// resolve overflows by reinsertion, splitting or supernode growth and
    /// bring every parent entry's box up to date.
    pub fn adjust_tree(&mut self, mut path: TreePath) -> XTreeResult<()> {
        while let Some(&(page_id, index)) = path.last() {
            let is_root = path.len() == 1;
            let level = self.node_level(&path);
            let mut node = self.get_node(page_id)?;

            if !node.is_overflowing() {
                if is_root {
                    return Ok(());
                }
                let changed = self.adjust_parent_entry(&path, &node)?;
                if !(node.is_leaf() || changed) {
                    return Ok(());
                }
                path.pop();
                continue;
            }

            if node.is_supernode() {
                let capacity = node.grow_supernode()?;
                debug!("supernode {} grown to capacity {}", page_id, capacity);
                self.write_node(&node)?;
                if is_root || !self.adjust_parent_entry(&path, &node)? {
                    return Ok(());
                }
                path.pop();
                continue;
            }

            let count = self.overflow.reinsert_count(level, is_root, node.len());
            if count > 0 {
                return self.reinsert(node, path, level, count);
            }

            match self.split(&mut node)? {
                None => {
                    if is_root || !self.adjust_parent_entry(&path, &node)? {
                        return Ok(());
                    }
                    path.pop();
                }
                Some((sibling, axis)) if is_root => {
                    return self.create_new_root(node, sibling, axis);
                }
                Some((sibling, axis)) => {
                    let (parent_id, _) = path[path.len() - 2];
                    let mut parent = self.get_node(parent_id)?;
                    let entry = parent.directory_entry_mut(index)?;
                    let sibling_history = entry.history.clone();
                    entry.history.add(axis);
                    node.adjust_entry(entry)?;
                    let sibling_mbr = Self::node_mbr(&sibling)?;
                    parent.add_directory_entry(DirectoryEntry::with_history(
                        sibling.page_id(),
                        sibling_mbr,
                        sibling_history,
                    ))?;
                    self.write_node(&parent)?;
                    path.pop();
                }
            }
        }
        Ok(())
    }

    /// Rewrite the entry for the node at the end of `path` in its parent.
    /// Returns whether the box changed.
    fn adjust_parent_entry(&mut self, path: &[(PageId, usize)], node: &Node) -> XTreeResult<bool> {
        let (parent_id, _) = path[path.len() - 2];
        let (_, index) = path[path.len() - 1];
        let mut parent = self.get_node(parent_id)?;
        let changed = node.adjust_entry(parent.directory_entry_mut(index)?)?;
        if changed {
            self.write_node(&parent)?;
        }
        Ok(changed)
    }

    fn node_mbr(node: &Node) -> XTreeResult<HyperBoundingBox> {
        node.compute_mbr().ok_or_else(|| {
            XTreeError::InvariantViolation(format!("node {} has no entries", node.page_id()))
        })
    }

    /// Split an overflowing node.
    ///
    /// Returns the new sibling and the split axis, or `None` when the node
    /// was turned into a supernode instead. Both outcomes are written.
    fn split(&mut self, node: &mut Node) -> XTreeResult<Option<(Node, usize)>> {
        match self.compute_split(node)? {
            Some(sorting) => {
                let sibling_id = self.store.allocate_page();
                let sibling = node.split_off(&sorting, sibling_id)?;
                debug!(
                    "split {} node {} on axis {}: {} / {} entries, sibling {}",
                    if node.is_leaf() { "leaf" } else { "directory" },
                    node.page_id(),
                    sorting.axis,
                    node.len(),
                    sibling.len(),
                    sibling_id
                );
                self.write_node(node)?;
                self.write_node(&sibling)?;
                Ok(Some((sibling, sorting.axis)))
            }
            None if node.is_leaf() => Err(XTreeError::InvariantViolation(format!(
                "no split found for leaf {}",
                node.page_id()
            ))),
            None => {
                let capacity = node.make_supernode()?;
                debug!(
                    "node {} became a supernode of capacity {}",
                    node.page_id(),
                    capacity
                );
                self.write_node(node)?;
                Ok(None)
            }
        }
    }

    fn compute_split(&self, node: &Node) -> XTreeResult<Option<SplitSorting>> {
        match node.entries() {
            NodeEntries::Leaf(entries) => {
                let counter: &DataCounter<'_, LeafEntry> =
                    &|e: &LeafEntry, window: &HyperBoundingBox| {
                        Ok((1, usize::from(window.contains(e))))
                    };
                let mut splitter = XSplitter::new(
                    entries,
                    self.params,
                    true,
                    self.settings.max_overlap,
                    self.settings.overlap_type,
                    counter,
                );
                splitter.topological_split()
            }
            NodeEntries::Directory(entries) => {
                let counter: &DataCounter<'_, DirectoryEntry> =
                    &|e: &DirectoryEntry, window: &HyperBoundingBox| {
                        self.count_data(e.child, window)
                    };
                let mut splitter = XSplitter::new(
                    entries,
                    self.params,
                    false,
                    self.settings.max_overlap,
                    self.settings.overlap_type,
                    counter,
                );
                if let Some(sorting) = splitter.topological_split()? {
                    return Ok(Some(sorting));
                }
                let common = SplitHistory::common_dimensions(entries.iter().map(|e| &e.history));
                splitter.minimum_overlap_split(common)
            }
        }
    }

    /// `(objects below page_id, objects inside window)`
    fn count_data(
        &self,
        page_id: PageId,
        window: &HyperBoundingBox,
    ) -> XTreeResult<(usize, usize)> {
        let node = self.get_node(page_id)?;
        match node.entries() {
            NodeEntries::Leaf(entries) => Ok((
                entries.len(),
                entries.iter().filter(|e| window.contains(*e)).count(),
            )),
            NodeEntries::Directory(entries) => {
                let mut total = 0;
                let mut inside = 0;
                for entry in entries {
                    let (t, i) = self.count_data(entry.child, window)?;
                    total += t;
                    inside += i;
                }
                Ok((total, inside))
            }
        }
    }

    /// Move the split root to a fresh page and put a new root above it and
    /// its sibling.
    fn create_new_root(&mut self, mut old_root: Node, sibling: Node, axis: usize) -> XTreeResult<()> {
        let moved_id = self.store.allocate_page();
        old_root.set_page_id(moved_id);
        self.write_node(&old_root)?;

        let mut history = SplitHistory::new(self.dimensionality());
        history.add(axis);
        let mut root = Node::new_directory(ROOT_PAGE_ID, self.params.dir_capacity);
        root.add_directory_entry(DirectoryEntry::with_history(
            moved_id,
            Self::node_mbr(&old_root)?,
            history,
        ))?;
        root.add_directory_entry(DirectoryEntry::new(
            sibling.page_id(),
            Self::node_mbr(&sibling)?,
        ))?;
        self.write_node(&root)?;
        self.height += 1;
        debug!(
            "new root above nodes {} and {}, height now {}",
            moved_id,
            sibling.page_id(),
            self.height
        );
        Ok(())
    }

    /// Remove the `count` entries farthest from the node's centre, fix the
    /// boxes above and insert the entries again at the same level.
    fn reinsert(
        &mut self,
        mut node: Node,
        mut path: TreePath,
        level: usize,
        count: usize,
    ) -> XTreeResult<()> {
        let removed = node.remove_farthest(count)?;
        debug!(
            "reinserting {} entries of node {} at level {}",
            removed.len(),
            node.page_id(),
            level
        );
        self.write_node(&node)?;

        let mut current = node;
        while path.len() > 1 {
            if !self.adjust_parent_entry(&path, &current)? {
                break;
            }
            path.pop();
            current = self.get_node(Self::last_page(&path)?)?;
        }

        for entry in removed {
            match entry {
                Entry::Leaf(e) => self.insert_leaf_entry(e)?,
                Entry::Directory(e) => self.insert_directory_entry(e, level)?,
            }
        }
        Ok(())
    }

    /// Apply the underflow rules to a node.
    ///
    /// A supernode with at least one directory page's worth of free slots
    /// shrinks to `C / 2 + 1` entries, provided its entries still fit with the
    /// overflow slot free, and is demoted once that equals the directory
    /// capacity. Supernodes never report an underflow. Other nodes report
    /// whether they hold fewer entries than their minimum.
    pub fn check_underflow(&mut self, page_id: PageId) -> XTreeResult<bool> {
        self.check_closed()?;
        let mut node = self.get_node(page_id)?;
        if node.is_leaf() {
            return Ok(node.len() < self.params.leaf_minimum);
        }
        if !node.is_supernode() {
            return Ok(node.len() < self.params.dir_minimum);
        }
        if node.has_supernode_underflow(self.params.dir_capacity) {
            let capacity = node.shrink_supernode(self.params.dir_capacity)?;
            if node.is_supernode() {
                debug!("supernode {} shrunk to capacity {}", page_id, capacity);
            } else {
                debug!("supernode {} demoted to a directory node", page_id);
            }
            self.write_node(&node)?;
        }
        Ok(false)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    fn header(&self, supernode_offset: u64) -> TreeHeader {
        let mut header = TreeHeader::new(&self.settings, &self.params);
        header.num_elements = self.num_elements as i64;
        header.supernode_offset = supernode_offset as i64;
        header
    }

    /// Write dirty pages, then every supernode behind the last allocated page,
    /// then the header. Returns the number of supernode bytes written.
    pub fn commit(&mut self) -> XTreeResult<u64> {
        self.check_closed()?;
        if !self.store.is_persistent() {
            return Err(XTreeError::NotPersistent);
        }
        self.write_dirty_pages()?;

        let page_size = self.store.page_size() as u64;
        let offset = self.store.next_page_id() as u64 * page_size;
        self.store.truncate_region(offset)?;

        let mut position = offset;
        for node in self.supernodes.values() {
            let pages = node.capacity().div_ceil(self.params.dir_capacity) as u64;
            let mut block = node.encode_full()?;
            if block.len() as u64 > pages * page_size {
                return Err(XTreeError::Serialization(format!(
                    "supernode {} needs {} bytes, its {} pages hold {}",
                    node.page_id(),
                    block.len(),
                    pages,
                    pages * page_size
                )));
            }
            block.resize((pages * page_size) as usize, 0);
            self.store.write_region(position, &block)?;
            position += pages * page_size;
        }

        self.store.write_header(&self.header(offset))?;
        self.store.sync()?;
        let written = position - offset;
        debug!(
            "committed {} elements, {} supernodes ({} bytes) at offset {}",
            self.num_elements,
            self.supernodes.len(),
            written,
            offset
        );
        Ok(written)
    }

    fn load_supernodes(&mut self, offset: u64, region_len: u64) -> XTreeResult<()> {
        let page_size = self.store.page_size() as u64;
        let mut position = offset;
        while position + page_size <= region_len {
            let first = self.store.read_region(position, page_size as usize)?;
            let header = Node::peek_header(&first)?;
            if !header.is_supernode || header.capacity <= 0 {
                return Err(XTreeError::Corrupted(format!(
                    "page {} at offset {} in the supernode region is not a supernode",
                    header.page_id, position
                )));
            }
            let pages = (header.capacity as usize).div_ceil(self.params.dir_capacity) as u64;
            let bytes = self
                .store
                .read_region(position, (pages * page_size) as usize)?;
            let node = Node::decode_full(&bytes, self.dimensionality())?;
            self.supernodes.insert(node.page_id(), node);
            position += pages * page_size;
        }
        debug!("loaded {} supernodes", self.supernodes.len());
        Ok(())
    }

    /// Count levels by following first entries down to a leaf.
    fn compute_height(&self) -> XTreeResult<usize> {
        let mut height = 1;
        let mut node = self.get_node(ROOT_PAGE_ID)?;
        while !node.is_leaf() {
            let child = node.directory_entry(0)?.child;
            node = self.get_node(child)?;
            height += 1;
        }
        Ok(height)
    }

    /// Commit (persistent trees) or flush (in-memory trees) and refuse
    /// further operations.
    pub fn close(&mut self) -> XTreeResult<()> {
        if self.closed {
            return Ok(());
        }
        if self.store.is_persistent() {
            self.commit()?;
        } else {
            self.flush()?;
        }
        self.closed = true;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Ids of all points inside `window` (boundary included).
    pub fn range_query(&self, window: &HyperBoundingBox) -> XTreeResult<Vec<ObjectId>> {
        self.check_closed()?;
        if window.dimensionality() != self.dimensionality() {
            return Err(XTreeError::InvalidOperation(format!(
                "query box has {} dimensions, tree has {}",
                window.dimensionality(),
                self.dimensionality()
            )));
        }
        let mut results = Vec::new();
        let mut stack = vec![ROOT_PAGE_ID];
        while let Some(page_id) = stack.pop() {
            let node = self.get_node(page_id)?;
            match node.entries() {
                NodeEntries::Leaf(entries) => results.extend(
                    entries
                        .iter()
                        .filter(|e| window.contains(*e))
                        .map(|e| e.id),
                ),
                NodeEntries::Directory(entries) => stack.extend(
                    entries
                        .iter()
                        .filter(|e| window.intersects(&e.mbr))
                        .map(|e| e.child),
                ),
            }
        }
        Ok(results)
    }

    /// The `k` points nearest to `point` with their Euclidean distances,
    /// nearest first.
    pub fn knn_query(&self, point: &[f64], k: usize) -> XTreeResult<Vec<(ObjectId, f64)>> {
        self.check_closed()?;
        self.check_point(point)?;
        let mut results = Vec::with_capacity(k.min(self.num_elements as usize));
        if k == 0 {
            return Ok(results);
        }

        let mut queue = BinaryHeap::new();
        queue.push(Candidate {
            dist_sq: 0.0,
            item: Item::Node(ROOT_PAGE_ID),
        });
        while let Some(Candidate { dist_sq, item }) = queue.pop() {
            match item {
                Item::Object(id) => {
                    results.push((id, dist_sq.sqrt()));
                    if results.len() == k {
                        break;
                    }
                }
                Item::Node(page_id) => match self.get_node(page_id)?.entries() {
                    NodeEntries::Leaf(entries) => {
                        for entry in entries {
                            let dist_sq: f64 = entry
                                .coords
                                .iter()
                                .zip(point)
                                .map(|(a, b)| (a - b) * (a - b))
                                .sum();
                            queue.push(Candidate {
                                dist_sq,
                                item: Item::Object(entry.id),
                            });
                        }
                    }
                    NodeEntries::Directory(entries) => {
                        for entry in entries {
                            queue.push(Candidate {
                                dist_sq: entry.mbr.min_dist_sq(point),
                                item: Item::Node(entry.child),
                            });
                        }
                    }
                },
            }
        }
        Ok(results)
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Walk the whole tree and check its structural invariants.
    ///
    /// Checked: every directory entry's box equals its child's box, no node
    /// is left overflowing, supernode flags match capacities, all leaves are
    /// on level 1 and the leaves hold exactly `num_elements` points.
    pub fn check_integrity(&self) -> XTreeResult<IntegrityReport> {
        self.check_closed()?;
        let mut report = IntegrityReport::new();
        self.check_subtree(ROOT_PAGE_ID, self.height, None, &mut report);
        if report.objects_found != self.num_elements {
            report.fail(
                ROOT_PAGE_ID,
                format!(
                    "tree holds {} objects, element count is {}",
                    report.objects_found, self.num_elements
                ),
            );
        }
        Ok(report)
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        level: usize,
        expected: Option<&HyperBoundingBox>,
        report: &mut IntegrityReport,
    ) {
        let node = match self.get_node(page_id) {
            Ok(node) => node,
            Err(e) => {
                report.fail(page_id, format!("unreadable: {}", e));
                return;
            }
        };
        report.pages_checked += 1;

        if node.is_overflowing() {
            report.fail(
                page_id,
                format!("{} entries with capacity {}", node.len(), node.capacity()),
            );
        }
        if node.is_leaf() != (level == 1) {
            report.fail(
                page_id,
                format!("found on level {} with leaf flag {}", level, node.is_leaf()),
            );
            return;
        }
        if let Some(expected) = expected {
            match node.compute_mbr() {
                Some(mbr) if &mbr == expected => {}
                Some(mbr) => report.fail(
                    page_id,
                    format!("parent entry {} differs from node box {}", expected, mbr),
                ),
                None => report.fail(page_id, "empty non-root node".to_string()),
            }
        }

        match node.entries() {
            NodeEntries::Leaf(entries) => {
                report.objects_found += entries.len() as u64;
                if node.capacity() != self.params.leaf_capacity {
                    report.fail(page_id, format!("leaf capacity {}", node.capacity()));
                }
            }
            NodeEntries::Directory(entries) => {
                let consistent = if node.is_supernode() {
                    node.capacity() > self.params.dir_capacity
                        && self.supernodes.contains_key(&page_id)
                } else {
                    node.capacity() == self.params.dir_capacity
                };
                if !consistent {
                    report.fail(
                        page_id,
                        format!(
                            "capacity {} does not match supernode flag {}",
                            node.capacity(),
                            node.is_supernode()
                        ),
                    );
                }
                for entry in entries {
                    self.check_subtree(entry.child, level - 1, Some(&entry.mbr), report);
                }
            }
        }
    }

    /// Count nodes per kind, objects and the storage quota.
    pub fn summary(&self) -> XTreeResult<TreeSummary> {
        self.check_closed()?;
        let mut summary = TreeSummary {
            levels: self.height,
            dimensionality: self.dimensionality(),
            directory_nodes: 0,
            supernodes: 0,
            min_supernode_capacity: None,
            max_supernode_capacity: None,
            leaf_nodes: 0,
            objects: 0,
            total_capacity: 0,
            dir_capacity: self.params.dir_capacity,
            dir_minimum: self.params.dir_minimum,
            leaf_capacity: self.params.leaf_capacity,
            leaf_minimum: self.params.leaf_minimum,
            min_fanout: self.params.min_fanout,
            max_overlap: self.settings.max_overlap,
            overlap_type: self.settings.overlap_type,
        };

        let mut queue = VecDeque::from([ROOT_PAGE_ID]);
        while let Some(page_id) = queue.pop_front() {
            let node = self.get_node(page_id)?;
            summary.total_capacity += node.capacity() as u64;
            match node.entries() {
                NodeEntries::Leaf(entries) => {
                    summary.leaf_nodes += 1;
                    summary.objects += entries.len() as u64;
                }
                NodeEntries::Directory(entries) => {
                    if node.is_supernode() {
                        let capacity = node.capacity();
                        summary.supernodes += 1;
                        summary.min_supernode_capacity =
                            Some(summary.min_supernode_capacity.map_or(capacity, |c| c.min(capacity)));
                        summary.max_supernode_capacity =
                            Some(summary.max_supernode_capacity.map_or(capacity, |c| c.max(capacity)));
                    } else {
                        summary.directory_nodes += 1;
                    }
                    queue.extend(entries.iter().map(|e| e.child));
                }
            }
        }
        Ok(summary)
    }
}

/// Sum over the siblings of entry `index` of the overlap volume they gain
/// when the entry grows to `test`.
///
/// Axes the growth leaves untouched contribute a constant factor, so the old
/// and new overlap are only multiplied out on the changed axes.
fn overlap_increase(entries: &[DirectoryEntry], index: usize, test: &HyperBoundingBox) -> f64 {
    let current = &entries[index].mbr;
    let dim = current.dimensionality();
    let changed: Vec<bool> = (0..dim)
        .map(|d| current.min(d) > test.min(d) || current.max(d) < test.max(d))
        .collect();

    let mut increase = 0.0;
    for (j, other) in entries.iter().enumerate() {
        if j == index {
            continue;
        }
        let mut constant = 1.0;
        let mut old_overlap = 1.0;
        let mut new_overlap = 1.0;
        let mut disjoint = false;
        for (d, &axis_changed) in changed.iter().enumerate() {
            let (lo, hi) = (other.mbr.min(d), other.mbr.max(d));
            if axis_changed {
                if test.min(d) > hi || test.max(d) < lo {
                    disjoint = true;
                    break;
                }
                new_overlap *= test.max(d).min(hi) - test.min(d).max(lo);
                if old_overlap != 0.0 {
                    old_overlap *= (current.max(d).min(hi) - current.min(d).max(lo)).max(0.0);
                }
            } else {
                if current.min(d) > hi || current.max(d) < lo {
                    disjoint = true;
                    break;
                }
                constant *= current.max(d).min(hi) - current.min(d).max(lo);
            }
        }
        if !disjoint && constant != 0.0 {
            increase += constant * (new_overlap - old_overlap);
        }
    }
    increase
}

// ============================================================================
// Nearest neighbour queue
// ============================================================================

enum Item {
    Node(PageId),
    Object(ObjectId),
}

/// Queue element ordered so the smallest distance pops first.
struct Candidate {
    dist_sq: f64,
    item: Item,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.dist_sq.total_cmp(&self.dist_sq)
    }
}

// ============================================================================
// Drop Implementation
// ============================================================================

impl Drop for DiskXTree {
    fn drop(&mut self) {
        // Best effort commit on drop
        if !self.closed {
            if let Err(e) = self.close() {
                warn!("closing X-tree on drop failed: {}", e);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Two-dimensional tree with ten entries per node and no reinsertion.
    fn small_settings() -> XTreeSettings {
        XTreeSettings::new(2)
            .with_dir_capacity(10)
            .with_leaf_capacity(10)
            .with_reinsert_fraction(0.0)
    }

    /// Writes a leaf holding the corners and the centre of `[lo, hi]²`.
    fn corner_leaf(tree: &mut DiskXTree, lo: f64, hi: f64, first_id: ObjectId) -> DirectoryEntry {
        let page_id = tree.store.allocate_page();
        let mut leaf = Node::new_leaf(page_id, tree.leaf_capacity());
        let mid = (lo + hi) / 2.0;
        let points = [[lo, lo], [hi, lo], [lo, hi], [hi, hi], [mid, mid]];
        for (i, coords) in points.iter().enumerate() {
            leaf.add_leaf_entry(LeafEntry::new(first_id + i as u64, coords.to_vec()))
                .unwrap();
        }
        tree.write_node(&leaf).unwrap();
        DirectoryEntry::new(page_id, leaf.compute_mbr().unwrap())
    }

    /// Writes a directory with nine identical corner leaves on `page_id`.
    fn crowded_directory(
        tree: &mut DiskXTree,
        page_id: PageId,
        lo: f64,
        hi: f64,
        first_id: ObjectId,
    ) -> DirectoryEntry {
        let mut dir = Node::new_directory(page_id, tree.dir_capacity());
        for i in 0..9 {
            let entry = corner_leaf(tree, lo, hi, first_id + 5 * i);
            dir.add_directory_entry(entry).unwrap();
        }
        tree.write_node(&dir).unwrap();
        DirectoryEntry::new(page_id, dir.compute_mbr().unwrap())
    }

    fn insert_near(tree: &mut DiskXTree, center: f64, first_id: ObjectId) {
        for i in 1..=5 {
            let c = center + 0.1 * i as f64;
            tree.insert_point(first_id + i as u64, &[c, c]).unwrap();
        }
    }

    fn random_points(rng: &mut StdRng, count: usize, dim: usize) -> Vec<Vec<f64>> {
        (0..count)
            .map(|_| (0..dim).map(|_| rng.gen_range(0.0..100.0)).collect())
            .collect()
    }

    fn brute_force_range(points: &[Vec<f64>], window: &HyperBoundingBox) -> Vec<ObjectId> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| window.contains(p.as_slice()))
            .map(|(i, _)| i as ObjectId)
            .collect()
    }

    fn assert_valid(tree: &DiskXTree) {
        let report = tree.check_integrity().unwrap();
        assert!(report.is_valid, "integrity errors: {:?}", report.errors);
    }

    #[test]
    fn test_create_empty_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.xtree");

        let mut tree = DiskXTree::create(&path, XTreeSettings::new(3)).unwrap();
        assert_eq!(tree.num_elements(), 0);
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.dimensionality(), 3);
        assert!(tree.get_supernodes().is_empty());
        assert!(tree.knn_query(&[0.0, 0.0, 0.0], 3).unwrap().is_empty());
        assert_valid(&tree);
        tree.close().unwrap();

        let tree = DiskXTree::open(&path).unwrap();
        assert_eq!(tree.dimensionality(), 3);
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.num_elements(), 0);
    }

    #[test]
    fn test_accessors_follow_settings() {
        let tree = DiskXTree::in_memory(
            small_settings()
                .with_max_overlap(0.3)
                .with_overlap_type(OverlapType::DataOverlap),
        )
        .unwrap();
        assert_eq!(tree.dir_capacity(), 10);
        assert_eq!(tree.leaf_capacity(), 10);
        assert_eq!(tree.dir_minimum(), 4);
        assert_eq!(tree.leaf_minimum(), 4);
        assert_eq!(tree.min_fanout(), 3);
        assert_eq!(tree.max_overlap(), 0.3);
        assert_eq!(tree.overlap_type(), OverlapType::DataOverlap);
    }

    #[test]
    fn test_fewer_points_than_a_directory_holds_stay_in_root_leaf() {
        let mut tree = DiskXTree::in_memory(XTreeSettings::new(2)).unwrap();
        let count = tree.dir_capacity() - 1;
        let mut rng = StdRng::seed_from_u64(7);
        for (i, p) in random_points(&mut rng, count, 2).iter().enumerate() {
            tree.insert_point(i as ObjectId, p).unwrap();
        }
        assert_eq!(tree.height(), 1);
        assert!(tree.get_supernodes().is_empty());
        assert_eq!(tree.num_elements(), count as u64);
        assert_valid(&tree);
    }

    #[test]
    fn test_root_leaf_split_creates_directory_root() {
        init_logging();
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        for i in 0..10 {
            tree.insert_point(i, &[i as f64, (i % 3) as f64]).unwrap();
        }
        assert_eq!(tree.height(), 2);
        let root = tree.get_node(ROOT_PAGE_ID).unwrap();
        assert!(!root.is_leaf());
        assert_eq!(root.len(), 2);

        // the moved half records the split axis, the new sibling does not
        let entries = root.directory_entries().unwrap();
        let axis = entries[0].history.dimensions().next().unwrap();
        assert!(axis < 2);
        assert!(entries[1].history.is_empty());
        assert_valid(&tree);
    }

    #[test]
    fn test_clustered_inserts_turn_root_into_supernode() {
        init_logging();
        let settings = small_settings().with_overlap_type(OverlapType::DataOverlap);
        let mut tree = DiskXTree::in_memory(settings).unwrap();

        // every directory split of identical points has all data in the overlap
        let mut inserted = 0u64;
        while tree.get_supernodes().is_empty() {
            assert!(inserted < 500, "no supernode after {} inserts", inserted);
            tree.insert_point(inserted, &[1.0, 1.0]).unwrap();
            inserted += 1;
        }

        let supernodes = tree.get_supernodes();
        assert_eq!(supernodes.len(), 1);
        assert_eq!(supernodes[0].page_id(), ROOT_PAGE_ID);
        assert_eq!(supernodes[0].capacity(), 2 * tree.dir_capacity() - 1);
        assert_eq!(supernodes[0].len(), tree.dir_capacity());
        assert_eq!(tree.height(), 2);
        assert_eq!(tree.num_elements(), inserted);
        assert_valid(&tree);

        let summary = tree.summary().unwrap();
        assert_eq!(summary.supernodes, 1);
        assert_eq!(summary.leaf_nodes, 10);
        assert_eq!(summary.objects, inserted);
        assert_eq!(summary.max_supernode_capacity, Some(19));
        let found = tree
            .range_query(&HyperBoundingBox::from_point(&[1.0, 1.0]))
            .unwrap();
        assert_eq!(found.len() as u64, inserted);
    }

    #[test]
    fn test_supernode_grows_through_inserts_and_survives_reopen() {
        init_logging();
        let dir = tempdir().unwrap();
        let path = dir.path().join("growth.xtree");
        let settings = small_settings().with_overlap_type(OverlapType::DataOverlap);
        let page_size = settings.page_size as u64;
        let mut next_id = 0u64;

        let (supernode_id, elements) = {
            let mut tree = DiskXTree::create(&path, settings).unwrap();

            // two separate clusters give the root a clean directory split
            while tree.height() < 3 {
                assert!(next_id < 500, "height still {} after {} inserts", tree.height(), next_id);
                let c = if next_id % 2 == 0 { 0.0 } else { 10.0 };
                tree.insert_point(next_id, &[c, c]).unwrap();
                next_id += 1;
            }
            assert!(tree.get_supernodes().is_empty());

            // the directory above the first cluster cannot split any more
            while tree.get_supernodes().is_empty() {
                assert!(next_id < 1000, "no supernode after {} inserts", next_id);
                tree.insert_point(next_id, &[0.0, 0.0]).unwrap();
                next_id += 1;
            }
            let supernode_id = tree.get_supernodes()[0].page_id();
            assert_ne!(supernode_id, ROOT_PAGE_ID);
            assert_eq!(tree.get_supernodes()[0].capacity(), 19);

            while tree.get_supernodes()[0].capacity() == 19 {
                assert!(next_id < 2000, "supernode did not grow after {} inserts", next_id);
                tree.insert_point(next_id, &[0.0, 0.0]).unwrap();
                next_id += 1;
            }

            let supernodes = tree.get_supernodes();
            assert_eq!(supernodes.len(), 1);
            let supernode = supernodes[0];
            assert_eq!(supernode.page_id(), supernode_id);
            assert_eq!(supernode.capacity(), 37);
            assert!(!supernode.is_overflowing());
            let supernode_mbr = supernode.compute_mbr().unwrap();
            assert_eq!(tree.height(), 3);

            let root = tree.get_node(ROOT_PAGE_ID).unwrap();
            let entry = root
                .directory_entries()
                .unwrap()
                .iter()
                .find(|e| e.child == supernode_id)
                .unwrap();
            assert_eq!(entry.mbr, supernode_mbr);
            assert_valid(&tree);

            // 19 of 37 slots leave a directory page free, but 19 entries do
            // not fit a shrunk capacity of 19
            assert!(!tree.check_underflow(supernode_id).unwrap());
            assert_eq!(tree.get_node(supernode_id).unwrap().capacity(), 37);

            // a supernode of capacity 37 spans four directory pages
            assert_eq!(tree.commit().unwrap(), 4 * page_size);
            let elements = tree.num_elements();
            assert_eq!(elements, next_id);
            tree.close().unwrap();
            (supernode_id, elements)
        };

        let tree = DiskXTree::open(&path).unwrap();
        let supernodes = tree.get_supernodes();
        assert_eq!(supernodes.len(), 1);
        assert_eq!(supernodes[0].page_id(), supernode_id);
        assert_eq!(supernodes[0].capacity(), 37);
        assert_eq!(tree.height(), 3);
        assert_eq!(tree.num_elements(), elements);
        assert_valid(&tree);
    }

    #[test]
    fn test_demoted_supernode_is_not_committed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("demote.xtree");
        let mut tree = DiskXTree::create(&path, small_settings()).unwrap();
        crowded_directory(&mut tree, ROOT_PAGE_ID, 0.0, 10.0, 0);
        tree.height = 2;
        tree.num_elements = 45;
        insert_near(&mut tree, 5.0, 100);
        assert_eq!(tree.get_supernodes().len(), 1);

        let mut root = tree.get_node(ROOT_PAGE_ID).unwrap();
        root.truncate(8);
        tree.write_node(&root).unwrap();
        assert!(!tree.check_underflow(ROOT_PAGE_ID).unwrap());

        assert!(tree.get_supernodes().is_empty());
        let root = tree.get_node(ROOT_PAGE_ID).unwrap();
        assert!(!root.is_supernode());
        assert_eq!(root.capacity(), tree.dir_capacity());
        assert_eq!(tree.commit().unwrap(), 0);
    }

    #[test]
    fn test_supernodes_survive_commit_and_reopen() {
        init_logging();
        let dir = tempdir().unwrap();
        let path = dir.path().join("supernodes.xtree");

        let (ids, capacities) = {
            let mut tree = DiskXTree::create(&path, small_settings()).unwrap();
            let a_id = tree.store.allocate_page();
            let b_id = tree.store.allocate_page();
            let a = crowded_directory(&mut tree, a_id, 0.0, 10.0, 0);
            let b = crowded_directory(&mut tree, b_id, 20.0, 30.0, 1000);
            let mut root = Node::new_directory(ROOT_PAGE_ID, tree.dir_capacity());
            root.add_directory_entry(a).unwrap();
            root.add_directory_entry(b).unwrap();
            tree.write_node(&root).unwrap();
            tree.height = 3;
            tree.num_elements = 90;

            insert_near(&mut tree, 5.0, 5000);
            insert_near(&mut tree, 25.0, 6000);

            let ids: Vec<PageId> = tree.get_supernodes().iter().map(|n| n.page_id()).collect();
            let capacities: Vec<usize> =
                tree.get_supernodes().iter().map(|n| n.capacity()).collect();
            assert_eq!(ids, vec![a_id, b_id]);
            assert_eq!(capacities, vec![19, 19]);
            assert_valid(&tree);

            // each supernode of capacity 19 spans two pages
            let page_size = tree.settings().page_size as u64;
            assert_eq!(tree.commit().unwrap(), 2 * 2 * page_size);
            tree.close().unwrap();
            (ids, capacities)
        };

        let tree = DiskXTree::open(&path).unwrap();
        let reopened_ids: Vec<PageId> = tree.get_supernodes().iter().map(|n| n.page_id()).collect();
        let reopened_caps: Vec<usize> = tree.get_supernodes().iter().map(|n| n.capacity()).collect();
        assert_eq!(reopened_ids, ids);
        assert_eq!(reopened_caps, capacities);
        assert_eq!(tree.height(), 3);
        assert_eq!(tree.num_elements(), 100);
        assert_valid(&tree);

        let mut near_a = tree
            .range_query(&HyperBoundingBox::new(vec![5.05, 5.05], vec![5.55, 5.55]))
            .unwrap();
        near_a.sort_unstable();
        assert_eq!(near_a, vec![5001, 5002, 5003, 5004, 5005]);
    }

    #[test]
    fn test_split_history_of_new_sibling_excludes_split_axis() {
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        crowded_directory(&mut tree, ROOT_PAGE_ID, 0.0, 10.0, 0);
        tree.height = 2;
        tree.num_elements = 45;

        // give the first leaf's entry a history so the copy is observable
        let mut root = tree.get_node(ROOT_PAGE_ID).unwrap();
        root.directory_entry_mut(0).unwrap().history.add(1);
        tree.write_node(&root).unwrap();

        // four points fill the first leaf to nine entries
        for i in 1..=4 {
            let c = 5.0 + 0.1 * i as f64;
            tree.insert_point(100 + i, &[c, c]).unwrap();
        }
        let root = tree.get_node(ROOT_PAGE_ID).unwrap();
        assert_eq!(root.len(), 9);

        tree.insert_point(200, &[5.5, 5.5]).unwrap();
        // the root became a supernode, the leaf split added the tenth entry
        let root = tree.get_node(ROOT_PAGE_ID).unwrap();
        assert_eq!(root.len(), 10);
        let entries = root.directory_entries().unwrap();
        let original = &entries[0].history;
        let sibling = &entries[9].history;
        assert!(sibling.contains(1));
        assert_eq!(sibling.dimensions().count(), 1);
        assert!(original.contains(1));
        let split_axis: Vec<usize> = original.dimensions().filter(|d| !sibling.contains(*d)).collect();
        assert!(split_axis.len() <= 1);
        assert_valid(&tree);
    }

    #[test]
    fn test_random_inserts_keep_invariants_and_answer_queries() {
        init_logging();
        let settings = XTreeSettings::new(4).with_page_size(512);
        let mut tree = DiskXTree::in_memory(settings).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let points = random_points(&mut rng, 2000, 4);
        for (i, p) in points.iter().enumerate() {
            tree.insert_point(i as ObjectId, p).unwrap();
        }
        assert_eq!(tree.num_elements(), 2000);
        assert!(tree.height() >= 2);
        assert_valid(&tree);

        for _ in 0..20 {
            let lo: Vec<f64> = (0..4).map(|_| rng.gen_range(0.0..70.0)).collect();
            let hi: Vec<f64> = lo.iter().map(|l| l + rng.gen_range(10.0..40.0)).collect();
            let window = HyperBoundingBox::new(lo, hi);
            let mut found = tree.range_query(&window).unwrap();
            found.sort_unstable();
            assert_eq!(found, brute_force_range(&points, &window));
        }

        let query = [50.0, 50.0, 50.0, 50.0];
        let knn = tree.knn_query(&query, 10).unwrap();
        let mut expected: Vec<f64> = points
            .iter()
            .map(|p| p.iter().zip(&query).map(|(a, b)| (a - b) * (a - b)).sum::<f64>().sqrt())
            .collect();
        expected.sort_by(f64::total_cmp);
        assert_eq!(knn.len(), 10);
        for (got, want) in knn.iter().zip(&expected) {
            assert!((got.1 - want).abs() < 1e-9);
        }
    }

    #[test]
    fn test_high_dimensional_clusters() {
        init_logging();
        let settings = XTreeSettings::new(12).with_page_size(1024);
        let mut tree = DiskXTree::in_memory(settings).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut id = 0;
        for _ in 0..6 {
            let center: Vec<f64> = (0..12).map(|_| rng.gen_range(0.0..1.0)).collect();
            for _ in 0..150 {
                let p: Vec<f64> = center.iter().map(|c| c + rng.gen_range(-0.05..0.05)).collect();
                tree.insert_point(id, &p).unwrap();
                id += 1;
            }
        }
        assert_eq!(tree.num_elements(), 900);
        assert_valid(&tree);
        let summary = tree.summary().unwrap();
        assert_eq!(summary.objects, 900);
        assert_eq!(summary.supernodes, tree.get_supernodes().len() as u64);
    }

    #[test]
    fn test_data_overlap_tree() {
        let settings = XTreeSettings::new(3)
            .with_page_size(512)
            .with_overlap_type(OverlapType::DataOverlap);
        let mut tree = DiskXTree::in_memory(settings).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for (i, p) in random_points(&mut rng, 800, 3).iter().enumerate() {
            tree.insert_point(i as ObjectId, p).unwrap();
        }
        assert_valid(&tree);
    }

    #[test]
    fn test_persistence_with_small_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.xtree");
        let settings = XTreeSettings::new(3).with_page_size(512).with_cache_pages(8);
        let mut rng = StdRng::seed_from_u64(99);
        let points = random_points(&mut rng, 1500, 3);
        let window = HyperBoundingBox::new(vec![20.0, 20.0, 20.0], vec![60.0, 70.0, 80.0]);

        let expected = {
            let mut tree = DiskXTree::create(&path, settings.clone()).unwrap();
            for (i, p) in points.iter().enumerate() {
                tree.insert_point(i as ObjectId, p).unwrap();
            }
            assert!(tree.stats().cache_misses > 0);
            assert!(tree.stats().cached_pages <= 8);
            tree.commit().unwrap();
            let mut found = tree.range_query(&window).unwrap();
            found.sort_unstable();
            found
        };
        assert_eq!(expected, brute_force_range(&points, &window));

        let mut tree = DiskXTree::open_with_settings(&path, settings).unwrap();
        assert_eq!(tree.num_elements(), 1500);
        assert_valid(&tree);
        let mut found = tree.range_query(&window).unwrap();
        found.sort_unstable();
        assert_eq!(found, expected);

        // the reopened tree keeps accepting points
        tree.insert_point(5000, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(tree.num_elements(), 1501);
        assert_valid(&tree);
    }

    #[test]
    fn test_choose_insertion_path_prefers_smallest_container() {
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        let big = corner_leaf(&mut tree, 0.0, 10.0, 0);
        let small = corner_leaf(&mut tree, 2.0, 4.0, 10);
        let mut root = Node::new_directory(ROOT_PAGE_ID, tree.dir_capacity());
        root.add_directory_entry(big).unwrap();
        root.add_directory_entry(small.clone()).unwrap();
        tree.write_node(&root).unwrap();
        tree.height = 2;

        let path = tree
            .choose_insertion_path(&HyperBoundingBox::from_point(&[3.0, 3.0]), 1)
            .unwrap();
        assert_eq!(path, vec![(ROOT_PAGE_ID, 0), (small.child, 1)]);

        let root_path = tree
            .choose_insertion_path(&HyperBoundingBox::from_point(&[3.0, 3.0]), 2)
            .unwrap();
        assert_eq!(root_path, vec![(ROOT_PAGE_ID, 0)]);
        assert!(tree
            .choose_insertion_path(&HyperBoundingBox::from_point(&[3.0, 3.0]), 3)
            .is_err());
    }

    #[test]
    fn test_choose_insertion_path_minimizes_overlap_increase() {
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        // growing the left box towards the point would overlap the middle box
        let left = corner_leaf(&mut tree, 0.0, 4.0, 0);
        let middle = corner_leaf(&mut tree, 5.0, 9.0, 10);
        let mut root = Node::new_directory(ROOT_PAGE_ID, tree.dir_capacity());
        root.add_directory_entry(left).unwrap();
        root.add_directory_entry(middle.clone()).unwrap();
        tree.write_node(&root).unwrap();
        tree.height = 2;

        let path = tree
            .choose_insertion_path(&HyperBoundingBox::from_point(&[9.5, 9.5]), 1)
            .unwrap();
        assert_eq!(path[1], (middle.child, 1));
    }

    #[test]
    fn test_overlap_increase() {
        let entries = vec![
            DirectoryEntry::new(1, HyperBoundingBox::new(vec![0.0, 0.0], vec![1.0, 1.0])),
            DirectoryEntry::new(2, HyperBoundingBox::new(vec![2.0, 0.0], vec![3.0, 1.0])),
            DirectoryEntry::new(3, HyperBoundingBox::new(vec![0.0, 5.0], vec![1.0, 6.0])),
        ];
        let test = HyperBoundingBox::new(vec![0.0, 0.0], vec![2.5, 1.0]);
        assert_eq!(overlap_increase(&entries, 0, &test), 0.5);

        let unchanged = entries[0].mbr.clone();
        assert_eq!(overlap_increase(&entries, 0, &unchanged), 0.0);
    }

    #[test]
    fn test_infinite_geometry_is_rejected() {
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        let mut leaf = Node::new_leaf(tree.store.allocate_page(), tree.leaf_capacity());
        leaf.add_leaf_entry(LeafEntry::new(1, vec![-1e300, -1e300])).unwrap();
        leaf.add_leaf_entry(LeafEntry::new(2, vec![1e300, 1e300])).unwrap();
        tree.write_node(&leaf).unwrap();
        let mut other = Node::new_leaf(tree.store.allocate_page(), tree.leaf_capacity());
        other.add_leaf_entry(LeafEntry::new(3, vec![2e300, 2e300])).unwrap();
        tree.write_node(&other).unwrap();
        let mut root = Node::new_directory(ROOT_PAGE_ID, tree.dir_capacity());
        root.add_directory_entry(DirectoryEntry::new(leaf.page_id(), leaf.compute_mbr().unwrap()))
            .unwrap();
        root.add_directory_entry(DirectoryEntry::new(other.page_id(), other.compute_mbr().unwrap()))
            .unwrap();
        tree.write_node(&root).unwrap();
        tree.height = 2;
        tree.num_elements = 3;

        let err = tree.insert_point(4, &[-1.7e308, 1.7e308]).unwrap_err();
        assert!(matches!(err, XTreeError::InvalidGeometry(_)));
    }

    #[test]
    fn test_reinsertion_keeps_tree_valid() {
        let settings = small_settings().with_reinsert_fraction(0.3);
        let mut tree = DiskXTree::in_memory(settings).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let points = random_points(&mut rng, 500, 2);
        for (i, p) in points.iter().enumerate() {
            tree.insert_point(i as ObjectId, p).unwrap();
        }
        assert_valid(&tree);
        let everything = HyperBoundingBox::new(vec![0.0, 0.0], vec![100.0, 100.0]);
        assert_eq!(tree.range_query(&everything).unwrap().len(), 500);
    }

    #[test]
    fn test_check_underflow_of_ordinary_nodes() {
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        tree.insert_point(1, &[0.0, 0.0]).unwrap();
        assert!(tree.check_underflow(ROOT_PAGE_ID).unwrap());
        for i in 2..=4 {
            tree.insert_point(i, &[i as f64, 0.0]).unwrap();
        }
        assert!(!tree.check_underflow(ROOT_PAGE_ID).unwrap());
    }

    #[test]
    fn test_invalid_points_rejected() {
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        assert!(matches!(
            tree.insert_point(1, &[1.0, 2.0, 3.0]),
            Err(XTreeError::InvalidOperation(_))
        ));
        assert!(matches!(
            tree.insert_point(1, &[f64::NAN, 2.0]),
            Err(XTreeError::InvalidGeometry(_))
        ));
        assert_eq!(tree.num_elements(), 0);
    }

    #[test]
    fn test_commit_requires_persistent_store() {
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        assert!(matches!(tree.commit(), Err(XTreeError::NotPersistent)));
    }

    #[test]
    fn test_bulk_load_unsupported() {
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        let err = tree
            .bulk_load(vec![LeafEntry::new(1, vec![0.0, 0.0])])
            .unwrap_err();
        assert!(matches!(err, XTreeError::Unsupported(_)));
        assert_eq!(tree.num_elements(), 0);
    }

    #[test]
    fn test_closed_tree_errors() {
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        tree.insert_point(1, &[0.0, 0.0]).unwrap();
        tree.close().unwrap();
        tree.close().unwrap();
        assert!(matches!(tree.insert_point(2, &[1.0, 1.0]), Err(XTreeError::Closed)));
        assert!(matches!(
            tree.range_query(&HyperBoundingBox::new(vec![0.0, 0.0], vec![1.0, 1.0])),
            Err(XTreeError::Closed)
        ));
        assert!(matches!(tree.flush(), Err(XTreeError::Closed)));
    }

    #[test]
    fn test_open_rejects_corrupted_supernode_region() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.xtree");
        {
            let mut tree = DiskXTree::create(&path, small_settings()).unwrap();
            for i in 0..30 {
                tree.insert_point(i, &[i as f64, 1.0]).unwrap();
            }
            tree.commit().unwrap();
            // a leaf page where a supernode is expected
            let page_size = tree.settings().page_size as u64;
            let offset = tree.store.next_page_id() as u64 * page_size;
            let leaf = tree.get_node(1).unwrap();
            let mut bytes = leaf.encode_page().unwrap();
            bytes.resize(page_size as usize, 0);
            tree.store.write_region(offset, &bytes).unwrap();
            tree.store.sync().unwrap();
            tree.closed = true;
        }
        assert!(matches!(
            DiskXTree::open(&path),
            Err(XTreeError::Corrupted(_))
        ));
    }

    #[test]
    fn test_stats() {
        let mut tree = DiskXTree::in_memory(small_settings()).unwrap();
        for i in 0..25 {
            tree.insert_point(i, &[i as f64, -(i as f64)]).unwrap();
        }
        let stats = tree.stats();
        assert_eq!(stats.num_elements, 25);
        assert_eq!(stats.height, tree.height() as u32);
        assert_eq!(stats.supernodes, 0);
        assert!(stats.cache_hits > 0);
    }
}
