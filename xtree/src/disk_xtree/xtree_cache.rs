//! LRU write-back cache of decoded X-tree nodes.
//!
//! Nodes enter the cache when they are first read from the page store or
//! written by the tree. Dirty nodes reach the page store only when they are
//! evicted or when the tree flushes.

use std::collections::{BTreeMap, HashMap};

use super::node::Node;
use super::xtree_types::PageId;

/// A cached node with its dirty flag
pub struct CachedPage {
    pub node: Node,
    pub dirty: bool,
    last_used: u64,
}

/// LRU cache for X-tree nodes, keyed by page id.
///
/// Recency is tracked with a monotonically increasing access tick so the
/// least recently used page can be found without scanning.
pub struct PageCache {
    pages: HashMap<PageId, CachedPage>,
    /// access tick -> page, oldest first
    recency: BTreeMap<u64, PageId>,
    tick: u64,
    max_pages: usize,
}

impl PageCache {
    /// Create a new page cache holding at most `max_pages` nodes
    pub fn new(max_pages: usize) -> Self {
        Self {
            pages: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
            max_pages: max_pages.max(1),
        }
    }

    fn touch(&mut self, page_id: PageId) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(cached) = self.pages.get_mut(&page_id) {
            self.recency.remove(&cached.last_used);
            cached.last_used = tick;
            self.recency.insert(tick, page_id);
        }
    }

    /// Get a node from the cache, marking it most recently used.
    pub fn get(&mut self, page_id: PageId) -> Option<&Node> {
        self.touch(page_id);
        self.pages.get(&page_id).map(|cached| &cached.node)
    }

    /// Insert or replace a node.
    pub fn insert(&mut self, page_id: PageId, node: Node, dirty: bool) {
        self.tick += 1;
        let tick = self.tick;
        let dirty = dirty || self.pages.get(&page_id).is_some_and(|c| c.dirty);
        if let Some(old) = self.pages.insert(
            page_id,
            CachedPage {
                node,
                dirty,
                last_used: tick,
            },
        ) {
            self.recency.remove(&old.last_used);
        }
        self.recency.insert(tick, page_id);
    }

    /// `true` when one more insertion would exceed the capacity
    pub fn needs_eviction(&self) -> bool {
        self.pages.len() >= self.max_pages
    }

    /// Remove the least recently used node, returning it with its dirty flag
    pub fn evict_oldest(&mut self) -> Option<(PageId, Node, bool)> {
        let (_, page_id) = self.recency.pop_first()?;
        let cached = self.pages.remove(&page_id)?;
        Some((page_id, cached.node, cached.dirty))
    }

    /// Ids of all dirty nodes, ascending
    pub fn dirty_pages(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self
            .pages
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Peek at a node without changing its recency
    pub fn peek(&self, page_id: PageId) -> Option<&Node> {
        self.pages.get(&page_id).map(|cached| &cached.node)
    }

    /// Drop a node without writing it back
    pub fn remove(&mut self, page_id: PageId) -> Option<Node> {
        let cached = self.pages.remove(&page_id)?;
        self.recency.remove(&cached.last_used);
        Some(cached.node)
    }

    pub fn mark_clean(&mut self, page_id: PageId) {
        if let Some(cached) = self.pages.get_mut(&page_id) {
            cached.dirty = false;
        }
    }

    /// Drop every node, returning the dirty ones
    #[cfg(test)]
    pub fn clear(&mut self) -> Vec<(PageId, Node)> {
        self.recency.clear();
        self.pages
            .drain()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, cached)| (id, cached.node))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: PageId) -> Node {
        Node::new_leaf(id, 4)
    }

    #[test]
    fn test_cache_insert_and_get() {
        let mut cache = PageCache::new(10);
        cache.insert(1, leaf(1), false);
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let mut cache = PageCache::new(3);
        cache.insert(1, leaf(1), false);
        cache.insert(2, leaf(2), true);
        cache.insert(3, leaf(3), false);
        assert!(cache.needs_eviction());

        // page 1 becomes most recently used
        cache.get(1);
        let (id, _, dirty) = cache.evict_oldest().unwrap();
        assert_eq!(id, 2);
        assert!(dirty);
        let (id, _, _) = cache.evict_oldest().unwrap();
        assert_eq!(id, 3);
        assert!(!cache.needs_eviction());
    }

    #[test]
    fn test_reinsert_keeps_dirty_flag() {
        let mut cache = PageCache::new(4);
        cache.insert(7, leaf(7), true);
        cache.insert(7, leaf(7), false);
        assert_eq!(cache.dirty_pages(), vec![7]);
        assert_eq!(cache.len(), 1);

        cache.mark_clean(7);
        assert!(cache.dirty_pages().is_empty());
    }

    #[test]
    fn test_dirty_pages_sorted() {
        let mut cache = PageCache::new(8);
        for id in [5, 2, 9, 1] {
            cache.insert(id, leaf(id), id != 9);
        }
        assert_eq!(cache.dirty_pages(), vec![1, 2, 5]);
    }

    #[test]
    fn test_remove_forgets_page() {
        let mut cache = PageCache::new(2);
        cache.insert(1, leaf(1), true);
        cache.insert(2, leaf(2), false);
        assert!(cache.remove(1).is_some());
        assert!(cache.remove(1).is_none());
        assert!(cache.peek(1).is_none());
        assert!(!cache.needs_eviction());
        let (id, _, _) = cache.evict_oldest().unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_clear_returns_dirty_nodes() {
        let mut cache = PageCache::new(8);
        cache.insert(1, leaf(1), true);
        cache.insert(2, leaf(2), false);
        let dirty = cache.clear();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].0, 1);
        assert!(cache.is_empty());
        assert!(cache.evict_oldest().is_none());
    }
}
