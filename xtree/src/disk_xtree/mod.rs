//! Disk-based X-tree for high-dimensional point data.
//!
//! The X-tree extends the R*-tree with two ideas:
//! - Split history: every directory entry remembers the axes its subtree was
//!   split along, so a directory split can follow an earlier one
//! - Supernodes: when no directory split keeps the overlap low, the node
//!   grows into a multi-page supernode instead of splitting
//!
//! Ordinary nodes are stored on fixed-size pages and loaded on demand through
//! an LRU cache. Supernodes are kept in memory and written behind the last
//! page on commit.

pub mod xtree_types;
pub mod xtree_constants;
pub mod settings;
pub mod split_history;
pub mod node;
pub mod splitter;
pub mod overflow;
pub mod header;
pub mod xtree_cache;
pub mod xtree_storage;
pub mod integrity;
mod xtree_impl;

pub use xtree_types::{ObjectId, PageId, TreeStats, XTreeError, XTreeResult};
pub use xtree_constants::{DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE};
pub use settings::{OverlapType, TreeParameters, XTreeSettings};
pub use split_history::SplitHistory;
pub use node::{DirectoryEntry, Entry, LeafEntry, Node, NodeEntries};
pub use splitter::{SplitSorting, XSplitter};
pub use overflow::{LimitedReinsertOverflowTreatment, OverflowTreatment, SplitOnlyOverflowTreatment};
pub use header::TreeHeader;
pub use xtree_storage::{MemoryPageFile, PageFile, PersistentPageFile};
pub use integrity::{IntegrityReport, TreeSummary};
pub use xtree_impl::{DiskXTree, TreePath};
