//! Constants for the disk-based X-tree.

use super::xtree_types::PageId;

/// Default page size (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default cache size in number of pages (4MB with 4KB pages)
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Magic number for file format identification
pub const MAGIC: u32 = 0x58545245; // "XTRE"

/// File format version
pub const VERSION: u32 = 1;

/// The root node always lives on this page
pub const ROOT_PAGE_ID: PageId = 0;

/// Encoded size of the tree header; the rest of the header page is zero padding
pub const HEADER_BYTES: usize = 60;

/// Encoded size of a node page header: page id, two flags, entry count and capacity
pub const NODE_HEADER_BYTES: usize = 4 + 1 + 1 + 4 + 4;

/// Smallest usable node capacity, counting the overflow slot
pub const MIN_CAPACITY: usize = 3;

/// Capacities below this are accepted but logged as a warning
pub const WARN_CAPACITY: usize = 10;
