//! # xtree - Disk-Based X-Tree for High-Dimensional Points
//!
//! This crate provides an X-tree: an R*-tree variant for high-dimensional
//! data that avoids overlapping directory splits by recording split axes and
//! by growing nodes into supernodes.
//!
//! ## Features
//!
//! - **Disk-Based Storage**: Nodes stored on fixed-size pages, loaded on demand
//! - **LRU Cache**: Frequently accessed pages kept in memory
//! - **Supernodes**: Multi-page directory nodes, persisted on commit
//! - **Split History**: Overlap-free directory splits where possible
//! - **Forced Reinsertion**: Optional R*-tree style reinsertion on overflow
//! - **Range and kNN Queries**: Window queries and best-first nearest neighbours
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use xtree::{DiskXTree, HyperBoundingBox, XTreeSettings};
//! use tempfile::tempdir;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempdir()?;
//! let mut tree = DiskXTree::create(dir.path().join("points.xtree"), XTreeSettings::new(3))?;
//!
//! tree.insert_point(1, &[0.5, 1.0, 2.0])?;
//! tree.insert_point(2, &[4.0, 4.0, 4.0])?;
//!
//! let window = HyperBoundingBox::new(vec![0.0, 0.0, 0.0], vec![3.0, 3.0, 3.0]);
//! assert_eq!(tree.range_query(&window)?, vec![1]);
//!
//! tree.commit()?;
//! tree.close()?;
//! # Ok(())
//! # }
//! ```

pub mod bounding_box;
pub mod disk_xtree;
pub mod spatial_index;

pub use bounding_box::{HyperBoundingBox, SpatialComparable};
pub use disk_xtree::{
    DirectoryEntry, DiskXTree, Entry, IntegrityReport, LeafEntry, Node, ObjectId, OverlapType,
    PageId, SplitHistory, TreeStats, TreeSummary, XTreeError, XTreeResult, XTreeSettings,
    DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE,
};
pub use spatial_index::SpatialIndex;
