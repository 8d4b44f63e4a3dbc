//! Structural reports over a whole tree.
//!
//! This module provides:
//! - `IntegrityReport`, the result of a full consistency walk
//! - `TreeSummary`, node and object counts per kind with the storage quota

use std::fmt;

use super::settings::OverlapType;
use super::xtree_types::PageId;

// ============================================================================
// Integrity Checking
// ============================================================================

/// Result of integrity check operation
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    /// Total nodes visited
    pub pages_checked: u64,
    /// Data objects found in leaves
    pub objects_found: u64,
    /// Pages on which a violation was found
    pub invalid_pages: Vec<PageId>,
    /// Summary of findings
    pub is_valid: bool,
    /// Detailed error messages
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn new() -> Self {
        Self {
            pages_checked: 0,
            objects_found: 0,
            invalid_pages: Vec::new(),
            is_valid: true,
            errors: Vec::new(),
        }
    }

    /// Record a violation found on `page_id`
    pub fn fail(&mut self, page_id: PageId, message: String) {
        if self.invalid_pages.last() != Some(&page_id) {
            self.invalid_pages.push(page_id);
        }
        self.errors.push(format!("Page {}: {}", page_id, message));
        self.is_valid = false;
    }
}

impl Default for IntegrityReport {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Structure Summary
// ============================================================================

/// Node and object counts of a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeSummary {
    pub levels: usize,
    pub dimensionality: usize,
    /// Ordinary directory nodes, supernodes excluded
    pub directory_nodes: u64,
    pub supernodes: u64,
    pub min_supernode_capacity: Option<usize>,
    pub max_supernode_capacity: Option<usize>,
    pub leaf_nodes: u64,
    pub objects: u64,
    /// Sum of the capacities of all nodes
    pub total_capacity: u64,
    pub dir_capacity: usize,
    pub dir_minimum: usize,
    pub leaf_capacity: usize,
    pub leaf_minimum: usize,
    pub min_fanout: usize,
    pub max_overlap: f32,
    pub overlap_type: OverlapType,
}

impl TreeSummary {
    /// Share of all node slots in use, in whole percent.
    ///
    /// Every node except the root occupies one slot in its parent.
    pub fn storage_quota(&self) -> u64 {
        if self.total_capacity == 0 {
            return 0;
        }
        let used = self.objects + self.directory_nodes + self.supernodes + self.leaf_nodes;
        used * 100 / self.total_capacity
    }
}

impl fmt::Display for TreeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "X-tree has {} levels.", self.levels)?;
        writeln!(
            f,
            "{} Directory Nodes (max = {}, min = {})",
            self.directory_nodes,
            self.dir_capacity - 1,
            self.dir_minimum
        )?;
        match (self.max_supernode_capacity, self.min_supernode_capacity) {
            (Some(max), Some(min)) => writeln!(
                f,
                "{} Supernodes (max = {}, min = {})",
                self.supernodes,
                max - 1,
                min - 1
            )?,
            _ => writeln!(f, "{} Supernodes", self.supernodes)?,
        }
        writeln!(
            f,
            "{} Data Nodes (max = {}, min = {})",
            self.leaf_nodes,
            self.leaf_capacity - 1,
            self.leaf_minimum
        )?;
        writeln!(
            f,
            "{} {}-dim. points in the tree",
            self.objects, self.dimensionality
        )?;
        writeln!(
            f,
            "min_fanout = {}, max_overlap = {} {} overlap",
            self.min_fanout,
            self.max_overlap,
            match self.overlap_type {
                OverlapType::DataOverlap => "data",
                OverlapType::VolumeOverlap => "volume",
            }
        )?;
        writeln!(f, "Storage Quota {}%", self.storage_quota())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> TreeSummary {
        TreeSummary {
            levels: 2,
            dimensionality: 2,
            directory_nodes: 0,
            supernodes: 1,
            min_supernode_capacity: Some(19),
            max_supernode_capacity: Some(19),
            leaf_nodes: 10,
            objects: 50,
            total_capacity: 19 + 10 * 10,
            dir_capacity: 10,
            dir_minimum: 4,
            leaf_capacity: 10,
            leaf_minimum: 4,
            min_fanout: 3,
            max_overlap: 0.2,
            overlap_type: OverlapType::VolumeOverlap,
        }
    }

    #[test]
    fn test_integrity_report_accumulates() {
        let mut report = IntegrityReport::new();
        assert!(report.is_valid);
        report.fail(3, "first".to_string());
        report.fail(3, "second".to_string());
        report.fail(5, "third".to_string());
        assert!(!report.is_valid);
        assert_eq!(report.invalid_pages, vec![3, 5]);
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors[0].starts_with("Page 3"));
    }

    #[test]
    fn test_storage_quota() {
        // 61 used slots of 119
        assert_eq!(summary().storage_quota(), 51);
        let empty = TreeSummary {
            total_capacity: 0,
            ..summary()
        };
        assert_eq!(empty.storage_quota(), 0);
    }

    #[test]
    fn test_summary_display() {
        let text = summary().to_string();
        assert!(text.contains("X-tree has 2 levels."));
        assert!(text.contains("1 Supernodes (max = 18, min = 18)"));
        assert!(text.contains("10 Data Nodes (max = 9, min = 4)"));
        assert!(text.contains("50 2-dim. points in the tree"));
        assert!(text.contains("volume overlap"));
        assert!(text.contains("Storage Quota 51%"));
    }
}
