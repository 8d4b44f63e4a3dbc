//! Overflow treatment: decides whether an overflowing node sheds entries for
//! reinsertion before it is split.

use std::collections::HashSet;

/// Pluggable policy consulted before a node is split.
pub trait OverflowTreatment: Send {
    /// Called at the start of every top-level insertion.
    fn reinitialize(&mut self);

    /// Number of entries to remove and reinsert from an overflowing node at
    /// `level` (leaves are level 1). Zero means "split instead".
    fn reinsert_count(&mut self, level: usize, is_root: bool, num_entries: usize) -> usize;
}

/// Never reinserts; every overflow goes straight to the split strategy.
#[derive(Debug, Default, Clone)]
pub struct SplitOnlyOverflowTreatment;

impl OverflowTreatment for SplitOnlyOverflowTreatment {
    fn reinitialize(&mut self) {}

    fn reinsert_count(&mut self, _level: usize, _is_root: bool, _num_entries: usize) -> usize {
        0
    }
}

/// R*-tree forced reinsertion: the first overflow on each level during one
/// insertion reinserts a fraction of the node's entries; the root never does.
#[derive(Debug, Clone)]
pub struct LimitedReinsertOverflowTreatment {
    fraction: f64,
    reinserted_levels: HashSet<usize>,
}

impl LimitedReinsertOverflowTreatment {
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction,
            reinserted_levels: HashSet::new(),
        }
    }
}

impl OverflowTreatment for LimitedReinsertOverflowTreatment {
    fn reinitialize(&mut self) {
        self.reinserted_levels.clear();
    }

    fn reinsert_count(&mut self, level: usize, is_root: bool, num_entries: usize) -> usize {
        if is_root || self.fraction <= 0.0 || self.reinserted_levels.contains(&level) {
            return 0;
        }
        self.reinserted_levels.insert(level);
        (self.fraction * num_entries as f64) as usize
    }
}

/// Builds the treatment matching a reinsert fraction; zero disables reinsertion.
pub fn overflow_treatment_for(fraction: f64) -> Box<dyn OverflowTreatment> {
    if fraction > 0.0 {
        Box::new(LimitedReinsertOverflowTreatment::new(fraction))
    } else {
        Box::new(SplitOnlyOverflowTreatment)
    }
}
