//! Tree configuration and the node capacities derived from it.

use log::warn;

use super::xtree_constants::{
    DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE, HEADER_BYTES, MIN_CAPACITY, NODE_HEADER_BYTES,
    WARN_CAPACITY,
};
use super::xtree_types::{XTreeError, XTreeResult};

/// How the overlap of a candidate split is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapType {
    /// Fraction of the data objects that fall into the intersection of both halves.
    DataOverlap,
    /// Intersection volume relative to the summed volume of both halves.
    #[default]
    VolumeOverlap,
}

impl OverlapType {
    /// Code stored in the tree header.
    pub fn code(self) -> i32 {
        match self {
            OverlapType::DataOverlap => 0,
            OverlapType::VolumeOverlap => 1,
        }
    }

    pub fn from_code(code: i32) -> XTreeResult<Self> {
        match code {
            0 => Ok(OverlapType::DataOverlap),
            1 => Ok(OverlapType::VolumeOverlap),
            other => Err(XTreeError::Corrupted(format!("unknown overlap type {}", other))),
        }
    }
}

/// User-facing configuration of an X-tree.
///
/// ```rust
/// use xtree::{OverlapType, XTreeSettings};
///
/// let settings = XTreeSettings::new(16)
///     .with_page_size(8192)
///     .with_max_overlap(0.1)
///     .with_overlap_type(OverlapType::DataOverlap);
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct XTreeSettings {
    pub dimensionality: usize,
    pub page_size: usize,
    /// Explicit directory capacity (including the overflow slot); derived from the page size when `None`
    pub dir_capacity: Option<usize>,
    /// Explicit leaf capacity (including the overflow slot); derived from the page size when `None`
    pub leaf_capacity: Option<usize>,
    pub relative_min_entries: f64,
    pub relative_min_fanout: f64,
    pub max_overlap: f32,
    pub overlap_type: OverlapType,
    pub omit_overlap_increase_for_supernodes: bool,
    /// Share of an overflowing node's entries reinserted before splitting; 0 disables reinsertion
    pub reinsert_fraction: f64,
    pub cache_pages: usize,
}

impl Default for XTreeSettings {
    fn default() -> Self {
        Self {
            dimensionality: 0,
            page_size: DEFAULT_PAGE_SIZE,
            dir_capacity: None,
            leaf_capacity: None,
            relative_min_entries: 0.4,
            relative_min_fanout: 0.3,
            max_overlap: 0.2,
            overlap_type: OverlapType::VolumeOverlap,
            omit_overlap_increase_for_supernodes: true,
            reinsert_fraction: 0.3,
            cache_pages: DEFAULT_CACHE_PAGES,
        }
    }
}

impl XTreeSettings {
    pub fn new(dimensionality: usize) -> Self {
        Self {
            dimensionality,
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_dir_capacity(mut self, capacity: usize) -> Self {
        self.dir_capacity = Some(capacity);
        self
    }

    pub fn with_leaf_capacity(mut self, capacity: usize) -> Self {
        self.leaf_capacity = Some(capacity);
        self
    }

    pub fn with_relative_min_entries(mut self, relative: f64) -> Self {
        self.relative_min_entries = relative;
        self
    }

    pub fn with_relative_min_fanout(mut self, relative: f64) -> Self {
        self.relative_min_fanout = relative;
        self
    }

    pub fn with_max_overlap(mut self, max_overlap: f32) -> Self {
        self.max_overlap = max_overlap;
        self
    }

    pub fn with_overlap_type(mut self, overlap_type: OverlapType) -> Self {
        self.overlap_type = overlap_type;
        self
    }

    pub fn with_omit_overlap_increase_for_supernodes(mut self, omit: bool) -> Self {
        self.omit_overlap_increase_for_supernodes = omit;
        self
    }

    pub fn with_reinsert_fraction(mut self, fraction: f64) -> Self {
        self.reinsert_fraction = fraction;
        self
    }

    pub fn with_cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    /// Rejects settings no tree can be built from.
    pub fn validate(&self) -> XTreeResult<()> {
        if self.dimensionality == 0 {
            return Err(XTreeError::InvalidOperation(
                "dimensionality must be at least 1".to_string(),
            ));
        }
        if self.page_size < HEADER_BYTES {
            return Err(XTreeError::InvalidOperation(format!(
                "page size {} cannot hold the {} byte tree header",
                self.page_size, HEADER_BYTES
            )));
        }
        if !(self.relative_min_entries > 0.0 && self.relative_min_entries <= 0.5) {
            return Err(XTreeError::InvalidOperation(format!(
                "relative minimum entries {} must be in (0, 0.5]",
                self.relative_min_entries
            )));
        }
        if !(self.relative_min_fanout > 0.0 && self.relative_min_fanout <= 0.5) {
            return Err(XTreeError::InvalidOperation(format!(
                "relative minimum fanout {} must be in (0, 0.5]",
                self.relative_min_fanout
            )));
        }
        if !(0.0..=1.0).contains(&self.max_overlap) {
            return Err(XTreeError::InvalidOperation(format!(
                "maximum overlap {} must be in [0, 1]",
                self.max_overlap
            )));
        }
        if !(0.0..1.0).contains(&self.reinsert_fraction) {
            return Err(XTreeError::InvalidOperation(format!(
                "reinsert fraction {} must be in [0, 1)",
                self.reinsert_fraction
            )));
        }
        if self.cache_pages == 0 {
            return Err(XTreeError::InvalidOperation(
                "cache must hold at least one page".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates the settings and derives node capacities and minima.
    pub fn derive_parameters(&self) -> XTreeResult<TreeParameters> {
        self.validate()?;

        let dim = self.dimensionality;
        let leaf_fit = (self.page_size - NODE_HEADER_BYTES) / leaf_entry_size(dim);
        let dir_fit = (self.page_size - NODE_HEADER_BYTES) / directory_entry_size(dim);

        let leaf_capacity = checked_capacity("leaf", self.leaf_capacity, leaf_fit)?;
        let dir_capacity = checked_capacity("directory", self.dir_capacity, dir_fit)?;

        let dir_minimum = relative_minimum(dir_capacity, self.relative_min_entries);
        let leaf_minimum = relative_minimum(leaf_capacity, self.relative_min_entries);
        let min_fanout = relative_minimum(dir_capacity, self.relative_min_fanout);

        for (kind, capacity, minimum) in [
            ("directory", dir_capacity, dir_minimum),
            ("leaf", leaf_capacity, leaf_minimum),
        ] {
            if 2 * minimum > capacity {
                return Err(XTreeError::InvalidOperation(format!(
                    "{} capacity {} is too small for minimum fill {}",
                    kind, capacity, minimum
                )));
            }
        }

        Ok(TreeParameters {
            dir_capacity,
            leaf_capacity,
            dir_minimum,
            leaf_minimum,
            min_fanout,
        })
    }
}

/// Node sizing in effect for a tree, either derived from settings or read from a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeParameters {
    /// Entries per directory page, including the overflow slot
    pub dir_capacity: usize,
    /// Entries per leaf page, including the overflow slot
    pub leaf_capacity: usize,
    pub dir_minimum: usize,
    pub leaf_minimum: usize,
    /// Minimum fill a minimum-overlap split may fall back to
    pub min_fanout: usize,
}

/// Encoded size of a leaf entry: object id plus coordinates.
pub fn leaf_entry_size(dim: usize) -> usize {
    8 + 8 * dim
}

/// Encoded size of a directory entry: child id, both corners and the split history words.
pub fn directory_entry_size(dim: usize) -> usize {
    4 + 16 * dim + 8 * dim.div_ceil(64)
}

fn relative_minimum(capacity: usize, relative: f64) -> usize {
    let minimum = ((capacity - 1) as f64 * relative).round() as usize;
    minimum.max(2)
}

fn checked_capacity(kind: &str, requested: Option<usize>, fit: usize) -> XTreeResult<usize> {
    let capacity = match requested {
        Some(capacity) if capacity > fit => {
            return Err(XTreeError::InvalidOperation(format!(
                "{} capacity {} does not fit in a page (at most {})",
                kind, capacity, fit
            )));
        }
        Some(capacity) => capacity,
        None => fit,
    };
    if capacity < MIN_CAPACITY {
        return Err(XTreeError::InvalidOperation(format!(
            "{} capacity {} is below the minimum of {}; increase the page size",
            kind, capacity, MIN_CAPACITY
        )));
    }
    if capacity < WARN_CAPACITY {
        warn!(
            "{} capacity is only {} entries; consider a larger page size",
            kind,
            capacity - 1
        );
    }
    Ok(capacity)
}
