//! Tree-wide metadata stored in the first page of an index file.

use serde::{Deserialize, Serialize};

use super::settings::{OverlapType, TreeParameters, XTreeSettings};
use super::xtree_constants::{HEADER_BYTES, MAGIC, VERSION};
use super::xtree_types::{XTreeError, XTreeResult};

/// Fixed-size tree header.
///
/// The first seven fields describe the page layout; the remaining 32 bytes
/// hold the X-tree parameters, the element count and the offset of the
/// supernode region (relative to the start of the page region, 0 if no
/// commit has happened yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub dir_capacity: u32,
    pub leaf_capacity: u32,
    pub dir_minimum: u32,
    pub leaf_minimum: u32,
    pub min_fanout: i32,
    pub num_elements: i64,
    pub dimensionality: i32,
    pub max_overlap: f32,
    pub overlap_type: i32,
    pub supernode_offset: i64,
}

impl TreeHeader {
    pub fn new(settings: &XTreeSettings, params: &TreeParameters) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            page_size: settings.page_size as u32,
            dir_capacity: params.dir_capacity as u32,
            leaf_capacity: params.leaf_capacity as u32,
            dir_minimum: params.dir_minimum as u32,
            leaf_minimum: params.leaf_minimum as u32,
            min_fanout: params.min_fanout as i32,
            num_elements: 0,
            dimensionality: settings.dimensionality as i32,
            max_overlap: settings.max_overlap,
            overlap_type: settings.overlap_type.code(),
            supernode_offset: 0,
        }
    }

    pub fn encode(&self) -> XTreeResult<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::legacy())?)
    }

    pub fn decode(bytes: &[u8]) -> XTreeResult<Self> {
        if bytes.len() < HEADER_BYTES {
            return Err(XTreeError::Corrupted(format!(
                "header needs {} bytes, found {}",
                HEADER_BYTES,
                bytes.len()
            )));
        }
        let (header, _) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
        Ok(header)
    }

    /// Validate header fields
    pub fn validate(&self) -> XTreeResult<()> {
        if self.magic != MAGIC {
            return Err(XTreeError::Corrupted(format!(
                "invalid magic number: expected {:#x}, got {:#x}",
                MAGIC, self.magic
            )));
        }
        if self.version != VERSION {
            return Err(XTreeError::Corrupted(format!(
                "unsupported version: {}",
                self.version
            )));
        }
        if (self.page_size as usize) < HEADER_BYTES || self.dimensionality < 1 {
            return Err(XTreeError::Corrupted(format!(
                "page size {} and dimensionality {} do not describe a tree",
                self.page_size, self.dimensionality
            )));
        }
        if self.dir_capacity < 3
            || self.leaf_capacity < 3
            || self.min_fanout < 1
            || self.num_elements < 0
            || self.supernode_offset < 0
        {
            return Err(XTreeError::Corrupted(
                "header holds invalid capacities or counters".to_string(),
            ));
        }
        if self.supernode_offset % self.page_size as i64 != 0 {
            return Err(XTreeError::Corrupted(format!(
                "supernode offset {} is not page aligned",
                self.supernode_offset
            )));
        }
        OverlapType::from_code(self.overlap_type)?;
        Ok(())
    }

    /// Node sizing recorded in the file.
    pub fn parameters(&self) -> TreeParameters {
        TreeParameters {
            dir_capacity: self.dir_capacity as usize,
            leaf_capacity: self.leaf_capacity as usize,
            dir_minimum: self.dir_minimum as usize,
            leaf_minimum: self.leaf_minimum as usize,
            min_fanout: self.min_fanout as usize,
        }
    }
}
