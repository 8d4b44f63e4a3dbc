//! Core types shared across the disk-based X-tree.
//!
//! This module defines:
//! - Error types and the result alias
//! - Identifier aliases for objects and pages
//! - Statistics reported by the tree

use std::io;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur in X-tree operations
#[derive(Debug, Error)]
pub enum XTreeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Page store is not persistent")]
    NotPersistent,

    #[error("Invalid geometry: {0}; rescale your data")]
    InvalidGeometry(String),

    #[error("Corrupted index file: {0}")]
    Corrupted(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Tree is closed")]
    Closed,
}

impl From<bincode::error::EncodeError> for XTreeError {
    fn from(err: bincode::error::EncodeError) -> Self {
        XTreeError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for XTreeError {
    fn from(err: bincode::error::DecodeError) -> Self {
        XTreeError::Serialization(err.to_string())
    }
}

/// Result type for X-tree operations
pub type XTreeResult<T> = Result<T, XTreeError>;

/// Identifier of an indexed data object
pub type ObjectId = u64;

/// Page ID - unique identifier for a node/page in the page store
pub type PageId = u32;

// ============================================================================
// Statistics
// ============================================================================

/// Statistics about X-tree operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub num_elements: u64,
    pub height: u32,
    pub supernodes: u64,
    pub cached_pages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub page_reads: u64,
    pub page_writes: u64,
}
