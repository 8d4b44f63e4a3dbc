//! SpatialIndex trait definition for point indexes.

use crate::bounding_box::HyperBoundingBox;
use crate::disk_xtree::{DiskXTree, ObjectId, XTreeResult};

/// A multidimensional point index.
///
/// Writes take `&mut self`; an index has exactly one writer at a time.
pub trait SpatialIndex: Send {
    /// Adds a point to the index.
    fn add(&mut self, id: ObjectId, point: &[f64]) -> XTreeResult<()>;

    /// Finds the ids of all points inside the window, boundary included.
    fn find_in_window(&self, window: &HyperBoundingBox) -> XTreeResult<Vec<ObjectId>>;

    /// Finds the `k` points closest to `point`, nearest first.
    fn find_nearest(&self, point: &[f64], k: usize) -> XTreeResult<Vec<(ObjectId, f64)>>;

    /// Finds all points within `distance` of `point`, nearest first.
    fn find_within_distance(
        &self,
        point: &[f64],
        distance: f64,
    ) -> XTreeResult<Vec<(ObjectId, f64)>> {
        let mut found = self.find_nearest(point, self.size() as usize)?;
        let within = found.partition_point(|(_, d)| *d <= distance);
        found.truncate(within);
        Ok(found)
    }

    /// Gets the number of points in the index.
    fn size(&self) -> u64;

    fn dimensionality(&self) -> usize;

    /// Closes the index, persisting pending changes.
    fn close(&mut self) -> XTreeResult<()>;
}

impl SpatialIndex for DiskXTree {
    fn add(&mut self, id: ObjectId, point: &[f64]) -> XTreeResult<()> {
        self.insert_point(id, point)
    }

    fn find_in_window(&self, window: &HyperBoundingBox) -> XTreeResult<Vec<ObjectId>> {
        self.range_query(window)
    }

    fn find_nearest(&self, point: &[f64], k: usize) -> XTreeResult<Vec<(ObjectId, f64)>> {
        self.knn_query(point, k)
    }

    fn size(&self) -> u64 {
        self.num_elements()
    }

    fn dimensionality(&self) -> usize {
        DiskXTree::dimensionality(self)
    }

    fn close(&mut self) -> XTreeResult<()> {
        DiskXTree::close(self)
    }
}
