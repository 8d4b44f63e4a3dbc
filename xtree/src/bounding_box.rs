//! Axis-aligned bounding boxes in `D` dimensions and the volume/overlap
//! arithmetic the X-tree needs for routing and splitting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Anything that occupies an axis-aligned region: points, boxes and tree
/// entries all expose their per-axis extent through this trait.
pub trait SpatialComparable {
    /// Number of axes.
    fn dimensionality(&self) -> usize;

    /// Lower bound on axis `d`.
    fn min(&self, d: usize) -> f64;

    /// Upper bound on axis `d`.
    fn max(&self, d: usize) -> f64;
}

/// A `D`-dimensional axis-aligned bounding box.
///
/// `HyperBoundingBox` defines a region using per-axis minimum and maximum
/// coordinates. A point is a box whose minimum and maximum coincide.
///
/// # Examples
///
/// ```rust
/// use xtree::HyperBoundingBox;
///
/// let a = HyperBoundingBox::new(vec![0.0, 0.0], vec![2.0, 2.0]);
/// let b = HyperBoundingBox::new(vec![1.0, 1.0], vec![3.0, 3.0]);
///
/// assert_eq!(a.volume(), 4.0);
/// assert_eq!(a.overlap(&b), 1.0);
/// assert!(a.union(&b).contains(&b));
/// ```
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct HyperBoundingBox {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl HyperBoundingBox {
    /// Creates a box from its lower and upper corners.
    ///
    /// Both corners must have the same number of coordinates.
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> HyperBoundingBox {
        debug_assert_eq!(min.len(), max.len(), "corner dimensionality mismatch");
        HyperBoundingBox { min, max }
    }

    /// Creates the degenerate box covering exactly one point.
    pub fn from_point(coords: &[f64]) -> HyperBoundingBox {
        HyperBoundingBox {
            min: coords.to_vec(),
            max: coords.to_vec(),
        }
    }

    /// Copies the extent of any spatial object into a box.
    pub fn from_spatial<S: SpatialComparable + ?Sized>(s: &S) -> HyperBoundingBox {
        let dim = s.dimensionality();
        HyperBoundingBox {
            min: (0..dim).map(|d| s.min(d)).collect(),
            max: (0..dim).map(|d| s.max(d)).collect(),
        }
    }

    /// The union of a sequence of spatial objects, or `None` for an empty one.
    pub fn union_of<'a, S, I>(items: I) -> Option<HyperBoundingBox>
    where
        S: SpatialComparable + 'a + ?Sized,
        I: IntoIterator<Item = &'a S>,
    {
        let mut iter = items.into_iter();
        let mut mbr = HyperBoundingBox::from_spatial(iter.next()?);
        for item in iter {
            mbr.extend(item);
        }
        Some(mbr)
    }

    pub fn min_coords(&self) -> &[f64] {
        &self.min
    }

    pub fn max_coords(&self) -> &[f64] {
        &self.max
    }

    /// Product of the side lengths.
    pub fn volume(&self) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| hi - lo)
            .product()
    }

    /// Sum of the side lengths (the R*-tree "margin").
    pub fn perimeter(&self) -> f64 {
        self.min.iter().zip(&self.max).map(|(lo, hi)| hi - lo).sum()
    }

    /// Centre coordinate on every axis.
    pub fn center(&self) -> Vec<f64> {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect()
    }

    /// Grows this box so it also covers `other`.
    pub fn extend<S: SpatialComparable + ?Sized>(&mut self, other: &S) {
        for d in 0..self.min.len() {
            let lo = other.min(d);
            if lo < self.min[d] {
                self.min[d] = lo;
            }
            let hi = other.max(d);
            if hi > self.max[d] {
                self.max[d] = hi;
            }
        }
    }

    /// Smallest box covering both `self` and `other`.
    pub fn union<S: SpatialComparable + ?Sized>(&self, other: &S) -> HyperBoundingBox {
        let mut mbr = self.clone();
        mbr.extend(other);
        mbr
    }

    /// `true` if `other` lies completely inside this box.
    pub fn contains<S: SpatialComparable + ?Sized>(&self, other: &S) -> bool {
        (0..self.min.len()).all(|d| self.min[d] <= other.min(d) && self.max[d] >= other.max(d))
    }

    /// `true` if the boxes share at least one point (touching counts).
    pub fn intersects<S: SpatialComparable + ?Sized>(&self, other: &S) -> bool {
        (0..self.min.len()).all(|d| self.min[d] <= other.max(d) && self.max[d] >= other.min(d))
    }

    /// The common region of both boxes, or `None` if they are disjoint.
    pub fn intersection<S: SpatialComparable + ?Sized>(&self, other: &S) -> Option<HyperBoundingBox> {
        let dim = self.min.len();
        let mut min = Vec::with_capacity(dim);
        let mut max = Vec::with_capacity(dim);
        for d in 0..dim {
            let lo = self.min[d].max(other.min(d));
            let hi = self.max[d].min(other.max(d));
            if lo > hi {
                return None;
            }
            min.push(lo);
            max.push(hi);
        }
        Some(HyperBoundingBox { min, max })
    }

    /// Volume of the common region; zero for disjoint boxes.
    pub fn overlap<S: SpatialComparable + ?Sized>(&self, other: &S) -> f64 {
        let mut volume = 1.0;
        for d in 0..self.min.len() {
            let side = self.max[d].min(other.max(d)) - self.min[d].max(other.min(d));
            if side <= 0.0 {
                return 0.0;
            }
            volume *= side;
        }
        volume
    }

    /// Squared Euclidean distance from `point` to the nearest point of the box.
    pub fn min_dist_sq(&self, point: &[f64]) -> f64 {
        point
            .iter()
            .enumerate()
            .map(|(d, &p)| {
                let closest = p.clamp(self.min[d], self.max[d]);
                (p - closest) * (p - closest)
            })
            .sum()
    }
}

impl SpatialComparable for HyperBoundingBox {
    fn dimensionality(&self) -> usize {
        self.min.len()
    }

    fn min(&self, d: usize) -> f64 {
        self.min[d]
    }

    fn max(&self, d: usize) -> f64 {
        self.max[d]
    }
}

impl SpatialComparable for [f64] {
    fn dimensionality(&self) -> usize {
        self.len()
    }

    fn min(&self, d: usize) -> f64 {
        self[d]
    }

    fn max(&self, d: usize) -> f64 {
        self[d]
    }
}

impl fmt::Display for HyperBoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HyperBoundingBox(")?;
        for d in 0..self.min.len() {
            if d > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[{}, {}]", self.min[d], self.max[d])?;
        }
        write!(f, ")")
    }
}
