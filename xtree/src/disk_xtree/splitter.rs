//! Split strategies for overflowing X-tree nodes.
//!
//! Two strategies are tried in order:
//! - the topological split: an R*-tree style search that picks the axis with
//!   the smallest summed perimeter over all legal distributions, then the
//!   distribution with the least overlap on that axis;
//! - the minimum-overlap split (directories only): the same search with the
//!   minimum fill relaxed to the minimum fanout, restricted to the axes every
//!   entry's subtree has already been split along.
//!
//! A distribution is rejected when its overlap exceeds the tree's maximum
//! overlap. The caller then promotes the node to a supernode.

use log::trace;

use super::settings::{OverlapType, TreeParameters};
use super::xtree_types::{XTreeError, XTreeResult};
use crate::bounding_box::{HyperBoundingBox, SpatialComparable};

/// Counts the data objects below an entry: `(total, inside_window)`.
pub type DataCounter<'a, E> = dyn Fn(&E, &HyperBoundingBox) -> XTreeResult<(usize, usize)> + 'a;

/// An accepted split: entry indices in sorted order, the first
/// `split_point` of which stay in the original node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSorting {
    pub order: Vec<usize>,
    pub split_point: usize,
    pub axis: usize,
}

struct Candidate {
    order: Vec<usize>,
    split_point: usize,
    mbrs: (HyperBoundingBox, HyperBoundingBox),
}

/// Searches split distributions for the entries of one overflowing node.
pub struct XSplitter<'a, E: SpatialComparable> {
    entries: &'a [E],
    params: TreeParameters,
    is_leaf: bool,
    max_overlap: f32,
    overlap_type: OverlapType,
    counter: &'a DataCounter<'a, E>,
    split_axis: Option<usize>,
    past_overlap: f64,
}

impl<'a, E: SpatialComparable> XSplitter<'a, E> {
    pub fn new(
        entries: &'a [E],
        params: TreeParameters,
        is_leaf: bool,
        max_overlap: f32,
        overlap_type: OverlapType,
        counter: &'a DataCounter<'a, E>,
    ) -> Self {
        Self {
            entries,
            params,
            is_leaf,
            max_overlap,
            overlap_type,
            counter,
            split_axis: None,
            past_overlap: -1.0,
        }
    }

    /// Overlap of the last evaluated distribution; NaN when it was not measured.
    pub fn past_overlap(&self) -> f64 {
        self.past_overlap
    }

    /// R*-tree style split under the ordinary minimum fill.
    ///
    /// Leaf splits are always accepted; directory splits only when their
    /// overlap stays within the maximum overlap.
    pub fn topological_split(&mut self) -> XTreeResult<Option<SplitSorting>> {
        let n = self.entries.len();
        if n < 2 {
            return Err(XTreeError::InvalidOperation(
                "splitting less than two entries is pointless".to_string(),
            ));
        }
        let min_entries = if self.is_leaf {
            self.params.leaf_minimum
        } else {
            self.params.dir_minimum
        };
        if 2 * min_entries > n {
            return Ok(None);
        }
        let max_entries = n - min_entries;
        let dims: Vec<usize> = (0..self.dimensionality()).collect();
        self.choose_split_axis(&dims, min_entries, max_entries);
        self.choose_minimum_overlap_split(self.split_axis, min_entries, max_entries, false)
    }

    /// Fallback split for directories after a rejected topological split.
    ///
    /// `common_dims` are the axes shared by all entries' split histories.
    pub fn minimum_overlap_split(
        &mut self,
        common_dims: Option<Vec<usize>>,
    ) -> XTreeResult<Option<SplitSorting>> {
        if self.is_leaf {
            return Err(XTreeError::InvalidOperation(
                "the minimum overlap split only applies to directory nodes".to_string(),
            ));
        }
        let n = self.entries.len();
        if n < 2 {
            return Err(XTreeError::InvalidOperation(
                "splitting less than two entries is pointless".to_string(),
            ));
        }
        let min_fanout = self.params.min_fanout;
        let dir_minimum = self.params.dir_minimum;
        if min_fanout >= dir_minimum {
            return Ok(None);
        }
        let Some(dims) = common_dims.filter(|dims| !dims.is_empty()) else {
            return Ok(None);
        };
        if 2 * min_fanout > n {
            return Ok(None);
        }

        let former_axis = self.split_axis;
        let max_entries = n - min_fanout;
        self.choose_split_axis(&dims, min_fanout, max_entries);

        if former_axis != self.split_axis {
            return self.choose_minimum_overlap_split(
                self.split_axis,
                min_fanout,
                max_entries,
                false,
            );
        }

        // Distributions with at least `dir_minimum` entries per side were
        // already rejected on this axis; only test the relaxed sizes at both ends.
        let mut min_overlap = self.past_overlap;
        let first =
            self.choose_minimum_overlap_split(self.split_axis, min_fanout, dir_minimum - 1, false)?;
        if first.is_some() && self.past_overlap < min_overlap {
            min_overlap = self.past_overlap;
        }
        let second =
            self.choose_minimum_overlap_split(self.split_axis, min_fanout, dir_minimum - 1, true)?;
        match (first, second) {
            (first, None) => {
                self.past_overlap = min_overlap;
                Ok(first)
            }
            (None, second) => Ok(second),
            (Some(first), Some(second)) => {
                if self.past_overlap < min_overlap {
                    Ok(Some(second))
                } else {
                    self.past_overlap = min_overlap;
                    Ok(Some(first))
                }
            }
        }
    }

    fn dimensionality(&self) -> usize {
        self.entries.first().map_or(0, |e| e.dimensionality())
    }

    fn sorted_by_bound(&self, axis: usize, lower: bool) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        if lower {
            order.sort_by(|&a, &b| self.entries[a].min(axis).total_cmp(&self.entries[b].min(axis)));
        } else {
            order.sort_by(|&a, &b| self.entries[a].max(axis).total_cmp(&self.entries[b].max(axis)));
        }
        order
    }

    /// Bounding boxes of every prefix of `order`; `result[i]` covers `order[..=i]`.
    fn running_mbrs<'b, I>(&self, order: I) -> Vec<HyperBoundingBox>
    where
        I: Iterator<Item = &'b usize>,
    {
        let mut boxes: Vec<HyperBoundingBox> = Vec::with_capacity(self.entries.len());
        for &i in order {
            let next = match boxes.last() {
                Some(last) => last.union(&self.entries[i]),
                None => HyperBoundingBox::from_spatial(&self.entries[i]),
            };
            boxes.push(next);
        }
        boxes
    }

    /// Both halves' boxes for every split point in `min..=max`.
    fn distributions(
        &self,
        order: &[usize],
        min: usize,
        max: usize,
    ) -> Vec<(usize, HyperBoundingBox, HyperBoundingBox)> {
        let n = order.len();
        let prefix = self.running_mbrs(order.iter());
        let suffix = self.running_mbrs(order.iter().rev());
        (min..=max)
            .map(|limit| (limit, prefix[limit - 1].clone(), suffix[n - limit - 1].clone()))
            .collect()
    }

    fn surface_sum(&self, order: &[usize], min: usize, max: usize) -> f64 {
        self.distributions(order, min, max)
            .iter()
            .map(|(_, first, second)| first.perimeter() + second.perimeter())
            .sum()
    }

    /// Picks the axis with the smallest perimeter sum over all distributions
    /// of both bound sortings.
    fn choose_split_axis(&mut self, dims: &[usize], min: usize, max: usize) {
        let n = self.entries.len();
        let mut best_sum = f64::INFINITY;
        let mut best_axis = None;
        for &d in dims {
            let by_lb = self.sorted_by_bound(d, true);
            let by_ub = self.sorted_by_bound(d, false);
            let mut sum = self.surface_sum(&by_lb, min, max) + self.surface_sum(&by_ub, min, max);
            if max <= n / 2 {
                // the given range only covers small first halves; add the mirrored ones
                let rev_lb: Vec<usize> = by_lb.iter().rev().copied().collect();
                let rev_ub: Vec<usize> = by_ub.iter().rev().copied().collect();
                sum += self.surface_sum(&rev_lb, min, max) + self.surface_sum(&rev_ub, min, max);
            }
            if sum < best_sum {
                best_sum = sum;
                best_axis = Some(d);
            }
        }
        self.split_axis = best_axis;
    }

    /// Finds the distribution on `axis` with the least intersection volume
    /// (ties: least summed volume) and checks it against the maximum overlap.
    fn choose_minimum_overlap_split(
        &mut self,
        axis: Option<usize>,
        min: usize,
        max: usize,
        revert: bool,
    ) -> XTreeResult<Option<SplitSorting>> {
        let Some(axis) = axis else {
            self.past_overlap = f64::MAX;
            return Ok(None);
        };
        let n = self.entries.len();
        if min == 0 || min > max || max >= n {
            return Ok(None);
        }

        let mut by_lb = self.sorted_by_bound(axis, true);
        let mut by_ub = self.sorted_by_bound(axis, false);
        if revert && max < n / 2 {
            by_lb.reverse();
            by_ub.reverse();
        }

        let mut best: Option<Candidate> = None;
        let mut best_xvolume = f64::INFINITY;
        let mut best_volume = f64::NAN;
        for order in [&by_lb, &by_ub] {
            for (limit, first, second) in self.distributions(order, min, max) {
                let xvolume = first.overlap(&second);
                if xvolume < best_xvolume {
                    best_xvolume = xvolume;
                    best_volume = f64::NAN;
                    best = Some(Candidate {
                        order: order.clone(),
                        split_point: limit,
                        mbrs: (first, second),
                    });
                } else if xvolume == best_xvolume {
                    if let Some(current) = &best {
                        if best_volume.is_nan() {
                            best_volume = current.mbrs.0.volume() + current.mbrs.1.volume();
                        }
                        let volume = first.volume() + second.volume();
                        if volume < best_volume {
                            best_volume = volume;
                            best = Some(Candidate {
                                order: order.clone(),
                                split_point: limit,
                                mbrs: (first, second),
                            });
                        }
                    }
                }
            }
        }
        let Some(best) = best else {
            return Ok(None);
        };

        if self.is_leaf || self.max_overlap >= 1.0 {
            self.past_overlap = f64::NAN;
            return Ok(Some(self.sorting(best, axis)));
        }

        self.past_overlap = match self.overlap_type {
            OverlapType::DataOverlap => self.ratio_of_data_in_intersection(&best)?,
            OverlapType::VolumeOverlap => {
                if best_volume.is_nan() {
                    best_volume = best.mbrs.0.volume() + best.mbrs.1.volume();
                }
                best_xvolume / best_volume
            }
        };
        if (self.max_overlap as f64) < self.past_overlap {
            trace!(
                "no {} split found on axis {}{}; best {} overlap was {:.3}",
                if min == self.params.min_fanout { "minimum overlap" } else { "topological" },
                axis,
                if max < n / 2 {
                    if revert { " in second range" } else { " in first range" }
                } else {
                    ""
                },
                match self.overlap_type {
                    OverlapType::DataOverlap => "data",
                    OverlapType::VolumeOverlap => "volume",
                },
                self.past_overlap
            );
            return Ok(None);
        }
        Ok(Some(self.sorting(best, axis)))
    }

    /// Share of the data objects below both halves that fall into the halves'
    /// intersection.
    fn ratio_of_data_in_intersection(&self, candidate: &Candidate) -> XTreeResult<f64> {
        let Some(window) = candidate.mbrs.0.intersection(&candidate.mbrs.1) else {
            return Ok(0.0);
        };
        let mut total = 0usize;
        let mut inside = 0usize;
        for &i in &candidate.order {
            let (t, x) = (self.counter)(&self.entries[i], &window)?;
            total += t;
            inside += x;
        }
        if total == 0 {
            return Ok(0.0);
        }
        Ok(inside as f64 / total as f64)
    }

    fn sorting(&self, candidate: Candidate, axis: usize) -> SplitSorting {
        SplitSorting {
            order: candidate.order,
            split_point: candidate.split_point,
            axis,
        }
    }
}
