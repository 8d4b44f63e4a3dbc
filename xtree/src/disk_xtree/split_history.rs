//! Per-entry record of the axes a subtree has already been split along.

use smallvec::SmallVec;

/// A bitset over the `D` axes of the tree.
///
/// Histories are plain values: every directory entry owns its own copy and
/// cloning never shares state between entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitHistory {
    dim: usize,
    words: SmallVec<[u64; 4]>,
}

impl SplitHistory {
    /// An empty history over `dim` axes.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            words: SmallVec::from_elem(0, Self::word_count(dim)),
        }
    }

    /// Rebuilds a history from its encoded words, dropping bits beyond `dim`.
    pub fn from_words(dim: usize, words: &[u64]) -> Self {
        let mut history = Self::new(dim);
        for (slot, word) in history.words.iter_mut().zip(words) {
            *slot = *word;
        }
        if dim % 64 != 0 {
            if let Some(last) = history.words.last_mut() {
                *last &= (1u64 << (dim % 64)) - 1;
            }
        }
        history
    }

    /// Number of 64-bit words needed to store a history over `dim` axes.
    pub fn word_count(dim: usize) -> usize {
        dim.div_ceil(64)
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn dimensionality(&self) -> usize {
        self.dim
    }

    /// Records a split along `axis`.
    pub fn add(&mut self, axis: usize) {
        debug_assert!(axis < self.dim, "axis {} out of range", axis);
        self.words[axis / 64] |= 1u64 << (axis % 64);
    }

    pub fn contains(&self, axis: usize) -> bool {
        axis < self.dim && self.words[axis / 64] & (1u64 << (axis % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Axes recorded in this history, ascending.
    pub fn dimensions(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.dim).filter(move |&axis| self.contains(axis))
    }

    /// Axes shared by every history in `histories`.
    ///
    /// Returns `None` when there are no histories or they share no axis.
    pub fn common_dimensions<'a, I>(histories: I) -> Option<Vec<usize>>
    where
        I: IntoIterator<Item = &'a SplitHistory>,
    {
        let mut iter = histories.into_iter();
        let mut common = iter.next()?.clone();
        for history in iter {
            for (acc, word) in common.words.iter_mut().zip(&history.words) {
                *acc &= *word;
            }
        }
        let dims: Vec<usize> = common.dimensions().collect();
        if dims.is_empty() {
            None
        } else {
            Some(dims)
        }
    }
}
