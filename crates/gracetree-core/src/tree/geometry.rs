//! Combining-tree shape.
//!
//! The tree is as shallow as the fanouts allow: the smallest number of
//! levels whose capacity covers every context, with per-level node counts
//! and per-level spreads chosen so that no node is left without children.

use crate::error::GraceError;

/// Bits in a node mask.
pub const MAX_FANOUT: usize = 64;
/// Deepest supported tree.
pub const MAX_LEVELS: usize = 4;

/// Per-level layout of a combining tree, root level first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    contexts: usize,
    /// Number of nodes on each level.
    level_counts: Vec<usize>,
    /// Children per node on each level (contexts per node at the leaf level).
    level_spread: Vec<usize>,
    /// Index of the first node on each level in breadth-first order.
    level_start: Vec<usize>,
}

impl Geometry {
    /// Compute the shape for `contexts` contexts.
    pub fn compute(contexts: usize, fanout_leaf: usize, fanout: usize) -> Result<Self, GraceError> {
        if contexts == 0 {
            return Err(GraceError::NoContexts);
        }
        if !(2..=MAX_FANOUT).contains(&fanout_leaf) {
            return Err(GraceError::FanoutOutOfRange {
                which: "leaf",
                value: fanout_leaf,
            });
        }
        if !(2..=MAX_FANOUT).contains(&fanout) {
            return Err(GraceError::FanoutOutOfRange {
                which: "interior",
                value: fanout,
            });
        }

        // capacity[i]: contexts covered by a subtree of i+1 levels.
        let mut capacity = [0usize; MAX_LEVELS];
        capacity[0] = fanout_leaf;
        for i in 1..MAX_LEVELS {
            capacity[i] = capacity[i - 1].saturating_mul(fanout);
        }
        let Some(depth) = capacity.iter().position(|&cap| contexts <= cap) else {
            return Err(GraceError::TooManyContexts {
                contexts,
                capacity: capacity[MAX_LEVELS - 1],
            });
        };
        let levels = depth + 1;

        let level_counts: Vec<usize> = (0..levels)
            .map(|level| contexts.div_ceil(capacity[levels - 1 - level]))
            .collect();

        let mut level_spread = vec![0usize; levels];
        let mut below = contexts;
        for level in (0..levels).rev() {
            level_spread[level] = below.div_ceil(level_counts[level]);
            below = level_counts[level];
        }

        let mut level_start = Vec::with_capacity(levels);
        let mut start = 0;
        for &count in &level_counts {
            level_start.push(start);
            start += count;
        }

        Ok(Self {
            contexts,
            level_counts,
            level_spread,
            level_start,
        })
    }

    #[must_use]
    pub fn contexts(&self) -> usize {
        self.contexts
    }

    #[must_use]
    pub fn levels(&self) -> usize {
        self.level_counts.len()
    }

    #[must_use]
    pub fn level_count(&self, level: usize) -> usize {
        self.level_counts[level]
    }

    #[must_use]
    pub fn level_spread(&self, level: usize) -> usize {
        self.level_spread[level]
    }

    #[must_use]
    pub fn level_start(&self, level: usize) -> usize {
        self.level_start[level]
    }

    #[must_use]
    pub fn leaf_level(&self) -> usize {
        self.levels() - 1
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.level_counts.iter().sum()
    }
}
