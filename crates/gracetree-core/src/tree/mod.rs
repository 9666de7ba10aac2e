//! Combining tree of report nodes.
//!
//! Quiescent-state reports from many contexts fan in through a shallow tree
//! so that each report contends on one leaf lock plus, rarely, a few
//! ancestors. Nodes live in a breadth-first arena; relations are indices.
//!
//! Locks are always taken child before parent and at most two at a time
//! (a node and its parent), so hand-over-hand walks cannot deadlock.

pub mod geometry;

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use self::geometry::Geometry;

/// Index of the root in the arena.
pub const ROOT: usize = 0;

/// Masks protected by a node's lock.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeMasks {
    /// Children that have not reported for the current epoch.
    pub quiescent_mask: u64,
    /// Children expected to report in each epoch.
    pub init_mask: u64,
    /// Online children, folded into `init_mask` at the next epoch start.
    pub init_mask_next: u64,
    /// Outstanding requests for future epochs, indexed by epoch parity.
    pub need_future_gp: [u32; 2],
}

/// One aggregation point in the combining tree.
#[derive(Debug)]
pub struct ReportNode {
    level: usize,
    parent: Option<usize>,
    children: Range<usize>,
    grpmask: u64,
    gp_number: AtomicU64,
    completed: AtomicU64,
    masks: Mutex<NodeMasks>,
}

impl ReportNode {
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    #[must_use]
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Child node indices, or context ids when this node is a leaf.
    #[must_use]
    pub fn children(&self) -> Range<usize> {
        self.children.clone()
    }

    /// This node's bit in its parent's masks.
    #[must_use]
    pub fn grpmask(&self) -> u64 {
        self.grpmask
    }

    /// Most recent epoch this node has been initialized for.
    #[must_use]
    pub fn gp_number(&self) -> u64 {
        self.gp_number.load(Ordering::Acquire)
    }

    /// Most recent epoch this node has seen completed.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Epoch in progress at this node, if any.
    #[must_use]
    pub fn gp_in_progress(&self) -> bool {
        self.gp_number() != self.completed()
    }

    pub fn lock(&self) -> MutexGuard<'_, NodeMasks> {
        self.masks.lock()
    }
}

/// Result of feeding one quiescent-state report into the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The bit was already clear or the epoch moved on; nothing changed.
    Stale,
    /// The report was recorded but some ancestor still waits on others.
    Absorbed,
    /// This report emptied the root: the epoch can be closed.
    RootCleared,
}

/// Arena of report nodes plus the context-to-leaf map.
#[derive(Debug)]
pub struct CombiningTree {
    geometry: Geometry,
    nodes: Box<[ReportNode]>,
    leaf_of: Box<[usize]>,
}

impl CombiningTree {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        let levels = geometry.levels();
        let contexts = geometry.contexts();
        let mut nodes = Vec::with_capacity(geometry.node_count());

        // Contexts covered by one node on each level.
        let mut stride = vec![1usize; levels];
        let mut acc = 1usize;
        for (level, slot) in stride.iter_mut().enumerate().rev() {
            acc *= geometry.level_spread(level);
            *slot = acc;
        }

        for level in 0..levels {
            for j in 0..geometry.level_count(level) {
                let (parent, grpmask) = if level == 0 {
                    (None, 0)
                } else {
                    let spread = geometry.level_spread(level - 1);
                    (
                        Some(geometry.level_start(level - 1) + j / spread),
                        1u64 << (j % spread),
                    )
                };
                let children = if level == geometry.leaf_level() {
                    let lo = (j * stride[level]).min(contexts);
                    let hi = ((j + 1) * stride[level]).min(contexts);
                    lo..hi
                } else {
                    let spread = geometry.level_spread(level);
                    let first = geometry.level_start(level + 1);
                    let end = first + geometry.level_count(level + 1);
                    (first + j * spread).min(end)..(first + (j + 1) * spread).min(end)
                };
                nodes.push(ReportNode {
                    level,
                    parent,
                    children,
                    grpmask,
                    gp_number: AtomicU64::new(0),
                    completed: AtomicU64::new(0),
                    masks: Mutex::new(NodeMasks::default()),
                });
            }
        }

        let leaf_start = geometry.level_start(geometry.leaf_level());
        let mut leaf_of = vec![leaf_start; contexts];
        for (offset, node) in nodes[leaf_start..].iter().enumerate() {
            for ctx in node.children.clone() {
                leaf_of[ctx] = leaf_start + offset;
            }
        }

        Self {
            geometry,
            nodes: nodes.into_boxed_slice(),
            leaf_of: leaf_of.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn node(&self, index: usize) -> &ReportNode {
        &self.nodes[index]
    }

    #[must_use]
    pub fn root(&self) -> &ReportNode {
        &self.nodes[ROOT]
    }

    /// Nodes in breadth-first order, root first.
    pub fn nodes(&self) -> impl Iterator<Item = (usize, &ReportNode)> {
        self.nodes.iter().enumerate()
    }

    /// Arena indices of the leaf nodes.
    #[must_use]
    pub fn leaves(&self) -> Range<usize> {
        self.geometry.level_start(self.geometry.leaf_level())..self.nodes.len()
    }

    #[must_use]
    pub fn leaf_of(&self, context: usize) -> usize {
        self.leaf_of[context]
    }

    /// A context's bit within its leaf's masks.
    #[must_use]
    pub fn context_bit(&self, context: usize) -> u64 {
        let leaf = &self.nodes[self.leaf_of[context]];
        1u64 << (context - leaf.children.start)
    }

    /// Contexts of `leaf` whose bits are set in `mask`.
    pub fn contexts_in(&self, leaf: usize, mask: u64) -> impl Iterator<Item = usize> + '_ {
        self.nodes[leaf]
            .children
            .clone()
            .filter(move |&ctx| mask & self.context_bit(ctx) != 0)
    }

    #[must_use]
    pub fn root_mask(&self) -> u64 {
        self.root().lock().quiescent_mask
    }

    #[must_use]
    pub fn root_quiescent(&self) -> bool {
        self.root_mask() == 0
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Mark `context` online or offline in its leaf's pending mask.
    /// Returns the previous state.
    pub fn set_context_online(&self, context: usize, online: bool) -> bool {
        let bit = self.context_bit(context);
        let mut masks = self.nodes[self.leaf_of[context]].lock();
        let was = masks.init_mask_next & bit != 0;
        if online {
            masks.init_mask_next |= bit;
        } else {
            masks.init_mask_next &= !bit;
        }
        was
    }

    /// Fold a leaf's pending online mask into `init_mask`, attaching or
    /// detaching the leaf from its ancestors when it gains its first
    /// online context or loses its last one.
    pub fn apply_pending_membership(&self, leaf: usize) {
        let mut masks = self.nodes[leaf].lock();
        let old = masks.init_mask;
        let new = masks.init_mask_next;
        if old == new {
            return;
        }
        masks.init_mask = new;
        if old == 0 {
            self.add_child(leaf);
        } else if new == 0 {
            self.remove_child(leaf);
        }
    }

    /// Record `node` as expected by every ancestor up to the first one that
    /// already had other children. Caller holds `node`'s lock.
    fn add_child(&self, node: usize) {
        let mut mask = self.nodes[node].grpmask;
        let mut cursor = self.nodes[node].parent;
        while let Some(index) = cursor {
            let parent = &self.nodes[index];
            let mut masks = parent.lock();
            let old = masks.init_mask;
            masks.init_mask |= mask;
            if old != 0 {
                return;
            }
            mask = parent.grpmask;
            cursor = parent.parent;
        }
    }

    /// Stop ancestors from expecting `node`, walking up while each ancestor
    /// is left with no children. Caller holds `node`'s lock.
    fn remove_child(&self, node: usize) {
        let mut mask = self.nodes[node].grpmask;
        let mut cursor = self.nodes[node].parent;
        while let Some(index) = cursor {
            let parent = &self.nodes[index];
            let mut masks = parent.lock();
            masks.quiescent_mask &= !mask;
            masks.init_mask &= !mask;
            if masks.init_mask != 0 {
                return;
            }
            mask = parent.grpmask;
            cursor = parent.parent;
        }
    }

    // -----------------------------------------------------------------------
    // Epoch walks
    // -----------------------------------------------------------------------

    /// Start epoch `gp`: apply pending membership at every leaf, then walk
    /// breadth-first resetting each node's quiescent mask and publishing
    /// `gp`. Parents are always published before their children.
    pub fn initialize_epoch(&self, gp: u64) {
        for leaf in self.leaves() {
            self.apply_pending_membership(leaf);
        }
        for node in self.nodes.iter() {
            let mut masks = node.lock();
            masks.quiescent_mask = masks.init_mask;
            node.gp_number.store(gp, Ordering::Release);
        }
    }

    /// Close epoch `gp` breadth-first, releasing each node's future-epoch
    /// request for it. Returns true if any node requested the next epoch.
    pub fn complete_epoch(&self, gp: u64) -> bool {
        let mut needmore = false;
        for node in self.nodes.iter() {
            let mut masks = node.lock();
            debug_assert_eq!(masks.quiescent_mask, 0, "closing epoch with reports pending");
            node.completed.store(gp, Ordering::Release);
            masks.need_future_gp[(gp & 1) as usize] = 0;
            needmore |= masks.need_future_gp[((gp + 1) & 1) as usize] != 0;
        }
        needmore
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    /// Clear `mask` in `node` for epoch `gp` and fan in toward the root.
    pub fn report_quiescent_state(&self, node: usize, mask: u64, gp: u64) -> ReportOutcome {
        let guard = self.nodes[node].lock();
        self.report_locked(guard, node, mask, gp)
    }

    /// Like [`Self::report_quiescent_state`] with `node` already locked.
    /// The guard is released on return.
    pub fn report_locked<'a>(
        &'a self,
        mut guard: MutexGuard<'a, NodeMasks>,
        mut node: usize,
        mut mask: u64,
        gp: u64,
    ) -> ReportOutcome {
        let mut first = true;
        loop {
            let current = &self.nodes[node];
            if guard.quiescent_mask & mask == 0 || current.gp_number() != gp {
                return if first {
                    ReportOutcome::Stale
                } else {
                    ReportOutcome::Absorbed
                };
            }
            guard.quiescent_mask &= !mask;
            if guard.quiescent_mask != 0 {
                return ReportOutcome::Absorbed;
            }
            let Some(parent) = current.parent else {
                return ReportOutcome::RootCleared;
            };
            mask = current.grpmask;
            drop(guard);
            node = parent;
            guard = self.nodes[node].lock();
            first = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(contexts: usize, leaf: usize, fanout: usize) -> CombiningTree {
        CombiningTree::new(Geometry::compute(contexts, leaf, fanout).unwrap())
    }

    fn online_all(t: &CombiningTree) {
        for ctx in 0..t.geometry().contexts() {
            t.set_context_online(ctx, true);
        }
    }

    #[test]
    fn test_arena_relations() {
        let t = tree(8, 4, 4);
        assert_eq!(t.root().parent(), None);
        assert_eq!(t.root().children(), 1..3);
        assert_eq!(t.node(1).parent(), Some(ROOT));
        assert_eq!(t.node(2).grpmask(), 0b10);
        assert_eq!(t.node(2).children(), 4..8);
        assert_eq!(t.leaf_of(5), 2);
        assert_eq!(t.context_bit(5), 0b10);
        assert_eq!(t.leaves(), 1..3);
    }

    #[test]
    fn test_initialize_epoch_propagates_membership() {
        let t = tree(8, 4, 4);
        online_all(&t);
        t.initialize_epoch(1);
        assert_eq!(t.root_mask(), 0b11);
        assert_eq!(t.node(1).lock().quiescent_mask, 0b1111);
        assert_eq!(t.node(2).gp_number(), 1);
        assert!(t.node(2).gp_in_progress());
    }

    #[test]
    fn test_seven_of_eight_keeps_root_pending() {
        let t = tree(8, 4, 4);
        online_all(&t);
        t.initialize_epoch(1);
        for ctx in 0..7 {
            let outcome = t.report_quiescent_state(t.leaf_of(ctx), t.context_bit(ctx), 1);
            assert_ne!(outcome, ReportOutcome::RootCleared);
        }
        assert_ne!(t.root_mask(), 0);
        let last = t.report_quiescent_state(t.leaf_of(7), t.context_bit(7), 1);
        assert_eq!(last, ReportOutcome::RootCleared);
        assert!(t.root_quiescent());
        // A repeat of the final report must not clear the root a second time.
        let again = t.report_quiescent_state(t.leaf_of(7), t.context_bit(7), 1);
        assert_eq!(again, ReportOutcome::Stale);
    }

    #[test]
    fn test_stale_epoch_is_dropped() {
        let t = tree(4, 16, 64);
        online_all(&t);
        t.initialize_epoch(1);
        t.initialize_epoch(2);
        assert_eq!(t.report_quiescent_state(ROOT, 1, 1), ReportOutcome::Stale);
        assert_eq!(t.root_mask(), 0b1111);
    }

    #[test]
    fn test_offline_leaf_detaches_subtree() {
        let t = tree(8, 4, 4);
        online_all(&t);
        t.initialize_epoch(1);
        for ctx in 4..8 {
            t.set_context_online(ctx, false);
        }
        // Membership changes take effect at the next epoch only.
        assert_eq!(t.root().lock().init_mask, 0b11);
        t.initialize_epoch(2);
        assert_eq!(t.root().lock().init_mask, 0b01);
        assert_eq!(t.root_mask(), 0b01);
        for ctx in 0..3 {
            t.report_quiescent_state(t.leaf_of(ctx), t.context_bit(ctx), 2);
        }
        assert_eq!(
            t.report_quiescent_state(t.leaf_of(3), t.context_bit(3), 2),
            ReportOutcome::RootCleared
        );
    }

    #[test]
    fn test_all_offline_epoch_is_trivially_quiescent() {
        let t = tree(8, 4, 4);
        t.initialize_epoch(1);
        assert!(t.root_quiescent());
        assert!(!t.complete_epoch(1));
        assert_eq!(t.node(2).completed(), 1);
    }

    #[test]
    fn test_future_requests_survive_one_cleanup() {
        let t = tree(4, 16, 64);
        t.root().lock().need_future_gp[0] = 1;
        t.initialize_epoch(1);
        assert!(t.complete_epoch(1), "request for epoch 2 must carry over");
        t.initialize_epoch(2);
        assert!(!t.complete_epoch(2));
    }
}
