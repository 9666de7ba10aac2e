//! Epoch accounting: noticing epoch changes, tagging callbacks with the
//! epoch that makes them safe, and asking for future grace periods.
//!
//! Functions taking `&mut NodeMasks` expect the caller to hold that node's
//! lock; functions taking `&mut ContextState` expect the context lock.

use std::sync::atomic::Ordering;

use super::{GP_FLAG_INIT, Shared};
use crate::context::{ContextRecord, ContextState};
use crate::readside::ReadSide;
use crate::tree::{NodeMasks, ROOT};

impl<R: ReadSide> Shared<R> {
    /// Epoch that callbacks tagged now, as seen through `node`, must wait
    /// for. Only the root knows that no grace period is in flight, so any
    /// other node assumes one might be and waits for the one after it.
    pub(crate) fn cbs_completed(&self, node: usize) -> u64 {
        let n = self.tree.node(node);
        if node == ROOT && !n.gp_in_progress() {
            n.completed() + 1
        } else {
            n.completed() + 2
        }
    }

    /// Record that a context needs the epoch computed through `node`.
    /// Returns true if the coordinator must be woken.
    pub(crate) fn request_future_gp(
        &self,
        node: usize,
        masks: &mut NodeMasks,
        st: &mut ContextState,
    ) -> bool {
        let c = self.cbs_completed(node);
        let slot = (c & 1) as usize;
        if masks.need_future_gp[slot] != 0 {
            return false;
        }
        let root = self.tree.root();
        if self.tree.node(node).gp_in_progress() || root.gp_in_progress() {
            // Cleanup of the epoch in flight will see this request.
            masks.need_future_gp[slot] += 1;
            return false;
        }
        if node == ROOT {
            return self.request_at_root(masks, st);
        }
        let mut root_masks = root.lock();
        self.request_at_root(&mut root_masks, st)
    }

    fn request_at_root(&self, root_masks: &mut NodeMasks, st: &mut ContextState) -> bool {
        let c = self.cbs_completed(ROOT);
        // The root can promise an earlier epoch than the leaf assumed.
        st.callbacks.lower_epochs(c);
        let slot = (c & 1) as usize;
        if root_masks.need_future_gp[slot] != 0 {
            return false;
        }
        root_masks.need_future_gp[slot] += 1;
        if self.tree.root().gp_in_progress() {
            return false;
        }
        self.start_gp_advanced(root_masks, st)
    }

    /// True if this context's queue or a pending root request calls for a
    /// new grace period. Caller holds the root lock.
    fn cpu_needs_another_gp(&self, root_masks: &NodeMasks, st: &ContextState) -> bool {
        if self.gp_in_progress() {
            return false;
        }
        let completed = self.completed();
        root_masks.need_future_gp[((completed + 1) & 1) as usize] != 0
            || st.callbacks.needs_grace_period(completed)
    }

    /// Lockless pre-check for [`Self::cpu_needs_another_gp`].
    pub(crate) fn may_need_another_gp(&self, st: &ContextState) -> bool {
        !self.gp_in_progress()
            && self.gp_flags.load(Ordering::Acquire) & GP_FLAG_INIT == 0
            && st.callbacks.needs_grace_period(self.completed())
    }

    /// Set the start request if needed. Caller holds the root lock.
    pub(crate) fn start_gp_advanced(&self, root_masks: &NodeMasks, st: &ContextState) -> bool {
        if !self.cpu_needs_another_gp(root_masks, st) {
            return false;
        }
        self.gp_flags.fetch_or(GP_FLAG_INIT, Ordering::AcqRel);
        true
    }

    /// Bring the queue up to date with the root's view, then request a
    /// grace period if one is needed. Caller holds the root lock.
    pub(crate) fn start_gp(&self, root_masks: &mut NodeMasks, st: &mut ContextState) -> bool {
        let needwake = self.advance_cbs(ROOT, root_masks, st);
        needwake | self.start_gp_advanced(root_masks, st)
    }

    pub(crate) fn accelerate_cbs(
        &self,
        node: usize,
        masks: &mut NodeMasks,
        st: &mut ContextState,
    ) -> bool {
        let c = self.cbs_completed(node);
        if !st.callbacks.accelerate(c) {
            return false;
        }
        self.request_future_gp(node, masks, st)
    }

    pub(crate) fn advance_cbs(
        &self,
        node: usize,
        masks: &mut NodeMasks,
        st: &mut ContextState,
    ) -> bool {
        st.callbacks.advance(self.tree.node(node).completed());
        self.accelerate_cbs(node, masks, st)
    }

    /// Catch a context up with its leaf's epoch numbers. Returns true if
    /// the coordinator must be woken.
    pub(crate) fn note_gp_changes(&self, rec: &ContextRecord, st: &mut ContextState) -> bool {
        let leaf = self.tree.node(rec.leaf());
        if st.gp_seen == leaf.gp_number() && st.completed_seen == leaf.completed() {
            return false;
        }
        let mut masks = leaf.lock();
        self.note_gp_changes_locked(rec, &mut masks, st)
    }

    pub(crate) fn note_gp_changes_locked(
        &self,
        rec: &ContextRecord,
        masks: &mut NodeMasks,
        st: &mut ContextState,
    ) -> bool {
        let leaf = self.tree.node(rec.leaf());
        let needwake = if st.completed_seen == leaf.completed() {
            self.accelerate_cbs(rec.leaf(), masks, st)
        } else {
            let needwake = self.advance_cbs(rec.leaf(), masks, st);
            st.completed_seen = leaf.completed();
            needwake
        };

        if st.gp_seen != leaf.gp_number() {
            st.gp_seen = leaf.gp_number();
            let owed = masks.quiescent_mask & rec.grpmask() != 0;
            st.cpu_no_qs = owed;
            st.core_needs_qs = owed;
        }
        rec.sync_mirrors(st);
        needwake
    }

    pub(crate) fn accelerate_context(&self, context: usize) -> bool {
        let rec = self.record(context);
        let mut st = rec.lock();
        let mut masks = self.tree.node(rec.leaf()).lock();
        let needwake = self.accelerate_cbs(rec.leaf(), &mut masks, &mut st);
        drop(masks);
        rec.sync_mirrors(&st);
        drop(st);
        self.wake_if(needwake);
        needwake
    }

    pub(crate) fn advance_context(&self, context: usize) -> bool {
        let rec = self.record(context);
        let mut st = rec.lock();
        let before = st.callbacks.ready_len();
        let mut masks = self.tree.node(rec.leaf()).lock();
        let needwake = self.advance_cbs(rec.leaf(), &mut masks, &mut st);
        drop(masks);
        let became_ready = st.callbacks.ready_len() > before;
        if became_ready {
            rec.invoke_again.store(true, Ordering::Release);
        }
        drop(st);
        self.wake_if(needwake);
        became_ready
    }
}
