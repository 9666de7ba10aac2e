//! Quiescent-state notes and reporting into the combining tree.

use std::sync::atomic::Ordering;

use super::Shared;
use crate::context::{ContextId, ContextRecord, ContextState};
use crate::readside::ReadSide;
use crate::tree::ReportOutcome;

impl<R: ReadSide> Shared<R> {
    pub(crate) fn enter_read_side(&self, context: ContextId) {
        if R::TRACKS_READERS {
            self.record(context)
                .read_nesting
                .fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn exit_read_side(&self, context: ContextId) {
        if R::TRACKS_READERS {
            let prev = self
                .record(context)
                .read_nesting
                .fetch_sub(1, Ordering::AcqRel);
            assert!(prev > 0, "context {context} exited a read-side section it never entered");
        }
    }

    /// True if `rec` may be inside a read-side section right now.
    fn in_read_side(&self, rec: &ContextRecord) -> bool {
        R::TRACKS_READERS && rec.read_nesting() > 0
    }

    pub(crate) fn note_context_switch(&self, context: ContextId) {
        let rec = self.record(context);
        if self.in_read_side(rec) {
            return;
        }
        if rec.urgent_qs.swap(false, Ordering::AcqRel) {
            rec.dynticks_momentary();
        }
        self.note_quiescent_state(context);
    }

    pub(crate) fn note_quiescent_state(&self, context: ContextId) {
        let rec = self.record(context);
        if !rec.is_online() || self.in_read_side(rec) {
            return;
        }
        let mut st = rec.lock();
        // Catch up first so that this quiescent state counts for the
        // newest epoch the leaf knows about.
        let needwake = self.note_gp_changes(rec, &mut st);
        st.cpu_no_qs = false;
        if st.core_needs_qs {
            self.report_qs_context(rec, &mut st);
        }
        drop(st);
        self.wake_if(needwake);
    }

    pub(crate) fn idle_enter(&self, context: ContextId) {
        let rec = self.record(context);
        assert!(
            !self.in_read_side(rec),
            "context {context} went idle inside a read-side section"
        );
        rec.dynticks_idle_enter();
    }

    pub(crate) fn idle_exit(&self, context: ContextId) {
        self.record(context).dynticks_idle_exit();
    }

    /// Report a quiescent state already recorded in `st`, if one is owed.
    pub(crate) fn check_quiescent_state(&self, rec: &ContextRecord, st: &mut ContextState) {
        let needwake = self.note_gp_changes(rec, st);
        self.wake_if(needwake);
        if !st.core_needs_qs || st.cpu_no_qs {
            return;
        }
        self.report_qs_context(rec, st);
    }

    /// Push this context's quiescent state into its leaf.
    pub(crate) fn report_qs_context(&self, rec: &ContextRecord, st: &mut ContextState) {
        let leaf_index = rec.leaf();
        let leaf = self.tree.node(leaf_index);
        let mut masks = leaf.lock();
        if st.cpu_no_qs || st.gp_seen != leaf.gp_number() || !leaf.gp_in_progress() {
            // The quiescent state predates the epoch now in progress.
            st.cpu_no_qs = true;
            return;
        }
        if masks.quiescent_mask & rec.grpmask() == 0 {
            // Already credited, e.g. by force-quiescence.
            st.core_needs_qs = false;
            return;
        }
        st.core_needs_qs = false;
        let needwake = self.accelerate_cbs(leaf_index, &mut masks, st);
        let gp = leaf.gp_number();
        let outcome = self
            .tree
            .report_locked(masks, leaf_index, rec.grpmask(), gp);
        rec.sync_mirrors(st);
        if outcome == ReportOutcome::RootCleared {
            log::trace!("{}: context {} closed epoch {gp}", R::NAME, rec.id());
            self.root_cleared();
        }
        self.wake_if(needwake);
    }
}
