//! Bringing contexts online and offline, and the orphanage that carries a
//! departing context's callbacks to a survivor.
//!
//! Hotplug operations serialize on the flavor's hotplug lock (write side).
//! Barrier holds the read side so that no context leaves while sentinels
//! are being queued.

use std::sync::atomic::Ordering;

use crate::context::ContextId;
use crate::flavor::Shared;
use crate::readside::ReadSide;
use crate::tree::ReportOutcome;

impl<R: ReadSide> Shared<R> {
    pub(crate) fn cpu_online(&self, context: ContextId) {
        let rec = self.record(context);
        let hotplug = self.hotplug.write();
        assert!(!rec.is_online(), "context {context} is already online");
        {
            let leaf = self.tree.node(rec.leaf());
            let mut st = rec.lock();
            // Whatever epoch is in flight did not count on us.
            st.gp_seen = leaf.gp_number();
            st.completed_seen = leaf.completed();
            st.cpu_no_qs = true;
            st.core_needs_qs = false;
            st.blimit = self.config.blimit;
            st.qlen_last_fqs_check = 0;
            st.n_force_qs_snap = self.counters.n_force_qs.load(Ordering::Relaxed);
            rec.sync_mirrors(&st);
        }
        rec.dynticks_online();
        rec.read_nesting.store(0, Ordering::Relaxed);
        self.tree.set_context_online(context, true);
        rec.online.store(true, Ordering::Release);
        drop(hotplug);
        log::debug!("{}: context {context} online", R::NAME);

        if self.orphans_pending.load(Ordering::Acquire) {
            self.adopt(context);
        }
    }

    pub(crate) fn cpu_offline(&self, context: ContextId) {
        let rec = self.record(context);
        let hotplug = self.hotplug.write();
        assert!(
            rec.online.swap(false, Ordering::AcqRel),
            "context {context} is already offline"
        );

        let moved = {
            let mut orphans = self.orphans.lock();
            let mut st = rec.lock();
            let detached = st.callbacks.detach();
            let moved = detached.len();
            orphans.absorb(detached);
            if !orphans.is_empty() {
                self.orphans_pending.store(true, Ordering::Release);
            }
            rec.sync_mirrors(&st);
            moved
        };
        rec.wants_gp.store(false, Ordering::Relaxed);
        rec.invoke_again.store(false, Ordering::Relaxed);
        rec.urgent_qs.store(false, Ordering::Relaxed);
        rec.counters
            .orphaned
            .fetch_add(moved as u64, Ordering::Relaxed);
        self.counters
            .orphaned
            .fetch_add(moved as u64, Ordering::Relaxed);

        self.tree.set_context_online(context, false);

        // An offline context cannot block the epoch in flight.
        let leaf_index = rec.leaf();
        let leaf = self.tree.node(leaf_index);
        let masks = leaf.lock();
        if leaf.gp_in_progress() && masks.quiescent_mask & rec.grpmask() != 0 {
            let gp = leaf.gp_number();
            if self.tree.report_locked(masks, leaf_index, rec.grpmask(), gp)
                == ReportOutcome::RootCleared
            {
                self.root_cleared();
            }
        } else {
            drop(masks);
        }
        drop(hotplug);
        log::debug!("{}: context {context} offline, {moved} callbacks orphaned", R::NAME);

        if let Some(heir) = self.contexts.iter().find(|r| r.is_online()) {
            self.adopt(heir.id());
        }
    }

    /// Splice the orphanage onto `context`. Returns how many callbacks moved.
    pub(crate) fn adopt(&self, context: ContextId) -> usize {
        let rec = self.record(context);
        let (moved, needwake) = {
            let mut orphans = self.orphans.lock();
            if !rec.is_online() || orphans.is_empty() {
                return 0;
            }
            let detached = std::mem::take(&mut *orphans);
            self.orphans_pending.store(false, Ordering::Release);
            let moved = detached.len();

            let mut st = rec.lock();
            st.callbacks.adopt(detached);
            if st.callbacks.has_ready() {
                rec.invoke_again.store(true, Ordering::Release);
            }
            let needwake = if !st.callbacks.has_untagged() {
                false
            } else if self.gp_in_progress() {
                rec.wants_gp.store(true, Ordering::Release);
                false
            } else {
                let mut root = self.tree.root().lock();
                self.start_gp(&mut root, &mut st)
            };
            rec.sync_mirrors(&st);
            (moved, needwake)
        };
        rec.counters
            .adopted
            .fetch_add(moved as u64, Ordering::Relaxed);
        self.counters
            .adopted
            .fetch_add(moved as u64, Ordering::Relaxed);
        self.wake_if(needwake);
        log::debug!("{}: context {context} adopted {moved} callbacks", R::NAME);
        moved
    }
}
