//! Deferring callbacks and running them once they are safe.

use std::sync::atomic::Ordering;

use super::{InvokeOutcome, Shared};
use crate::callbacks::Callback;
use crate::context::{ContextId, ContextRecord, ContextState};
use crate::readside::ReadSide;

impl<R: ReadSide> Shared<R> {
    pub(crate) fn defer(&self, context: ContextId, callback: Callback) {
        let rec = self.record(context);
        assert!(rec.is_online(), "defer on offline context {context}");
        let mut st = rec.lock();
        st.callbacks.enqueue(callback);
        let needwake = self.after_enqueue(rec, &mut st);
        rec.sync_mirrors(&st);
        drop(st);
        self.wake_if(needwake);
    }

    /// Get a grace period moving for freshly queued callbacks, escalating
    /// when the queue has grown past the high-water mark.
    pub(crate) fn after_enqueue(&self, rec: &ContextRecord, st: &mut ContextState) -> bool {
        let qlen = st.callbacks.len();
        if qlen > st.qlen_last_fqs_check + self.config.qhimark {
            let mut needwake = self.note_gp_changes(rec, st);
            if !self.gp_in_progress() {
                let mut root = self.tree.root().lock();
                needwake |= self.start_gp(&mut root, st);
            } else {
                st.blimit = usize::MAX;
                let n_force_qs = self.counters.n_force_qs.load(Ordering::Relaxed);
                if n_force_qs == st.n_force_qs_snap {
                    self.counters.fqs_requested.fetch_add(1, Ordering::Relaxed);
                    self.request_force_qs();
                }
                st.n_force_qs_snap = self.counters.n_force_qs.load(Ordering::Relaxed);
            }
            log::warn!(
                "{}: context {} has {qlen} callbacks queued, escalating",
                R::NAME,
                rec.id()
            );
            st.qlen_last_fqs_check = qlen;
            return needwake;
        }

        if !self.gp_in_progress() && self.may_need_another_gp(st) {
            let mut root = self.tree.root().lock();
            return self.start_gp(&mut root, st);
        }
        // Left untagged behind an epoch in flight or about to start: the
        // coordinator tags these at cleanup.
        if st.callbacks.has_untagged() {
            rec.wants_gp.store(true, Ordering::Release);
        }
        false
    }

    pub(crate) fn invoke_ready(&self, context: ContextId, limit: usize) -> InvokeOutcome {
        let rec = self.record(context);
        let batch = {
            let mut st = rec.lock();
            let batch = st.callbacks.take_ready(limit);
            st.invoking += batch.len();
            rec.sync_mirrors(&st);
            batch
        };
        let invoked = batch.len();
        // Callbacks run unlocked: they may defer more work on this context.
        for callback in batch {
            callback();
        }
        rec.counters
            .invoked
            .fetch_add(invoked as u64, Ordering::Relaxed);

        let mut st = rec.lock();
        st.invoking -= invoked;
        let qlen = st.callbacks.len();
        if st.blimit == usize::MAX && qlen <= self.config.qlowmark {
            st.blimit = self.config.blimit;
        }
        if qlen == 0 && st.qlen_last_fqs_check != 0 {
            st.qlen_last_fqs_check = 0;
            st.n_force_qs_snap = self.counters.n_force_qs.load(Ordering::Relaxed);
        } else if qlen < st.qlen_last_fqs_check.saturating_sub(self.config.qhimark) {
            st.qlen_last_fqs_check = qlen;
        }
        let more_ready = st.callbacks.has_ready();
        rec.invoke_again.store(more_ready, Ordering::Release);
        rec.sync_mirrors(&st);
        InvokeOutcome {
            invoked,
            more_ready,
        }
    }

    pub(crate) fn process_callbacks(&self, context: ContextId) -> InvokeOutcome {
        let rec = self.record(context);
        if !rec.is_online() {
            return InvokeOutcome::default();
        }
        if self.orphans_pending.load(Ordering::Acquire) {
            self.adopt(context);
        }
        rec.invoke_again.store(false, Ordering::Release);

        let limit = {
            let mut st = rec.lock();
            self.check_quiescent_state(rec, &mut st);
            let needwake = if self.may_need_another_gp(&st) {
                let mut root = self.tree.root().lock();
                self.start_gp(&mut root, &mut st)
            } else {
                false
            };
            rec.sync_mirrors(&st);
            let limit = st.blimit;
            drop(st);
            self.wake_if(needwake);
            limit
        };
        self.invoke_ready(context, limit)
    }

    pub(crate) fn callbacks_pending(&self, context: ContextId) -> bool {
        let rec = self.record(context);
        if !rec.is_online() {
            return false;
        }
        if rec.invoke_again.load(Ordering::Acquire) || self.orphans_pending.load(Ordering::Acquire)
        {
            return true;
        }
        let leaf = self.tree.node(rec.leaf());
        let st = rec.lock();
        (st.core_needs_qs && !st.cpu_no_qs)
            || st.callbacks.has_ready()
            || self.may_need_another_gp(&st)
            || st.completed_seen != leaf.completed()
            || st.gp_seen != leaf.gp_number()
    }

    pub(crate) fn tick(&self, context: ContextId, from_idle_or_user: bool) -> InvokeOutcome {
        if from_idle_or_user {
            self.note_quiescent_state(context);
        }
        self.check_self_stall(context);
        if self.callbacks_pending(context) {
            self.process_callbacks(context)
        } else {
            InvokeOutcome::default()
        }
    }
}
