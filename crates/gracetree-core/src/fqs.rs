//! Force-quiescence scans and stall detection.
//!
//! A scan walks every leaf that still waits on someone and credits
//! contexts that are offline or have been idle since the scan's first
//! pass. Contexts that keep running without reporting are first asked for
//! an urgent momentary quiescent state, then rescheduled through the
//! hooks, and finally dumped as stalled.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::context::{ContextId, dynticks_in_eqs_since};
use crate::flavor::{CoordinatorState, Shared};
use crate::readside::ReadSide;
use crate::tree::ReportOutcome;

fn ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// One context's line in a stall dump.
#[derive(Debug)]
struct StalledContext {
    context: ContextId,
    dynticks: u64,
    gp_seen: u64,
    queued: usize,
    read_nesting: u32,
}

impl<R: ReadSide> Shared<R> {
    /// Arm the stall deadline at the start of a grace period.
    pub(crate) fn record_gp_stall_check_time(&self) {
        let now = self.now_ns();
        self.timing.gp_start_ns.store(now, Ordering::Relaxed);
        self.timing.gp_activity_ns.store(now, Ordering::Relaxed);
        self.timing.stall_deadline_ns.store(
            now.saturating_add(ns(self.config.stall_timeout)),
            Ordering::Relaxed,
        );
    }

    /// Credit every context that cannot be inside a read-side section.
    /// The first pass of an epoch only snapshots dynticks counters.
    pub(crate) fn force_quiescent_scan(&self, first: bool) {
        self.counters.n_force_qs.fetch_add(1, Ordering::Relaxed);
        let elapsed = self
            .now_ns()
            .saturating_sub(self.timing.gp_start_ns.load(Ordering::Relaxed));
        let urgent_after = ns(self.config.sched_qs_delay);
        let mut resched = Vec::new();
        let mut credited = 0usize;

        for leaf_index in self.tree.leaves() {
            let leaf = self.tree.node(leaf_index);
            let masks = leaf.lock();
            if masks.quiescent_mask == 0 || !leaf.gp_in_progress() {
                continue;
            }
            let gp = leaf.gp_number();
            let mut mask = 0u64;
            for context in self.tree.contexts_in(leaf_index, masks.quiescent_mask) {
                let rec = &self.contexts[context];
                let curr = rec.dynticks();
                let quiescent = if !rec.is_online() {
                    rec.counters.offline_fqs.fetch_add(1, Ordering::Relaxed);
                    true
                } else if first {
                    rec.dynticks_snap.store(curr, Ordering::Relaxed);
                    curr & 1 == 0
                } else {
                    dynticks_in_eqs_since(rec.dynticks_snap.load(Ordering::Relaxed), curr)
                };
                if quiescent {
                    if rec.is_online() {
                        rec.counters.dynticks_fqs.fetch_add(1, Ordering::Relaxed);
                    }
                    mask |= rec.grpmask();
                    continue;
                }
                if elapsed > urgent_after {
                    rec.urgent_qs.store(true, Ordering::Release);
                }
                if elapsed > urgent_after.saturating_mul(2) {
                    resched.push(context);
                }
            }
            if mask == 0 {
                continue;
            }
            credited += mask.count_ones() as usize;
            if self.tree.report_locked(masks, leaf_index, mask, gp) == ReportOutcome::RootCleared {
                self.root_cleared();
            }
        }

        for context in resched {
            self.hooks.resched(context);
        }
        log::trace!(
            "{}: force-quiescence pass (first={first}) credited {credited} contexts",
            R::NAME
        );
    }

    /// Contexts still owing a report, read without taking context locks.
    fn stalled_contexts(&self) -> Vec<StalledContext> {
        let mut stalled = Vec::new();
        for leaf_index in self.tree.leaves() {
            let mask = self.tree.node(leaf_index).lock().quiescent_mask;
            for context in self.tree.contexts_in(leaf_index, mask) {
                let rec = &self.contexts[context];
                stalled.push(StalledContext {
                    context,
                    dynticks: rec.dynticks(),
                    gp_seen: rec.gp_seen.load(Ordering::Relaxed),
                    queued: rec.queue_len(),
                    read_nesting: rec.read_nesting(),
                });
            }
        }
        stalled
    }

    /// Claim the current stall deadline if it has passed. Only one caller
    /// wins each deadline; the next one is three timeouts out.
    fn claim_stall_deadline(&self) -> bool {
        let deadline = self.timing.stall_deadline_ns.load(Ordering::Relaxed);
        let now = self.now_ns();
        if !self.gp_in_progress() || now < deadline {
            return false;
        }
        let rearm = now.saturating_add(ns(self.config.stall_timeout).saturating_mul(3));
        self.timing
            .stall_deadline_ns
            .compare_exchange(deadline, rearm, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Coordinator-side check run after every force-quiescence pass.
    pub(crate) fn check_stall(&self) {
        if !self.claim_stall_deadline() {
            return;
        }
        let stalled = self.stalled_contexts();
        if stalled.is_empty() {
            return;
        }
        self.counters.stalls_reported.fetch_add(1, Ordering::Relaxed);
        let gp = self.gp_number();
        let elapsed = Duration::from_nanos(
            self.now_ns()
                .saturating_sub(self.timing.gp_start_ns.load(Ordering::Relaxed)),
        );
        log::error!(
            "{}: grace period {gp} stalled for {elapsed:?} on {} contexts",
            R::NAME,
            stalled.len()
        );
        for entry in &stalled {
            let detail = self.hooks.describe(entry.context);
            log::error!(
                "{}:   context {} dynticks={} gp_seen={} queued={} nesting={} {}",
                R::NAME,
                entry.context,
                entry.dynticks,
                entry.gp_seen,
                entry.queued,
                entry.read_nesting,
                detail.as_deref().unwrap_or("")
            );
            self.hooks.resched(entry.context);
        }
        if self.config.panic_on_stall {
            log::error!("{}: grace period {gp} stalled, aborting", R::NAME);
            log::logger().flush();
            std::process::abort();
        }
    }

    /// Tick-side check: a context that still owes a report past the
    /// deadline reports its own stall, and a silent coordinator is nudged.
    pub(crate) fn check_self_stall(&self, context: ContextId) {
        if !self.gp_in_progress() {
            return;
        }
        self.check_coordinator_starvation();

        let rec = self.record(context);
        if !rec.is_online() {
            return;
        }
        let leaf = self.tree.node(rec.leaf());
        let owed = leaf.gp_in_progress() && leaf.lock().quiescent_mask & rec.grpmask() != 0;
        if !owed || !self.claim_stall_deadline() {
            return;
        }
        self.counters.stalls_reported.fetch_add(1, Ordering::Relaxed);
        let gp = self.gp_number();
        log::error!(
            "{}: context {context} detected its own stall in grace period {gp} (queued={} nesting={})",
            R::NAME,
            rec.queue_len(),
            rec.read_nesting()
        );
        if self.config.panic_on_stall {
            panic!("{}: context {context} stalled grace period {gp}", R::NAME);
        }
    }

    fn check_coordinator_starvation(&self) {
        if self.coordinator_state() != CoordinatorState::WaitQuiescence {
            return;
        }
        let quiet = self
            .now_ns()
            .saturating_sub(self.timing.gp_activity_ns.load(Ordering::Relaxed));
        let limit = ns(self.config.next_fqs_delay)
            .saturating_mul(2)
            .saturating_add(ns(self.config.stall_timeout) / 2);
        if quiet <= limit {
            return;
        }
        log::warn!(
            "{}: coordinator inactive for {:?}, waking it",
            R::NAME,
            Duration::from_nanos(quiet)
        );
        self.note_activity();
        self.wake_coordinator();
    }
}
