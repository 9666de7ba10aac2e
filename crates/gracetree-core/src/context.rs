//! Per-context participation record.
//!
//! A context's queue and epoch mirrors sit behind a mutex that only its
//! owner takes in steady state. The coordinator reaches in only for
//! hotplug, barrier sentinels and cleanup-time catch-up. Fields that
//! force-quiescence and stall dumps inspect while holding node locks are
//! atomics, so those paths never take a context lock.
//!
//! Lock order: orphan lock, then context state, then leaf node, then
//! ancestors.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::callbacks::CallbackQueue;

/// Index of an execution context within its flavor.
pub type ContextId = usize;

/// Derived view of where a context stands in the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPhase {
    Offline,
    /// Has seen the latest epoch state and owes nothing.
    UpToDate,
    /// Owes a quiescent-state report for the epoch in progress.
    AwaitingQs,
    /// Reported, waiting for the epoch to close.
    Reported,
}

/// State owned by the context itself.
#[derive(Debug)]
pub struct ContextState {
    /// Latest epoch start this context has noticed.
    pub gp_seen: u64,
    /// Latest epoch end this context has noticed.
    pub completed_seen: u64,
    /// No quiescent state observed yet for `gp_seen`.
    pub cpu_no_qs: bool,
    /// The epoch in `gp_seen` still expects a report from us.
    pub core_needs_qs: bool,
    pub callbacks: CallbackQueue,
    /// Callbacks invoked per pass; raised to unlimited under pressure.
    pub blimit: usize,
    /// Queue length at the last high-water-mark check.
    pub qlen_last_fqs_check: usize,
    /// Force-quiescence round count at the last escalation.
    pub n_force_qs_snap: u64,
    /// Callbacks taken off the queue and not yet finished running.
    pub invoking: usize,
}

impl ContextState {
    fn new(blimit: usize) -> Self {
        Self {
            gp_seen: 0,
            completed_seen: 0,
            cpu_no_qs: true,
            core_needs_qs: false,
            callbacks: CallbackQueue::new(),
            blimit,
            qlen_last_fqs_check: 0,
            n_force_qs_snap: 0,
            invoking: 0,
        }
    }
}

/// Counters exported through flavor statistics.
#[derive(Debug, Default)]
pub struct ContextCounters {
    pub invoked: AtomicU64,
    pub orphaned: AtomicU64,
    pub adopted: AtomicU64,
    pub dynticks_fqs: AtomicU64,
    pub offline_fqs: AtomicU64,
}

/// One execution context's record.
#[derive(Debug)]
pub struct ContextRecord {
    id: ContextId,
    leaf: usize,
    grpmask: u64,
    /// Odd while the context may run readers, even while idle. Bumped by two
    /// for a momentary quiescent state.
    dynticks: AtomicU64,
    /// Coordinator's snapshot of `dynticks` at the first scan of an epoch.
    pub(crate) dynticks_snap: AtomicU64,
    pub(crate) online: AtomicBool,
    /// Explicit read-side nesting, only used by marked flavors.
    pub(crate) read_nesting: AtomicU32,
    /// Asked by force-quiescence for a momentary quiescent state.
    pub(crate) urgent_qs: AtomicBool,
    /// Deferred during an in-flight epoch without tagging; the coordinator
    /// catches these up at cleanup.
    pub(crate) wants_gp: AtomicBool,
    /// `invoke_ready` left callbacks behind.
    pub(crate) invoke_again: AtomicBool,
    /// Mirrors of locked state for lockless diagnostics.
    pub(crate) qlen: AtomicUsize,
    pub(crate) gp_seen: AtomicU64,
    pub(crate) counters: ContextCounters,
    state: Mutex<ContextState>,
}

impl ContextRecord {
    pub(crate) fn new(id: ContextId, leaf: usize, grpmask: u64, blimit: usize) -> Self {
        Self {
            id,
            leaf,
            grpmask,
            dynticks: AtomicU64::new(0),
            dynticks_snap: AtomicU64::new(0),
            online: AtomicBool::new(false),
            read_nesting: AtomicU32::new(0),
            urgent_qs: AtomicBool::new(false),
            wants_gp: AtomicBool::new(false),
            invoke_again: AtomicBool::new(false),
            qlen: AtomicUsize::new(0),
            gp_seen: AtomicU64::new(0),
            counters: ContextCounters::default(),
            state: Mutex::new(ContextState::new(blimit)),
        }
    }

    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Arena index of this context's leaf node.
    #[must_use]
    pub fn leaf(&self) -> usize {
        self.leaf
    }

    /// This context's bit in its leaf's masks.
    #[must_use]
    pub fn grpmask(&self) -> u64 {
        self.grpmask
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.qlen.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn read_nesting(&self) -> u32 {
        self.read_nesting.load(Ordering::Relaxed)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock()
    }

    pub(crate) fn sync_mirrors(&self, st: &ContextState) {
        self.qlen.store(st.callbacks.len(), Ordering::Relaxed);
        self.gp_seen.store(st.gp_seen, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Dyntick counter
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn dynticks(&self) -> u64 {
        self.dynticks.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.dynticks() & 1 == 0
    }

    /// Force the counter odd (executing), as when a context comes online.
    pub(crate) fn dynticks_online(&self) {
        let cur = self.dynticks.load(Ordering::Relaxed);
        if cur & 1 == 0 {
            self.dynticks.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn dynticks_idle_enter(&self) {
        let prev = self.dynticks.fetch_add(1, Ordering::AcqRel);
        assert!(prev & 1 == 1, "context {} entered idle twice", self.id);
    }

    pub(crate) fn dynticks_idle_exit(&self) {
        let prev = self.dynticks.fetch_add(1, Ordering::AcqRel);
        assert!(prev & 1 == 0, "context {} left idle while not idle", self.id);
    }

    /// Momentary pass through idle without changing parity.
    pub(crate) fn dynticks_momentary(&self) {
        self.dynticks.fetch_add(2, Ordering::AcqRel);
    }
}

/// True if a context seen at `snap` has since been idle or passed through idle.
#[must_use]
pub fn dynticks_in_eqs_since(snap: u64, curr: u64) -> bool {
    curr & 1 == 0 || curr >= snap.wrapping_add(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynticks_parity() {
        let rec = ContextRecord::new(3, 0, 0b1000, 10);
        assert!(rec.is_idle());
        rec.dynticks_online();
        assert!(!rec.is_idle());
        rec.dynticks_online();
        assert_eq!(rec.dynticks(), 1);
        rec.dynticks_idle_enter();
        assert!(rec.is_idle());
        rec.dynticks_idle_exit();
        rec.dynticks_momentary();
        assert_eq!(rec.dynticks(), 5);
        assert!(!rec.is_idle());
    }

    #[test]
    #[should_panic(expected = "entered idle twice")]
    fn test_double_idle_enter_panics() {
        let rec = ContextRecord::new(0, 0, 1, 10);
        rec.dynticks_online();
        rec.dynticks_idle_enter();
        rec.dynticks_idle_enter();
    }

    #[test]
    fn test_eqs_detection() {
        assert!(dynticks_in_eqs_since(5, 6), "idle now");
        assert!(dynticks_in_eqs_since(5, 7), "passed through idle");
        assert!(!dynticks_in_eqs_since(5, 5), "running throughout");
    }

    #[test]
    fn test_mirrors_follow_state() {
        let rec = ContextRecord::new(0, 0, 1, 10);
        {
            let mut st = rec.lock();
            st.callbacks.enqueue(Box::new(|| {}));
            st.gp_seen = 4;
            rec.sync_mirrors(&st);
        }
        assert_eq!(rec.queue_len(), 1);
        assert_eq!(rec.gp_seen.load(Ordering::Relaxed), 4);
    }
}
