//! Flavor-wide counters and their point-in-time snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::context::{ContextId, ContextPhase};
use crate::flavor::{CoordinatorState, Shared};
use crate::readside::ReadSide;

/// Counters bumped on hot paths with relaxed ordering.
#[derive(Debug, Default)]
pub(crate) struct FlavorCounters {
    pub(crate) gp_started: AtomicU64,
    pub(crate) gp_completed: AtomicU64,
    /// Longest grace period observed, in nanoseconds.
    pub(crate) gp_max_ns: AtomicU64,
    /// Force-quiescence scans run.
    pub(crate) n_force_qs: AtomicU64,
    /// Scans requested by callback-queue pressure.
    pub(crate) fqs_requested: AtomicU64,
    pub(crate) stalls_reported: AtomicU64,
    pub(crate) orphaned: AtomicU64,
    pub(crate) adopted: AtomicU64,
    pub(crate) barriers: AtomicU64,
}

/// Snapshot of one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    pub id: ContextId,
    pub phase: ContextPhase,
    pub online: bool,
    pub idle: bool,
    pub queued: usize,
    pub gp_seen: u64,
    pub invoked: u64,
    pub orphaned: u64,
    pub adopted: u64,
    /// Times force-quiescence credited this context for being idle.
    pub dynticks_fqs: u64,
    /// Times force-quiescence credited this context for being offline.
    pub offline_fqs: u64,
}

/// Snapshot of a whole flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlavorStats {
    pub name: &'static str,
    pub gp_number: u64,
    pub completed: u64,
    pub state: CoordinatorState,
    pub gp_started: u64,
    pub gp_completed: u64,
    pub gp_max_ns: u64,
    pub n_force_qs: u64,
    pub fqs_requested: u64,
    pub stalls_reported: u64,
    pub orphaned: u64,
    pub adopted: u64,
    pub orphans_held: usize,
    pub barriers: u64,
    pub contexts: Vec<ContextStats>,
}

impl FlavorStats {
    /// Callbacks queued across all contexts and the orphanage.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.contexts.iter().map(|c| c.queued).sum::<usize>() + self.orphans_held
    }

    #[must_use]
    pub fn invoked(&self) -> u64 {
        self.contexts.iter().map(|c| c.invoked).sum()
    }
}

impl<R: ReadSide> Shared<R> {
    pub(crate) fn stats(&self) -> FlavorStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let contexts = self
            .contexts
            .iter()
            .map(|rec| ContextStats {
                id: rec.id(),
                phase: self.context_phase(rec.id()),
                online: rec.is_online(),
                idle: rec.is_idle(),
                queued: rec.queue_len(),
                gp_seen: rec.gp_seen.load(Ordering::Relaxed),
                invoked: load(&rec.counters.invoked),
                orphaned: load(&rec.counters.orphaned),
                adopted: load(&rec.counters.adopted),
                dynticks_fqs: load(&rec.counters.dynticks_fqs),
                offline_fqs: load(&rec.counters.offline_fqs),
            })
            .collect();
        FlavorStats {
            name: R::NAME,
            gp_number: self.gp_number(),
            completed: self.completed(),
            state: self.coordinator_state(),
            gp_started: load(&self.counters.gp_started),
            gp_completed: load(&self.counters.gp_completed),
            gp_max_ns: load(&self.counters.gp_max_ns),
            n_force_qs: load(&self.counters.n_force_qs),
            fqs_requested: load(&self.counters.fqs_requested),
            stalls_reported: load(&self.counters.stalls_reported),
            orphaned: load(&self.counters.orphaned),
            adopted: load(&self.counters.adopted),
            orphans_held: self.orphans.lock().len(),
            barriers: load(&self.counters.barriers),
            contexts,
        }
    }
}
