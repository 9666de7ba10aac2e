//! Flavor: one independent grace-period domain.
//!
//! A [`Flavor`] owns the combining tree, one [`ContextRecord`] per execution
//! context, the orphan list and a background coordinator thread. It is an
//! explicit handle: construct it at startup and share it (typically behind
//! an `Arc`) with every thread that acts as one of its contexts. Dropping
//! the handle stops the coordinator; callbacks still queued at that point
//! are dropped without being invoked.
//!
//! Threads name the context they act as on every call. A context must be
//! driven by one thread at a time; contexts are logical and need not map to
//! CPUs.

mod epochs;
mod invoke;
mod report;

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

use crate::barrier::{BarrierState, GpCookie};
use crate::callbacks::{Detached, Segment};
use crate::config::GraceConfig;
use crate::context::{ContextId, ContextPhase, ContextRecord};
use crate::coordinator;
use crate::error::GraceError;
use crate::hooks::{NoopHooks, SchedulerHooks};
use crate::readside::{ReadSide, Sched};
use crate::stats::{FlavorCounters, FlavorStats};
use crate::tree::CombiningTree;
use crate::tree::geometry::Geometry;

/// Request flag: start a new grace period.
pub(crate) const GP_FLAG_INIT: u8 = 0x1;
/// Request flag: scan for quiescent contexts now.
pub(crate) const GP_FLAG_FQS: u8 = 0x2;

/// Coordinator state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CoordinatorState {
    WaitStart = 0,
    Init = 1,
    WaitQuiescence = 2,
    Cleanup = 3,
    Stopped = 4,
}

impl CoordinatorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Init,
            2 => Self::WaitQuiescence,
            3 => Self::Cleanup,
            4 => Self::Stopped,
            _ => Self::WaitStart,
        }
    }
}

/// Result of one callback invocation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InvokeOutcome {
    pub invoked: usize,
    /// Ready callbacks were left for a later pass.
    pub more_ready: bool,
}

/// Point-in-time view of a context's callback segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Lengths of `Done`, `Wait`, `NextReady` and `Next`.
    pub lens: [usize; 4],
    pub wait_epoch: Option<u64>,
    pub next_ready_epoch: Option<u64>,
}

/// Grace-period timestamps, in nanoseconds since flavor creation.
#[derive(Debug, Default)]
pub(crate) struct GpTiming {
    pub(crate) gp_start_ns: AtomicU64,
    pub(crate) stall_deadline_ns: AtomicU64,
    pub(crate) gp_activity_ns: AtomicU64,
}

/// Flavor state shared with the coordinator thread.
pub(crate) struct Shared<R: ReadSide> {
    pub(crate) config: GraceConfig,
    pub(crate) tree: CombiningTree,
    pub(crate) contexts: Box<[ContextRecord]>,
    pub(crate) gp_number: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) gp_flags: AtomicU8,
    pub(crate) state: AtomicU8,
    pub(crate) wait_lock: Mutex<()>,
    pub(crate) wait_cv: Condvar,
    pub(crate) shutdown: AtomicBool,
    pub(crate) clock: Instant,
    pub(crate) timing: GpTiming,
    pub(crate) counters: FlavorCounters,
    pub(crate) orphans: Mutex<Detached>,
    pub(crate) orphans_pending: AtomicBool,
    pub(crate) hotplug: RwLock<()>,
    pub(crate) barrier: BarrierState,
    pub(crate) hooks: Box<dyn SchedulerHooks>,
    _read_side: PhantomData<fn() -> R>,
}

impl<R: ReadSide> Shared<R> {
    pub(crate) fn record(&self, context: ContextId) -> &ContextRecord {
        assert!(
            context < self.contexts.len(),
            "context {context} out of range for {} contexts",
            self.contexts.len()
        );
        &self.contexts[context]
    }

    pub(crate) fn gp_number(&self) -> u64 {
        self.gp_number.load(Ordering::Acquire)
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn gp_in_progress(&self) -> bool {
        self.gp_number() != self.completed()
    }

    pub(crate) fn now_ns(&self) -> u64 {
        self.clock.elapsed().as_nanos() as u64
    }

    pub(crate) fn set_state(&self, state: CoordinatorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn coordinator_state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn wake_coordinator(&self) {
        let _guard = self.wait_lock.lock();
        self.wait_cv.notify_all();
    }

    pub(crate) fn wake_if(&self, needwake: bool) {
        if needwake {
            self.wake_coordinator();
        }
    }

    /// The last report of the epoch has reached the root.
    pub(crate) fn root_cleared(&self) {
        self.gp_flags.fetch_or(GP_FLAG_FQS, Ordering::AcqRel);
        self.wake_coordinator();
    }

    pub(crate) fn request_grace_period(&self) {
        let root = self.tree.root().lock();
        self.gp_flags.fetch_or(GP_FLAG_INIT, Ordering::AcqRel);
        drop(root);
        self.wake_coordinator();
    }

    pub(crate) fn request_force_qs(&self) {
        if !self.gp_in_progress() {
            return;
        }
        self.gp_flags.fetch_or(GP_FLAG_FQS, Ordering::AcqRel);
        self.wake_coordinator();
    }

    pub(crate) fn online_count(&self) -> usize {
        self.contexts.iter().filter(|rec| rec.is_online()).count()
    }

    pub(crate) fn context_phase(&self, context: ContextId) -> ContextPhase {
        let rec = self.record(context);
        if !rec.is_online() {
            return ContextPhase::Offline;
        }
        let leaf = self.tree.node(rec.leaf());
        let owed = leaf.gp_in_progress() && leaf.lock().quiescent_mask & rec.grpmask() != 0;
        let seen = rec.gp_seen.load(Ordering::Relaxed) == leaf.gp_number();
        match (owed, seen) {
            (true, _) => ContextPhase::AwaitingQs,
            (false, true) if leaf.gp_in_progress() => ContextPhase::Reported,
            _ => ContextPhase::UpToDate,
        }
    }

    pub(crate) fn queue_snapshot(&self, context: ContextId) -> QueueSnapshot {
        let st = self.record(context).lock();
        QueueSnapshot {
            lens: st.callbacks.segment_lens(),
            wait_epoch: st.callbacks.segment_epoch(Segment::Wait),
            next_ready_epoch: st.callbacks.segment_epoch(Segment::NextReady),
        }
    }
}

/// A grace-period domain with reader-tracking strategy `R`.
pub struct Flavor<R: ReadSide = Sched> {
    shared: Arc<Shared<R>>,
    coordinator: Option<JoinHandle<()>>,
}

impl<R: ReadSide> std::fmt::Debug for Flavor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flavor")
            .field("name", &R::NAME)
            .field("gp_number", &self.shared.gp_number())
            .field("completed", &self.shared.completed())
            .field("state", &self.shared.coordinator_state())
            .finish()
    }
}

impl<R: ReadSide> Flavor<R> {
    /// Build a flavor with no scheduler hooks. All contexts start offline.
    pub fn new(config: GraceConfig) -> Result<Self, GraceError> {
        Self::with_hooks(config, NoopHooks)
    }

    /// Build a flavor that reports stalls to `hooks`.
    pub fn with_hooks<H>(config: GraceConfig, hooks: H) -> Result<Self, GraceError>
    where
        H: SchedulerHooks + 'static,
    {
        config.validate()?;
        let geometry = Geometry::compute(config.contexts, config.fanout_leaf, config.fanout)?;
        let tree = CombiningTree::new(geometry);
        let contexts: Box<[ContextRecord]> = (0..config.contexts)
            .map(|id| ContextRecord::new(id, tree.leaf_of(id), tree.context_bit(id), config.blimit))
            .collect();

        let shared = Arc::new(Shared {
            config,
            tree,
            contexts,
            gp_number: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            gp_flags: AtomicU8::new(0),
            state: AtomicU8::new(CoordinatorState::WaitStart as u8),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            clock: Instant::now(),
            timing: GpTiming::default(),
            counters: FlavorCounters::default(),
            orphans: Mutex::new(Detached::default()),
            orphans_pending: AtomicBool::new(false),
            hotplug: RwLock::new(()),
            barrier: BarrierState::default(),
            hooks: Box::new(hooks),
            _read_side: PhantomData,
        });

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("gracetree-{}-gp", R::NAME))
            .spawn(move || coordinator::run(worker))?;
        log::debug!(
            "{}: flavor up with {} contexts in {} tree levels",
            R::NAME,
            shared.contexts.len(),
            shared.tree.geometry().levels()
        );

        Ok(Self {
            shared,
            coordinator: Some(handle),
        })
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn name(&self) -> &'static str {
        R::NAME
    }

    #[must_use]
    pub fn config(&self) -> &GraceConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn tree(&self) -> &CombiningTree {
        &self.shared.tree
    }

    #[must_use]
    pub fn context(&self, context: ContextId) -> &ContextRecord {
        self.shared.record(context)
    }

    /// Number of the most recently started grace period.
    #[must_use]
    pub fn gp_number(&self) -> u64 {
        self.shared.gp_number()
    }

    /// Number of the most recently completed grace period.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.shared.completed()
    }

    #[must_use]
    pub fn gp_in_progress(&self) -> bool {
        self.shared.gp_in_progress()
    }

    #[must_use]
    pub fn coordinator_state(&self) -> CoordinatorState {
        self.shared.coordinator_state()
    }

    /// Children of the root still owing a report this epoch.
    #[must_use]
    pub fn root_mask(&self) -> u64 {
        self.shared.tree.root_mask()
    }

    #[must_use]
    pub fn context_phase(&self, context: ContextId) -> ContextPhase {
        self.shared.context_phase(context)
    }

    #[must_use]
    pub fn queue_snapshot(&self, context: ContextId) -> QueueSnapshot {
        self.shared.queue_snapshot(context)
    }

    #[must_use]
    pub fn stats(&self) -> FlavorStats {
        self.shared.stats()
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    /// Start a read-side section. A no-op unless the flavor tracks readers.
    pub fn enter_read_side(&self, context: ContextId) {
        self.shared.enter_read_side(context);
    }

    /// End a read-side section.
    pub fn exit_read_side(&self, context: ContextId) {
        self.shared.exit_read_side(context);
    }

    // -----------------------------------------------------------------------
    // Quiescent-state notes from the scheduler and tick source
    // -----------------------------------------------------------------------

    /// A voluntary context switch happened on `context`.
    pub fn note_context_switch(&self, context: ContextId) {
        self.shared.note_context_switch(context);
    }

    /// `context` is at a quiescent state right now.
    pub fn note_quiescent_state(&self, context: ContextId) {
        self.shared.note_quiescent_state(context);
    }

    /// `context` is about to go idle. It runs no readers until it exits idle.
    pub fn note_context_idle_enter(&self, context: ContextId) {
        self.shared.idle_enter(context);
    }

    pub fn note_context_idle_exit(&self, context: ContextId) {
        self.shared.idle_exit(context);
    }

    /// Periodic scheduler-clock interrupt on `context`. `from_idle_or_user`
    /// reports that the interrupt arrived outside any read-side section.
    pub fn tick(&self, context: ContextId, from_idle_or_user: bool) -> InvokeOutcome {
        self.shared.tick(context, from_idle_or_user)
    }

    // -----------------------------------------------------------------------
    // Deferred callbacks
    // -----------------------------------------------------------------------

    /// Run `callback` on some context once every reader that might have
    /// observed the pre-update state has finished.
    ///
    /// # Panics
    ///
    /// Panics if `context` is offline.
    pub fn defer<F>(&self, context: ContextId, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.defer(context, Box::new(callback));
    }

    /// Tag untagged callbacks with the earliest safe epoch.
    /// Returns true if a new grace period was requested.
    pub fn accelerate(&self, context: ContextId) -> bool {
        self.shared.accelerate_context(context)
    }

    /// Move callbacks whose epoch has completed into the ready segment.
    /// Returns true if any callback became ready.
    pub fn advance(&self, context: ContextId) -> bool {
        self.shared.advance_context(context)
    }

    /// Invoke up to `limit` ready callbacks.
    pub fn invoke_ready(&self, context: ContextId, limit: usize) -> InvokeOutcome {
        self.shared.invoke_ready(context, limit)
    }

    /// Per-context reclamation step: catch up with epoch changes, report
    /// an owed quiescent state, request a grace period if needed, then
    /// invoke one batch of ready callbacks.
    pub fn process_callbacks(&self, context: ContextId) -> InvokeOutcome {
        self.shared.process_callbacks(context)
    }

    /// True if `process_callbacks` has anything to do on `context`.
    #[must_use]
    pub fn callbacks_pending(&self, context: ContextId) -> bool {
        self.shared.callbacks_pending(context)
    }

    /// Ask the coordinator to start a grace period.
    pub fn request_grace_period(&self) {
        self.shared.request_grace_period();
    }

    /// Ask the coordinator to scan for quiescent contexts now.
    pub fn force_quiescent_state(&self) {
        self.shared.request_force_qs();
    }

    // -----------------------------------------------------------------------
    // Hotplug
    // -----------------------------------------------------------------------

    /// Bring `context` online. It takes part in grace periods from the next
    /// one that starts.
    ///
    /// # Panics
    ///
    /// Panics if `context` is already online.
    pub fn cpu_online(&self, context: ContextId) {
        self.shared.cpu_online(context);
    }

    /// Take `context` offline, handing its callbacks to a surviving context.
    ///
    /// # Panics
    ///
    /// Panics if `context` is already offline.
    pub fn cpu_offline(&self, context: ContextId) {
        self.shared.cpu_offline(context);
    }

    /// Splice orphaned callbacks onto `context`. Returns how many moved.
    pub fn adopt(&self, context: ContextId) -> usize {
        self.shared.adopt(context)
    }

    // -----------------------------------------------------------------------
    // Waiting
    // -----------------------------------------------------------------------

    /// Wait until every callback deferred before this call has run. The
    /// calling thread must not be acting as a context.
    pub fn barrier(&self) {
        self.shared.barrier(None);
    }

    /// [`Self::barrier`] for a caller acting as `context`. While waiting,
    /// `context` counts as switched out and keeps servicing its own queue.
    pub fn barrier_on(&self, context: ContextId) {
        self.shared.barrier(Some(context));
    }

    /// Wait for one full grace period. The calling thread must not be
    /// acting as a context, and some online context must be driven.
    pub fn synchronize(&self) {
        self.shared.synchronize(None);
    }

    /// [`Self::synchronize`] for a caller acting as `context`.
    pub fn synchronize_on(&self, context: ContextId) {
        self.shared.synchronize(Some(context));
    }

    /// Cookie for a later [`Self::poll_state`] or [`Self::cond_synchronize_on`].
    #[must_use]
    pub fn get_state(&self) -> GpCookie {
        self.shared.get_state()
    }

    /// True once a full grace period has elapsed since `cookie` was taken.
    #[must_use]
    pub fn poll_state(&self, cookie: GpCookie) -> bool {
        self.shared.poll_state(cookie)
    }

    /// Synchronize only if no full grace period has elapsed since `cookie`.
    pub fn cond_synchronize_on(&self, context: ContextId, cookie: GpCookie) {
        if !self.shared.poll_state(cookie) {
            self.shared.synchronize(Some(context));
        }
    }
}

impl<R: ReadSide> Drop for Flavor<R> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_coordinator();
        if let Some(handle) = self.coordinator.take()
            && handle.join().is_err()
        {
            log::error!("{}: coordinator thread panicked", R::NAME);
        }
    }
}
