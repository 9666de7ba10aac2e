//! The grace-period coordinator thread.
//!
//! ```text
//! WAIT_START --INIT flag--> INIT --> WAIT_QUIESCENCE --root empty--> CLEANUP
//!     ^                                  |   ^                          |
//!     |                       timeout/FQS|   |scan                      |
//!     |                                  v   |                          |
//!     |                              force-quiescence                   |
//!     +-----------------------------------------------------------------+
//! ```
//!
//! This is the only thread that walks the whole tree. It blocks only while
//! waiting for a start request and between force-quiescence scans, and the
//! latter wait always has a timeout.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::flavor::{CoordinatorState, GP_FLAG_FQS, GP_FLAG_INIT, Shared};
use crate::readside::ReadSide;

pub(crate) fn run<R: ReadSide>(shared: Arc<Shared<R>>) {
    log::debug!("{}: coordinator running", R::NAME);
    loop {
        shared.set_state(CoordinatorState::WaitStart);
        if !shared.wait_for_start() {
            break;
        }
        shared.set_state(CoordinatorState::Init);
        if !shared.gp_init() {
            continue;
        }
        shared.set_state(CoordinatorState::WaitQuiescence);
        if !shared.wait_quiescence() {
            break;
        }
        shared.set_state(CoordinatorState::Cleanup);
        shared.gp_cleanup();
    }
    shared.set_state(CoordinatorState::Stopped);
    log::debug!("{}: coordinator stopped", R::NAME);
}

impl<R: ReadSide> Shared<R> {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn note_activity(&self) {
        self.timing
            .gp_activity_ns
            .store(self.now_ns(), Ordering::Relaxed);
    }

    /// Block until a grace period is requested. False on shutdown.
    fn wait_for_start(&self) -> bool {
        let mut guard = self.wait_lock.lock();
        loop {
            self.note_activity();
            if self.stopping() {
                return false;
            }
            if self.gp_flags.load(Ordering::Acquire) & GP_FLAG_INIT != 0 {
                return true;
            }
            self.wait_cv.wait(&mut guard);
        }
    }

    /// Open a new epoch. False if the request was spurious.
    fn gp_init(&self) -> bool {
        let root = self.tree.root();
        let gp = {
            let _root_masks = root.lock();
            if self.gp_flags.load(Ordering::Acquire) & GP_FLAG_INIT == 0 {
                return false;
            }
            // A new epoch answers every outstanding request.
            self.gp_flags.store(0, Ordering::Release);
            if self.gp_in_progress() {
                log::warn!("{}: start requested with an epoch in flight", R::NAME);
                return false;
            }
            self.record_gp_stall_check_time();
            let gp = self.gp_number() + 1;
            self.gp_number.store(gp, Ordering::Release);
            gp
        };
        self.counters.gp_started.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: epoch {gp} starting", R::NAME);

        self.tree.initialize_epoch(gp);
        self.note_activity();

        let home = &self.contexts[self.config.coordinator_context];
        if home.is_online() {
            let mut st = home.lock();
            self.note_gp_changes(home, &mut st);
        }
        true
    }

    /// Wait for the root to empty, scanning for quiescent contexts on every
    /// timeout or explicit poke. False on shutdown.
    fn wait_quiescence(&self) -> bool {
        let mut first = true;
        let mut deadline = Instant::now() + self.config.first_fqs_delay;
        loop {
            if self.tree.root_quiescent() {
                return true;
            }
            {
                let mut guard = self.wait_lock.lock();
                loop {
                    if self.stopping() {
                        return false;
                    }
                    if self.gp_flags.load(Ordering::Acquire) & GP_FLAG_FQS != 0
                        || Instant::now() >= deadline
                    {
                        break;
                    }
                    self.wait_cv.wait_until(&mut guard, deadline);
                }
            }
            self.note_activity();
            if self.tree.root_quiescent() {
                return true;
            }
            self.force_quiescent_scan(first);
            first = false;
            self.gp_flags.fetch_and(!GP_FLAG_FQS, Ordering::AcqRel);
            self.check_stall();
            deadline = Instant::now() + self.config.next_fqs_delay;
        }
    }

    /// Close the epoch, catch up contexts that deferred while it ran, and
    /// decide whether another epoch is needed.
    fn gp_cleanup(&self) {
        let gp = self.gp_number();
        let started = self.timing.gp_start_ns.load(Ordering::Relaxed);
        let duration = self.now_ns().saturating_sub(started);
        self.counters
            .gp_max_ns
            .fetch_max(duration, Ordering::Relaxed);

        let mut needgp = self.tree.complete_epoch(gp);
        {
            let _root_masks = self.tree.root().lock();
            self.completed.store(gp, Ordering::Release);
        }
        self.counters.gp_completed.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "{}: epoch {gp} completed in {:?}",
            R::NAME,
            Duration::from_nanos(duration)
        );

        let home = self.config.coordinator_context;
        for rec in self.contexts.iter() {
            let flagged = rec.wants_gp.swap(false, Ordering::AcqRel);
            if !rec.is_online() || !(flagged || rec.id() == home) {
                continue;
            }
            let mut st = rec.lock();
            needgp |= self.note_gp_changes(rec, &mut st);
            let mut root_masks = self.tree.root().lock();
            needgp |= self.start_gp(&mut root_masks, &mut st);
            drop(root_masks);
            rec.sync_mirrors(&st);
            if st.callbacks.has_ready() {
                rec.invoke_again.store(true, Ordering::Release);
            }
        }

        let _root_masks = self.tree.root().lock();
        if needgp {
            self.gp_flags.fetch_or(GP_FLAG_INIT, Ordering::AcqRel);
        }
    }
}
