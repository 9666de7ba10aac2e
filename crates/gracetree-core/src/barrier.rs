//! Barrier, synchronize and grace-period polling.
//!
//! A barrier queues a sentinel callback behind everything already queued on
//! every online context, and behind the orphanage, then waits for all of
//! them to run. A context with callbacks still running counts as non-empty. Queues are FIFO, so the last sentinel running means every
//! earlier callback has run too.
//!
//! Barrier rounds are numbered: odd while a round is enqueueing or waiting,
//! even between rounds. A caller whose snapshot is already covered by a
//! round that started after it returns without doing any work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

use crate::callbacks::Callback;
use crate::context::ContextId;
use crate::flavor::Shared;
use crate::readside::ReadSide;

#[derive(Debug, Default)]
pub(crate) struct BarrierState {
    lock: Mutex<()>,
    seq: AtomicU64,
}

/// Countdown latch completed by sentinel callbacks.
#[derive(Debug)]
pub(crate) struct Completion {
    remaining: Mutex<usize>,
    cv: Condvar,
}

impl Completion {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn add(&self) {
        *self.remaining.lock() += 1;
    }

    pub(crate) fn complete(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cv.notify_all();
        }
    }

    /// Wait up to `timeout`. True once the count has reached zero.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            self.cv.wait_for(&mut remaining, timeout);
        }
        *remaining == 0
    }
}

/// Snapshot of grace-period progress for later polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GpCookie(u64);

impl GpCookie {
    /// Grace-period number the cookie was taken at.
    #[must_use]
    pub fn gp_number(self) -> u64 {
        self.0
    }
}

impl<R: ReadSide> Shared<R> {
    /// Keep `waiter` responsive while blocked: it counts as switched out
    /// and drains its own queue, which may hold the sentinel we wait for.
    fn service_waiter(&self, waiter: Option<ContextId>) {
        if let Some(context) = waiter {
            self.note_context_switch(context);
            self.process_callbacks(context);
        }
    }

    fn wait_completion(&self, done: &Completion, waiter: Option<ContextId>) {
        while !done.wait_for(self.config.barrier_poll) {
            self.service_waiter(waiter);
        }
    }

    fn lock_barrier(&self, waiter: Option<ContextId>) -> MutexGuard<'_, ()> {
        loop {
            if let Some(guard) = self.barrier.lock.try_lock_for(self.config.barrier_poll) {
                return guard;
            }
            self.service_waiter(waiter);
        }
    }

    pub(crate) fn barrier(&self, waiter: Option<ContextId>) {
        let snap = (self.barrier.seq.load(Ordering::Acquire) + 3) & !1;
        let _round = self.lock_barrier(waiter);
        if self.barrier.seq.load(Ordering::Acquire) >= snap {
            log::trace!("{}: barrier satisfied by a concurrent round", R::NAME);
            return;
        }
        self.barrier.seq.fetch_add(1, Ordering::AcqRel);

        // The initial count keeps the latch open until every sentinel is queued.
        let done = Arc::new(Completion::new(1));
        let mut sentinels = 0usize;
        {
            let _hotplug = self.hotplug.read();
            // Held across the pass so adoption cannot move callbacks between
            // a context already visited and the orphanage.
            let mut orphans = self.orphans.lock();
            for rec in self.contexts.iter().filter(|rec| rec.is_online()) {
                let mut st = rec.lock();
                if st.callbacks.is_empty() && st.invoking == 0 {
                    continue;
                }
                done.add();
                let latch = Arc::clone(&done);
                st.callbacks.enqueue(Box::new(move || latch.complete()));
                let needwake = self.after_enqueue(rec, &mut st);
                rec.sync_mirrors(&st);
                drop(st);
                self.wake_if(needwake);
                sentinels += 1;
            }
            if !orphans.is_empty() {
                done.add();
                let latch = Arc::clone(&done);
                let mut sentinel: VecDeque<Callback> = VecDeque::new();
                sentinel.push_back(Box::new(move || latch.complete()));
                orphans.pending.push((None, sentinel));
                self.orphans_pending.store(true, Ordering::Release);
                // Counted like any orphan so adoption totals stay balanced.
                self.counters.orphaned.fetch_add(1, Ordering::Relaxed);
                sentinels += 1;
            }
        }
        done.complete();
        log::trace!("{}: barrier waiting on {sentinels} sentinels", R::NAME);
        self.wait_completion(&done, waiter);

        self.barrier.seq.fetch_add(1, Ordering::AcqRel);
        self.counters.barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn synchronize(&self, waiter: Option<ContextId>) {
        let waiter = waiter.filter(|&context| self.record(context).is_online());
        if waiter.is_some() && self.online_count() <= 1 {
            // The only running context is blocked here, so no reader can be
            // active anywhere.
            return;
        }
        let done = Arc::new(Completion::new(1));
        {
            let _hotplug = self.hotplug.read();
            let target = waiter.or_else(|| {
                self.contexts
                    .iter()
                    .find(|rec| rec.is_online())
                    .map(|rec| rec.id())
            });
            let Some(target) = target else {
                // Nothing online can be reading.
                return;
            };
            let latch = Arc::clone(&done);
            self.defer(target, Box::new(move || latch.complete()));
        }
        self.wait_completion(&done, waiter);
    }

    pub(crate) fn get_state(&self) -> GpCookie {
        GpCookie(self.gp_number())
    }

    pub(crate) fn poll_state(&self, cookie: GpCookie) -> bool {
        self.completed() > cookie.0
    }
}
