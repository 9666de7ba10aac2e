//! Epoch-segmented callback queue.
//!
//! Callbacks flow through four segments in order:
//!
//! ```text
//!  Done | Wait | NextReady | Next
//!  ready  <=c1   <=c2        untagged
//! ```
//!
//! `Wait` and `NextReady` each carry the epoch whose completion makes them
//! ready, and those epochs never decrease from `Wait` to `NextReady`.
//! `Next` holds newly deferred callbacks that have not yet been assigned an
//! epoch. Order is FIFO across the whole queue.

use std::collections::VecDeque;
use std::fmt;

/// A deferred reclamation action.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Queue segment, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Segment {
    Done = 0,
    Wait = 1,
    NextReady = 2,
    Next = 3,
}

const SEGMENTS: usize = 4;
const DONE: usize = Segment::Done as usize;
const WAIT: usize = Segment::Wait as usize;
const NEXT_READY: usize = Segment::NextReady as usize;
const NEXT: usize = Segment::Next as usize;

/// Callbacks pulled out of a departing context.
#[derive(Default)]
pub struct Detached {
    /// Ready callbacks, oldest first.
    pub done: VecDeque<Callback>,
    /// Callbacks still waiting on an epoch, oldest first, with the epoch
    /// each was tagged for (`None` if untagged).
    pub pending: Vec<(Option<u64>, VecDeque<Callback>)>,
}

impl Detached {
    #[must_use]
    pub fn len(&self) -> usize {
        self.done.len() + self.pending.iter().map(|(_, cbs)| cbs.len()).sum::<usize>()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `other` after everything already held here.
    pub fn absorb(&mut self, other: Detached) {
        let Detached { mut done, pending } = other;
        self.done.append(&mut done);
        self.pending.extend(pending);
    }
}

/// Per-context segmented queue.
pub struct CallbackQueue {
    segments: [VecDeque<Callback>; SEGMENTS],
    epochs: [u64; SEGMENTS],
    len: usize,
}

impl fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("lens", &self.segment_lens())
            .field("epochs", &self.epochs)
            .finish()
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            segments: Default::default(),
            epochs: [0; SEGMENTS],
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn segment_len(&self, segment: Segment) -> usize {
        self.segments[segment as usize].len()
    }

    #[must_use]
    pub fn segment_lens(&self) -> [usize; SEGMENTS] {
        [
            self.segments[DONE].len(),
            self.segments[WAIT].len(),
            self.segments[NEXT_READY].len(),
            self.segments[NEXT].len(),
        ]
    }

    /// Epoch a tagged segment waits for, if it holds anything.
    #[must_use]
    pub fn segment_epoch(&self, segment: Segment) -> Option<u64> {
        match segment {
            Segment::Wait | Segment::NextReady if !self.segments[segment as usize].is_empty() => {
                Some(self.epochs[segment as usize])
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.segments[DONE].len()
    }

    #[must_use]
    pub fn has_ready(&self) -> bool {
        !self.segments[DONE].is_empty()
    }

    /// True if any callback is still waiting for an epoch.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.len > self.segments[DONE].len()
    }

    /// True if callbacks exist that no requested epoch will make ready.
    #[must_use]
    pub fn has_untagged(&self) -> bool {
        !self.segments[NEXT].is_empty()
    }

    /// True if this queue needs an epoch beyond `completed` to be started.
    #[must_use]
    pub fn needs_grace_period(&self, completed: u64) -> bool {
        if self.has_untagged() {
            return true;
        }
        (WAIT..NEXT).any(|i| !self.segments[i].is_empty() && completed < self.epochs[i])
    }

    pub fn enqueue(&mut self, callback: Callback) {
        self.segments[NEXT].push_back(callback);
        self.len += 1;
    }

    /// Tag as many untagged callbacks as possible with epoch `c`, merging
    /// them with any tagged segment already waiting for `c` or later.
    /// Returns true if some callbacks are now waiting for `c`.
    pub fn accelerate(&mut self, c: u64) -> bool {
        if !self.has_pending() {
            return false;
        }

        // Find the newest tagged segment that becomes ready strictly before
        // `c`; everything after it can share `c`.
        let mut i = NEXT_READY;
        while i > DONE {
            if !self.segments[i].is_empty() && self.epochs[i] < c {
                break;
            }
            i -= 1;
        }
        i += 1;
        if i >= NEXT {
            return false;
        }
        let retag = (i + 1..=NEXT).any(|s| !self.segments[s].is_empty())
            || (!self.segments[i].is_empty() && self.epochs[i] != c);
        if !retag {
            return false;
        }

        for src in i + 1..=NEXT {
            let mut moved = std::mem::take(&mut self.segments[src]);
            self.segments[i].append(&mut moved);
        }
        for epoch in &mut self.epochs[i..=NEXT] {
            *epoch = c;
        }
        true
    }

    /// Move every segment whose epoch is `<= completed` into `Done` and
    /// close up the remaining tagged segments. Returns true if anything
    /// became ready.
    pub fn advance(&mut self, completed: u64) -> bool {
        if !self.has_pending() {
            return false;
        }
        let mut i = WAIT;
        let mut moved_any = false;
        while i < NEXT {
            if completed < self.epochs[i] {
                break;
            }
            if !self.segments[i].is_empty() {
                let mut ready = std::mem::take(&mut self.segments[i]);
                self.segments[DONE].append(&mut ready);
                moved_any = true;
            }
            i += 1;
        }

        for (dst, src) in (WAIT..).zip(i..NEXT) {
            if src != dst {
                let seg = std::mem::take(&mut self.segments[src]);
                self.segments[dst] = seg;
                self.epochs[dst] = self.epochs[src];
            }
        }
        moved_any
    }

    /// Lower tagged epochs above `c` to `c`. Used when a context learns that
    /// an epoch can be started sooner than it assumed.
    pub fn lower_epochs(&mut self, c: u64) {
        for i in WAIT..=NEXT {
            if c < self.epochs[i] {
                self.epochs[i] = c;
            }
        }
    }

    /// Pop up to `limit` ready callbacks, oldest first.
    pub fn take_ready(&mut self, limit: usize) -> Vec<Callback> {
        let n = limit.min(self.segments[DONE].len());
        let batch: Vec<Callback> = self.segments[DONE].drain(..n).collect();
        self.len -= batch.len();
        batch
    }

    /// Remove every callback, keeping segment order and epoch tags.
    pub fn detach(&mut self) -> Detached {
        let done = std::mem::take(&mut self.segments[DONE]);
        let mut pending = Vec::new();
        for i in WAIT..=NEXT {
            let seg = std::mem::take(&mut self.segments[i]);
            if !seg.is_empty() {
                let tag = (i != NEXT).then_some(self.epochs[i]);
                pending.push((tag, seg));
            }
        }
        self.len = 0;
        self.epochs = [0; SEGMENTS];
        Detached { done, pending }
    }

    /// Splice adopted callbacks in: ready ones after our ready segment,
    /// pending ones into the untagged segment for re-tagging.
    pub fn adopt(&mut self, detached: Detached) {
        let Detached { mut done, pending } = detached;
        self.len += done.len();
        self.segments[DONE].append(&mut done);
        for (_, mut seg) in pending {
            self.len += seg.len();
            self.segments[NEXT].append(&mut seg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |id: u32| -> Callback {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().unwrap().push(id))
        };
        (log, make)
    }

    fn run_all(batch: Vec<Callback>) {
        for cb in batch {
            cb();
        }
    }

    #[test]
    fn test_enqueue_lands_untagged() {
        let (_, make) = recorder();
        let mut q = CallbackQueue::new();
        q.enqueue(make(1));
        assert_eq!(q.segment_lens(), [0, 0, 0, 1]);
        assert!(q.has_untagged());
        assert!(q.needs_grace_period(0));
    }

    #[test]
    fn test_accelerate_tags_into_wait() {
        let (_, make) = recorder();
        let mut q = CallbackQueue::new();
        q.enqueue(make(1));
        q.enqueue(make(2));
        assert!(q.accelerate(1));
        assert_eq!(q.segment_lens(), [0, 2, 0, 0]);
        assert_eq!(q.segment_epoch(Segment::Wait), Some(1));
        assert!(!q.needs_grace_period(1));
        assert!(q.needs_grace_period(0));
    }

    #[test]
    fn test_accelerate_is_idempotent() {
        let (_, make) = recorder();
        let mut q = CallbackQueue::new();
        q.enqueue(make(1));
        assert!(q.accelerate(3));
        let before = (q.segment_lens(), q.segment_epoch(Segment::Wait));
        assert!(!q.accelerate(3));
        assert!(!q.accelerate(4), "nothing left to tag");
        assert_eq!((q.segment_lens(), q.segment_epoch(Segment::Wait)), before);
    }

    #[test]
    fn test_later_callbacks_use_next_ready() {
        let (_, make) = recorder();
        let mut q = CallbackQueue::new();
        q.enqueue(make(1));
        q.accelerate(1);
        q.enqueue(make(2));
        assert!(q.accelerate(2));
        assert_eq!(q.segment_lens(), [0, 1, 1, 0]);
        assert_eq!(q.segment_epoch(Segment::NextReady), Some(2));
        // No room for a third distinct epoch: stays untagged.
        q.enqueue(make(3));
        assert!(!q.accelerate(3));
        assert_eq!(q.segment_lens(), [0, 1, 1, 1]);
    }

    #[test]
    fn test_advance_moves_completed_segments_in_order() {
        let (log, make) = recorder();
        let mut q = CallbackQueue::new();
        q.enqueue(make(1));
        q.accelerate(1);
        q.enqueue(make(2));
        q.accelerate(2);
        q.enqueue(make(3));

        assert!(q.advance(1));
        assert_eq!(q.segment_lens(), [1, 1, 0, 1]);
        assert_eq!(q.segment_epoch(Segment::Wait), Some(2));
        // Redundant advance changes nothing.
        assert!(!q.advance(1));
        assert_eq!(q.segment_lens(), [1, 1, 0, 1]);

        q.accelerate(3);
        assert!(q.advance(3));
        assert_eq!(q.ready_len(), 3);
        run_all(q.take_ready(usize::MAX));
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_take_ready_respects_limit() {
        let (log, make) = recorder();
        let mut q = CallbackQueue::new();
        for id in 0..5 {
            q.enqueue(make(id));
        }
        q.accelerate(1);
        q.advance(1);
        run_all(q.take_ready(2));
        assert_eq!(*log.lock().unwrap(), vec![0, 1]);
        assert_eq!(q.len(), 3);
        assert!(q.has_ready());
    }

    #[test]
    fn test_lower_epochs() {
        let (_, make) = recorder();
        let mut q = CallbackQueue::new();
        q.enqueue(make(1));
        q.accelerate(5);
        q.lower_epochs(4);
        assert_eq!(q.segment_epoch(Segment::Wait), Some(4));
    }

    #[test]
    fn test_detach_and_adopt_preserve_order() {
        let (log, make) = recorder();
        let mut departing = CallbackQueue::new();
        departing.enqueue(make(1));
        departing.accelerate(1);
        departing.advance(1);
        departing.enqueue(make(2));
        departing.accelerate(2);
        departing.enqueue(make(3));

        let detached = departing.detach();
        assert!(departing.is_empty());
        assert_eq!(detached.len(), 3);
        assert_eq!(detached.pending[0].0, Some(2));
        assert_eq!(detached.pending[1].0, None);

        let mut survivor = CallbackQueue::new();
        survivor.enqueue(make(10));
        survivor.accelerate(1);
        survivor.advance(1);
        survivor.adopt(detached);
        assert_eq!(survivor.len(), 4);
        assert_eq!(survivor.segment_lens(), [2, 0, 0, 2]);

        survivor.accelerate(7);
        survivor.advance(7);
        run_all(survivor.take_ready(usize::MAX));
        assert_eq!(*log.lock().unwrap(), vec![10, 1, 2, 3]);
    }

    #[test]
    fn test_absorb_appends_after_existing() {
        let (log, make) = recorder();
        let mut first = CallbackQueue::new();
        first.enqueue(make(1));
        let mut second = CallbackQueue::new();
        second.enqueue(make(2));

        let mut orphans = Detached::default();
        orphans.absorb(first.detach());
        orphans.absorb(second.detach());
        assert_eq!(orphans.len(), 2);

        let mut survivor = CallbackQueue::new();
        survivor.adopt(orphans);
        survivor.accelerate(1);
        survivor.advance(1);
        run_all(survivor.take_ready(usize::MAX));
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }
}
