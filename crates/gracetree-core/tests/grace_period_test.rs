mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use common::{Driver, fast_config, online_all, wait_until};
use gracetree_core::{CoordinatorState, Flavor, GraceConfig, Marked, ReadSide, Sched};

#[test]
fn test_idle_contexts_complete_exactly_one_grace_period() {
    let flavor = Flavor::<Sched>::new(fast_config(4)).unwrap();
    online_all(&flavor);
    for ctx in 1..4 {
        flavor.note_context_idle_enter(ctx);
    }

    let invoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&invoked);
    flavor.defer(0, move || flag.store(true, Ordering::Release));

    assert!(wait_until(|| {
        flavor.note_context_switch(0);
        flavor.process_callbacks(0);
        invoked.load(Ordering::Acquire)
    }));
    assert!(wait_until(|| flavor.stats().gp_completed == 1));
    std::thread::sleep(Duration::from_millis(20));

    let stats = flavor.stats();
    assert_eq!(stats.gp_started, 1);
    assert_eq!(stats.gp_completed, 1);
    assert_eq!(flavor.completed(), flavor.gp_number());
    assert!(!flavor.gp_in_progress());
    assert!(stats.contexts[1..].iter().all(|c| c.dynticks_fqs >= 1));
}

fn barrier_waits_for_reader<R: ReadSide>() {
    let flavor = Arc::new(Flavor::<R>::new(fast_config(2)).unwrap());
    online_all(&flavor);
    flavor.enter_read_side(0);

    let invoked = Arc::new(AtomicBool::new(false));
    let returned = Arc::new(AtomicBool::new(false));
    let writer = {
        let flavor = Arc::clone(&flavor);
        let invoked = Arc::clone(&invoked);
        let returned = Arc::clone(&returned);
        std::thread::spawn(move || {
            flavor.defer(1, move || invoked.store(true, Ordering::Release));
            flavor.barrier_on(1);
            returned.store(true, Ordering::Release);
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    assert!(!returned.load(Ordering::Acquire), "barrier returned while a reader was active");
    assert!(!invoked.load(Ordering::Acquire));
    assert!(flavor.gp_in_progress());

    flavor.exit_read_side(0);
    flavor.note_quiescent_state(0);
    assert!(wait_until(|| {
        flavor.note_context_switch(0);
        flavor.process_callbacks(0);
        returned.load(Ordering::Acquire)
    }));
    writer.join().unwrap();
    assert!(invoked.load(Ordering::Acquire));
}

#[test]
fn test_barrier_waits_for_callback_already_running() {
    let flavor = Arc::new(Flavor::<Sched>::new(fast_config(1)).unwrap());
    online_all(&flavor);
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        flavor.defer(0, move || {
            started.store(true, Ordering::Release);
            std::thread::sleep(Duration::from_millis(300));
            finished.store(true, Ordering::Release);
        });
    }
    let driver = Driver::spawn(&flavor, 0);
    assert!(wait_until(|| started.load(Ordering::Acquire)));

    // The queue is empty now but the callback has not returned.
    assert_eq!(flavor.context(0).queue_len(), 0);
    flavor.barrier();
    assert!(finished.load(Ordering::Acquire), "barrier returned before a running callback");
    driver.stop();
}

#[test]
fn test_barrier_waits_for_marked_reader() {
    barrier_waits_for_reader::<Marked>();
}

#[test]
fn test_barrier_waits_for_sched_reader() {
    barrier_waits_for_reader::<Sched>();
}

#[test]
fn test_marked_reader_blocks_quiescent_notes() {
    let config = GraceConfig::for_contexts(2)
        .with_fqs_delays(Duration::from_secs(10), Duration::from_secs(10));
    let flavor = Flavor::<Marked>::new(config).unwrap();
    online_all(&flavor);
    flavor.request_grace_period();
    assert!(wait_until(|| flavor.coordinator_state() == CoordinatorState::WaitQuiescence));

    flavor.enter_read_side(0);
    flavor.enter_read_side(0);
    flavor.note_quiescent_state(1);
    flavor.note_quiescent_state(0);
    flavor.note_context_switch(0);
    assert_ne!(flavor.root_mask(), 0);

    flavor.exit_read_side(0);
    flavor.note_quiescent_state(0);
    assert_ne!(flavor.root_mask(), 0, "still nested once");

    flavor.exit_read_side(0);
    flavor.note_quiescent_state(0);
    assert!(wait_until(|| flavor.completed() == 1));
}

#[test]
fn test_two_level_tree_clears_root_once() {
    let config = GraceConfig::for_contexts(8)
        .with_fanout(4, 4)
        .with_fqs_delays(Duration::from_secs(10), Duration::from_secs(10));
    let flavor = Flavor::<Sched>::new(config).unwrap();
    assert_eq!(flavor.tree().geometry().levels(), 2);
    online_all(&flavor);
    flavor.request_grace_period();
    assert!(wait_until(|| flavor.coordinator_state() == CoordinatorState::WaitQuiescence));

    for ctx in 0..7 {
        flavor.note_quiescent_state(ctx);
    }
    assert_ne!(flavor.root_mask(), 0);
    assert_eq!(flavor.completed(), 0);

    flavor.note_quiescent_state(7);
    assert_eq!(flavor.root_mask(), 0);
    assert!(wait_until(|| flavor.stats().gp_completed == 1));

    // Repeated reports after the fact must not close anything again.
    for ctx in 0..8 {
        flavor.note_quiescent_state(ctx);
    }
    std::thread::sleep(Duration::from_millis(20));
    let stats = flavor.stats();
    assert_eq!(stats.gp_completed, 1);
    assert_eq!(stats.gp_started, 1);
    assert_eq!(flavor.completed(), 1);
}

#[test]
fn test_accelerate_and_advance_are_idempotent() {
    let config = GraceConfig::for_contexts(2)
        .with_fqs_delays(Duration::from_secs(10), Duration::from_secs(10));
    let flavor = Flavor::<Sched>::new(config).unwrap();
    online_all(&flavor);
    flavor.defer(1, || {});
    flavor.defer(1, || {});

    flavor.accelerate(1);
    let before = flavor.queue_snapshot(1);
    assert_eq!(before.lens[3], 0, "nothing left untagged");
    assert!(!flavor.accelerate(1));
    assert_eq!(flavor.queue_snapshot(1), before);
    assert!(!flavor.advance(1));
    assert!(!flavor.advance(1));
    assert_eq!(flavor.queue_snapshot(1), before);

    assert!(wait_until(|| {
        flavor.note_quiescent_state(0);
        flavor.note_quiescent_state(1);
        flavor.advance(1);
        flavor.queue_snapshot(1).lens[0] == 2
    }));
    let settled = flavor.queue_snapshot(1);
    assert!(!flavor.advance(1));
    assert_eq!(flavor.queue_snapshot(1), settled);
}

#[test]
fn test_every_callback_runs_exactly_once() {
    const CONTEXTS: usize = 4;
    const PER_CONTEXT: usize = 500;
    let flavor = Arc::new(Flavor::<Sched>::new(fast_config(CONTEXTS)).unwrap());
    online_all(&flavor);
    let counts: Arc<Vec<AtomicUsize>> =
        Arc::new((0..CONTEXTS * PER_CONTEXT).map(|_| AtomicUsize::new(0)).collect());
    let finished = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..CONTEXTS)
        .map(|ctx| {
            let flavor = Arc::clone(&flavor);
            let counts = Arc::clone(&counts);
            let finished = Arc::clone(&finished);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                for i in 0..PER_CONTEXT {
                    let counts = Arc::clone(&counts);
                    let slot = ctx * PER_CONTEXT + i;
                    flavor.defer(ctx, move || {
                        counts[slot].fetch_add(1, Ordering::Relaxed);
                    });
                    if i % 16 == 0 {
                        flavor.note_context_switch(ctx);
                        flavor.process_callbacks(ctx);
                    }
                }
                finished.fetch_add(1, Ordering::AcqRel);
                while !stop.load(Ordering::Acquire) {
                    flavor.note_context_switch(ctx);
                    flavor.process_callbacks(ctx);
                    std::thread::sleep(Duration::from_micros(100));
                }
            })
        })
        .collect();

    assert!(wait_until(|| finished.load(Ordering::Acquire) == CONTEXTS));
    flavor.barrier();
    stop.store(true, Ordering::Release);
    for worker in workers {
        worker.join().unwrap();
    }

    for (slot, count) in counts.iter().enumerate() {
        assert_eq!(count.load(Ordering::Relaxed), 1, "callback {slot}");
    }
    assert!(flavor.stats().invoked() >= (CONTEXTS * PER_CONTEXT) as u64);
}

#[test]
fn test_high_water_mark_lifts_batch_limit() {
    let config = GraceConfig::for_contexts(2)
        .with_batch_limits(2, 8, 4)
        .with_fqs_delays(Duration::from_secs(10), Duration::from_secs(10));
    let flavor = Flavor::<Sched>::new(config).unwrap();
    online_all(&flavor);
    let invoked = Arc::new(AtomicUsize::new(0));

    let bump = |counter: &Arc<AtomicUsize>| {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    };
    flavor.defer(0, bump(&invoked));
    assert!(wait_until(|| flavor.coordinator_state() == CoordinatorState::WaitQuiescence));
    for _ in 1..20 {
        flavor.defer(0, bump(&invoked));
    }
    assert!(flavor.stats().fqs_requested >= 1);

    assert!(wait_until(|| {
        flavor.note_quiescent_state(0);
        flavor.note_quiescent_state(1);
        flavor.advance(0);
        flavor.queue_snapshot(0).lens[0] == 20
    }));
    let outcome = flavor.process_callbacks(0);
    assert_eq!(outcome.invoked, 20, "pressure lifts the per-pass limit");
    assert!(!outcome.more_ready);

    // Back under the low-water mark the configured limit applies again.
    for _ in 0..5 {
        flavor.defer(0, bump(&invoked));
    }
    assert!(wait_until(|| {
        flavor.note_quiescent_state(0);
        flavor.note_quiescent_state(1);
        flavor.advance(0);
        flavor.queue_snapshot(0).lens[0] == 5
    }));
    let outcome = flavor.process_callbacks(0);
    assert_eq!(outcome.invoked, 2);
    assert!(outcome.more_ready);
    assert_eq!(invoked.load(Ordering::Relaxed), 22);
}

#[test]
fn test_polling_cookies() {
    let flavor = Arc::new(Flavor::<Sched>::new(fast_config(3)).unwrap());
    online_all(&flavor);
    let drivers = [Driver::spawn(&flavor, 1), Driver::spawn(&flavor, 2)];

    let cookie = flavor.get_state();
    assert!(!flavor.poll_state(cookie));
    flavor.synchronize_on(0);
    assert!(flavor.poll_state(cookie));

    // Already satisfied: returns without queueing anything.
    flavor.cond_synchronize_on(0, cookie);
    assert_eq!(flavor.context(0).queue_len(), 0);

    let later = flavor.get_state();
    flavor.cond_synchronize_on(0, later);
    assert!(flavor.poll_state(later));
    drop(drivers);
}

#[test]
fn test_synchronize_with_single_context_returns_at_once() {
    let flavor = Flavor::<Sched>::new(GraceConfig::for_contexts(2)).unwrap();
    flavor.cpu_online(0);
    flavor.synchronize_on(0);
    assert_eq!(flavor.gp_number(), 0);
}

#[test]
fn test_synchronize_from_outside_any_context() {
    let flavor = Arc::new(Flavor::<Sched>::new(fast_config(2)).unwrap());
    online_all(&flavor);
    let drivers = [Driver::spawn(&flavor, 0), Driver::spawn(&flavor, 1)];
    let cookie = flavor.get_state();
    flavor.synchronize();
    assert!(flavor.poll_state(cookie));
    flavor.barrier();
    drop(drivers);
}

#[test]
fn test_tick_drives_reclamation() {
    let flavor = Flavor::<Sched>::new(fast_config(2)).unwrap();
    online_all(&flavor);
    flavor.note_context_idle_enter(1);
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&invoked);
    flavor.defer(0, move || flag.store(true, Ordering::Release));
    assert!(wait_until(|| {
        flavor.tick(0, true);
        invoked.load(Ordering::Acquire)
    }));
}

#[test]
fn test_drop_stops_coordinator_with_callbacks_queued() {
    let flavor = Flavor::<Sched>::new(fast_config(2)).unwrap();
    online_all(&flavor);
    flavor.defer(0, || panic!("must not run after drop"));
    drop(flavor);
}
