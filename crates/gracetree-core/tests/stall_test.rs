mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{online_all, wait_until};
use gracetree_core::{ContextId, CoordinatorState, Flavor, GraceConfig, SchedulerHooks, Sched};
use parking_lot::Mutex;

#[derive(Default)]
struct RecordingHooks {
    rescheds: Mutex<Vec<ContextId>>,
    described: Mutex<Vec<ContextId>>,
}

struct SharedHooks(Arc<RecordingHooks>);

impl SchedulerHooks for SharedHooks {
    fn resched(&self, context: ContextId) {
        self.0.rescheds.lock().push(context);
    }

    fn describe(&self, context: ContextId) -> Option<String> {
        self.0.described.lock().push(context);
        Some(format!("stuck in test loop on context {context}"))
    }
}

#[test]
fn test_coordinator_reports_stalled_context() {
    let config = GraceConfig::for_contexts(2)
        .with_fqs_delays(Duration::from_millis(2), Duration::from_millis(2))
        .with_sched_qs_delay(Duration::from_millis(5))
        .with_stall_timeout(Duration::from_millis(50), false);
    let hooks = Arc::new(RecordingHooks::default());
    let flavor = Flavor::<Sched>::with_hooks(config, SharedHooks(Arc::clone(&hooks))).unwrap();
    online_all(&flavor);
    flavor.request_grace_period();
    assert!(wait_until(|| flavor.coordinator_state() == CoordinatorState::WaitQuiescence));
    flavor.note_quiescent_state(0);

    assert!(wait_until(|| flavor.stats().stalls_reported >= 1));
    assert!(hooks.described.lock().contains(&1));
    assert!(!hooks.described.lock().contains(&0), "context 0 reported");
    assert!(hooks.rescheds.lock().contains(&1));
    assert_eq!(flavor.completed(), 0);

    // The urgent request turns the next context switch into a momentary
    // idle pass that a scan can credit.
    flavor.note_context_switch(1);
    assert!(wait_until(|| flavor.completed() == 1));
}

#[test]
fn test_urgent_request_credits_context_switch() {
    let config = GraceConfig::for_contexts(2)
        .with_fqs_delays(Duration::from_millis(1), Duration::from_millis(1))
        .with_sched_qs_delay(Duration::from_millis(2));
    let flavor = Flavor::<Sched>::new(config).unwrap();
    online_all(&flavor);
    flavor.note_context_idle_enter(0);
    flavor.request_grace_period();
    assert!(wait_until(|| flavor.coordinator_state() == CoordinatorState::WaitQuiescence));

    // Scans run every millisecond; by the fourth one the delay has passed.
    assert!(wait_until(|| flavor.stats().n_force_qs >= 4));
    let before = flavor.context(1).dynticks();
    flavor.note_context_switch(1);
    assert_eq!(flavor.context(1).dynticks(), before + 2);
    assert!(wait_until(|| flavor.completed() == 1));
}

#[test]
#[should_panic(expected = "stalled grace period")]
fn test_self_detected_stall_panics_when_configured() {
    let config = GraceConfig::for_contexts(2)
        .with_fqs_delays(Duration::from_secs(10), Duration::from_secs(10))
        .with_stall_timeout(Duration::from_millis(20), true);
    let flavor = Flavor::<Sched>::new(config).unwrap();
    online_all(&flavor);
    flavor.request_grace_period();
    assert!(wait_until(|| flavor.coordinator_state() == CoordinatorState::WaitQuiescence));
    std::thread::sleep(Duration::from_millis(40));
    flavor.tick(1, false);
}

const STALL_ABORT_CHILD: &str = "GRACETREE_STALL_ABORT_CHILD";

/// A stall found by the coordinator takes the whole process down, not just
/// the coordinator thread. Runs itself in a child process.
#[test]
fn test_coordinator_stall_aborts_process() {
    if std::env::var_os(STALL_ABORT_CHILD).is_some() {
        let config = GraceConfig::for_contexts(2)
            .with_fqs_delays(Duration::from_millis(2), Duration::from_millis(2))
            .with_stall_timeout(Duration::from_millis(30), true);
        let flavor = Flavor::<Sched>::new(config).unwrap();
        online_all(&flavor);
        flavor.request_grace_period();
        assert!(wait_until(|| flavor.coordinator_state() == CoordinatorState::WaitQuiescence));
        flavor.note_quiescent_state(0);
        std::thread::sleep(Duration::from_secs(5));
        // Still alive: the stall did not end the process.
        std::process::exit(0);
    }

    let status = std::process::Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "test_coordinator_stall_aborts_process", "--nocapture"])
        .env(STALL_ABORT_CHILD, "1")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success(), "process survived a stall with panic_on_stall set");
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(6), "expected SIGABRT, got {status:?}");
    }
}

#[test]
fn test_self_detected_stall_is_counted_once_per_deadline() {
    let config = GraceConfig::for_contexts(2)
        .with_fqs_delays(Duration::from_secs(10), Duration::from_secs(10))
        .with_stall_timeout(Duration::from_millis(20), false);
    let flavor = Flavor::<Sched>::new(config).unwrap();
    online_all(&flavor);
    flavor.request_grace_period();
    assert!(wait_until(|| flavor.coordinator_state() == CoordinatorState::WaitQuiescence));
    std::thread::sleep(Duration::from_millis(40));
    flavor.tick(1, false);
    flavor.tick(1, false);
    flavor.tick(0, false);
    assert_eq!(flavor.stats().stalls_reported, 1);
}
