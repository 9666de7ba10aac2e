#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use gracetree_core::{ContextId, Flavor, GraceConfig, ReadSide};

pub const DEADLINE: Duration = Duration::from_secs(10);

/// Poll `cond` until it holds or `DEADLINE` passes.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    cond()
}

/// Config with fast scans so idle contexts are credited quickly.
pub fn fast_config(contexts: usize) -> GraceConfig {
    GraceConfig::for_contexts(contexts)
        .with_fqs_delays(Duration::from_millis(1), Duration::from_millis(1))
        .with_barrier_poll(Duration::from_micros(200))
}

pub fn online_all<R: ReadSide>(flavor: &Flavor<R>) {
    for ctx in 0..flavor.config().contexts {
        flavor.cpu_online(ctx);
    }
}

/// A thread acting as one context: it keeps switching and draining its
/// queue until stopped.
pub struct Driver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Driver {
    pub fn spawn<R: ReadSide>(flavor: &Arc<Flavor<R>>, context: ContextId) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let flavor = Arc::clone(flavor);
        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                flavor.note_context_switch(context);
                flavor.process_callbacks(context);
                std::thread::sleep(Duration::from_micros(100));
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.halt();
    }
}
