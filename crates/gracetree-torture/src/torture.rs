//! Grace-period torture run.
//!
//! Context 0 is the writer. It keeps replacing the current object of a
//! fixed pool and retires the old one, alternating between a
//! self-re-deferring pipeline callback and `synchronize_on` followed by a
//! sweep. Every completed grace period advances a retired object one
//! pipeline stage; after [`PIPE_LEN`] stages it goes back on the freelist.
//!
//! Contexts `1..=readers` read the current object inside read-side
//! sections. A reader that sees a pipeline count above 1, a freed object,
//! or a recycled one (generation changed under it) has caught a grace
//! period ending while it was still reading.
//!
//! Remaining contexts are spares that a hotplug thread brings online,
//! loads with callbacks and takes offline again.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use gracetree_core::{ContextId, Flavor, FlavorStats, GraceConfig, Marked, ReadSide, Sched};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::TortureError;

/// Grace-period stages a retired object passes before it is freed.
pub const PIPE_LEN: usize = 10;
const POOL_SIZE: usize = 10 * PIPE_LEN;
const WRITER: ContextId = 0;
/// Writer updates between mid-run barriers.
const BARRIER_EVERY: u64 = 256;
/// Reader passes between scheduler-clock ticks.
const TICK_EVERY: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FlavorKind {
    Sched,
    Marked,
}

impl FlavorKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sched => Sched::NAME,
            Self::Marked => Marked::NAME,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TortureConfig {
    pub flavor: FlavorKind,
    pub readers: usize,
    /// Contexts cycled through online/offline. Zero disables hotplug.
    pub spares: usize,
    pub duration: Duration,
    /// One reader holds a single read-side section this long.
    pub stall: Option<Duration>,
    pub seed: u64,
    /// Engine tunables. `contexts` is overwritten from the layout above.
    pub grace: GraceConfig,
}

impl TortureConfig {
    #[must_use]
    pub fn new(flavor: FlavorKind) -> Self {
        Self {
            flavor,
            readers: 2,
            spares: 0,
            duration: Duration::from_secs(1),
            stall: None,
            seed: 0x5EED_F00D_6EA5,
            grace: GraceConfig::for_contexts(1)
                .with_fqs_delays(Duration::from_millis(1), Duration::from_millis(1)),
        }
    }

    #[must_use]
    pub fn contexts(&self) -> usize {
        1 + self.readers + self.spares
    }

    pub fn validate(&self) -> Result<(), TortureError> {
        if self.readers == 0 {
            return Err(TortureError::InvalidArgument(
                "at least one reader is required".to_string(),
            ));
        }
        if self.duration.is_zero() {
            return Err(TortureError::InvalidArgument(
                "duration must be non-zero".to_string(),
            ));
        }
        let mut grace = self.grace.clone();
        grace.contexts = self.contexts();
        grace.validate()?;
        Ok(())
    }

    fn grace_config(&self) -> GraceConfig {
        let mut grace = self.grace.clone();
        grace.contexts = self.contexts();
        grace
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TortureReport {
    pub flavor: FlavorKind,
    pub contexts: usize,
    pub duration_ms: u64,
    pub updates: u64,
    pub reads: u64,
    pub alloc_failures: u64,
    /// Pipeline stage observed by readers, clamped to `PIPE_LEN`.
    pub pipeline: [u64; PIPE_LEN + 1],
    /// Grace periods completed during a read-side section, clamped.
    pub batch: [u64; PIPE_LEN + 1],
    pub errors: u64,
    pub hotplug_ops: u64,
    pub hotplug_callbacks: u64,
    pub barriers: u64,
    pub stats: FlavorStats,
}

impl TortureReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.errors == 0
    }

    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{}: {} updates, {} reads, {} grace periods, {} errors",
            self.flavor.name(),
            self.updates,
            self.reads,
            self.stats.gp_completed,
            self.errors
        )
    }
}

// ---------------------------------------------------------------------------
// Object pool
// ---------------------------------------------------------------------------

struct Slot {
    pipe_count: AtomicUsize,
    generation: AtomicU64,
    freed: AtomicBool,
}

struct Pool {
    slots: Box<[Slot]>,
    current: AtomicUsize,
    freelist: Mutex<Vec<usize>>,
    /// Pipeline callbacks free instead of re-deferring.
    draining: AtomicBool,
}

impl Pool {
    fn new(size: usize) -> Self {
        let slots = (0..size)
            .map(|i| Slot {
                pipe_count: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                freed: AtomicBool::new(i != 0),
            })
            .collect();
        Self {
            slots,
            current: AtomicUsize::new(0),
            freelist: Mutex::new((1..size).rev().collect()),
            draining: AtomicBool::new(false),
        }
    }

    fn alloc(&self) -> Option<usize> {
        let idx = self.freelist.lock().pop()?;
        let slot = &self.slots[idx];
        slot.pipe_count.store(0, Ordering::Relaxed);
        slot.generation.fetch_add(1, Ordering::Relaxed);
        slot.freed.store(false, Ordering::Release);
        Some(idx)
    }

    fn free(&self, idx: usize) {
        self.slots[idx].freed.store(true, Ordering::Release);
        self.freelist.lock().push(idx);
    }

    /// Swap `new` in as current and return the retired index.
    fn replace(&self, new: usize) -> usize {
        let old = self.current.swap(new, Ordering::AcqRel);
        self.slots[old].pipe_count.fetch_add(1, Ordering::AcqRel);
        old
    }

    /// Advance a retired object one stage. Returns true once freed.
    fn pipe_step(&self, idx: usize) -> bool {
        let stage = self.slots[idx].pipe_count.fetch_add(1, Ordering::AcqRel) + 1;
        if stage >= PIPE_LEN {
            self.free(idx);
            true
        } else {
            false
        }
    }
}

fn pipeline_callback<R: ReadSide>(
    pool: Arc<Pool>,
    flavor: Weak<Flavor<R>>,
    idx: usize,
) -> impl FnOnce() + Send + 'static {
    move || {
        if pool.pipe_step(idx) {
            return;
        }
        if pool.draining.load(Ordering::Acquire) {
            pool.free(idx);
            return;
        }
        match flavor.upgrade() {
            Some(f) => {
                let next = pipeline_callback(Arc::clone(&pool), Weak::clone(&flavor), idx);
                f.defer(WRITER, next);
            }
            None => pool.free(idx),
        }
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: u64, high_inclusive: u64) -> u64 {
        low + self.next_u64() % (high_inclusive - low + 1)
    }
}

#[derive(Default)]
struct WriterTally {
    updates: u64,
    alloc_failures: u64,
    barriers: u64,
}

struct ReaderTally {
    reads: u64,
    errors: u64,
    pipeline: [u64; PIPE_LEN + 1],
    batch: [u64; PIPE_LEN + 1],
}

#[derive(Default)]
struct HotplugTally {
    ops: u64,
    deferred: u64,
}

fn writer<R: ReadSide>(flavor: Arc<Flavor<R>>, pool: Arc<Pool>, stop: Arc<AtomicBool>) -> WriterTally {
    let mut tally = WriterTally::default();
    let mut retired: Vec<usize> = Vec::new();

    while !stop.load(Ordering::Acquire) {
        flavor.note_context_switch(WRITER);
        flavor.process_callbacks(WRITER);
        let Some(new) = pool.alloc() else {
            tally.alloc_failures += 1;
            std::thread::yield_now();
            continue;
        };
        let old = pool.replace(new);
        tally.updates += 1;

        if tally.updates.is_multiple_of(2) {
            let cb = pipeline_callback(Arc::clone(&pool), Arc::downgrade(&flavor), old);
            flavor.defer(WRITER, cb);
        } else {
            retired.push(old);
            flavor.synchronize_on(WRITER);
            retired.retain(|&idx| !pool.pipe_step(idx));
        }

        if tally.updates.is_multiple_of(BARRIER_EVERY) {
            flavor.barrier_on(WRITER);
            tally.barriers += 1;
        }
    }

    pool.draining.store(true, Ordering::Release);
    flavor.barrier_on(WRITER);
    tally.barriers += 1;
    log::info!(
        "{}: writer done after {} updates, {} still in sweep",
        R::NAME,
        tally.updates,
        retired.len()
    );
    tally
}

fn reader<R: ReadSide>(
    flavor: Arc<Flavor<R>>,
    pool: Arc<Pool>,
    stop: Arc<AtomicBool>,
    context: ContextId,
    mut stall: Option<Duration>,
    seed: u64,
) -> ReaderTally {
    let mut rng = XorShift64::new(seed);
    let mut tally = ReaderTally {
        reads: 0,
        errors: 0,
        pipeline: [0; PIPE_LEN + 1],
        batch: [0; PIPE_LEN + 1],
    };

    while !stop.load(Ordering::Acquire) {
        flavor.enter_read_side(context);
        let completed_before = flavor.completed();
        let idx = pool.current.load(Ordering::Acquire);
        let slot = &pool.slots[idx];
        let generation = slot.generation.load(Ordering::Acquire);

        if let Some(hold) = stall.take() {
            log::info!("{}: context {context} holding a read section for {hold:?}", R::NAME);
            std::thread::sleep(hold);
        } else if rng.gen_range(0, 15) == 0 {
            std::thread::sleep(Duration::from_micros(rng.gen_range(1, 50)));
        }

        let pipe = slot.pipe_count.load(Ordering::Acquire);
        let freed = slot.freed.load(Ordering::Acquire);
        let recycled = slot.generation.load(Ordering::Acquire) != generation;
        let delta = flavor.completed().saturating_sub(completed_before);
        flavor.exit_read_side(context);

        tally.reads += 1;
        tally.pipeline[pipe.min(PIPE_LEN)] += 1;
        tally.batch[(delta as usize).min(PIPE_LEN)] += 1;
        if pipe > 1 || freed || recycled {
            tally.errors += 1;
            log::error!(
                "{}: context {context} saw object {idx} at stage {pipe} (freed {freed}, recycled {recycled})",
                R::NAME
            );
        }

        flavor.note_context_switch(context);
        flavor.process_callbacks(context);
        if tally.reads.is_multiple_of(TICK_EVERY) {
            flavor.tick(context, false);
        }
    }

    flavor.note_context_idle_enter(context);
    tally
}

fn hotplug<R: ReadSide>(
    flavor: Arc<Flavor<R>>,
    stop: Arc<AtomicBool>,
    spares: std::ops::Range<ContextId>,
    invoked: Arc<AtomicU64>,
    seed: u64,
) -> HotplugTally {
    let mut rng = XorShift64::new(seed);
    let mut tally = HotplugTally::default();
    let first = spares.start as u64;
    let last = spares.end as u64 - 1;

    while !stop.load(Ordering::Acquire) {
        let spare = rng.gen_range(first, last) as ContextId;
        flavor.cpu_online(spare);
        for _ in 0..rng.gen_range(1, 8) {
            let invoked = Arc::clone(&invoked);
            flavor.defer(spare, move || {
                invoked.fetch_add(1, Ordering::Relaxed);
            });
            tally.deferred += 1;
        }
        flavor.note_context_switch(spare);
        flavor.process_callbacks(spare);
        flavor.cpu_offline(spare);
        tally.ops += 2;
        std::thread::sleep(Duration::from_millis(1));
    }
    tally
}

fn spawn<T, F>(name: String, f: F) -> Result<JoinHandle<T>, TortureError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    Ok(std::thread::Builder::new().name(name).spawn(f)?)
}

fn join<T>(name: &str, handle: JoinHandle<T>) -> Result<T, TortureError> {
    handle
        .join()
        .map_err(|_| TortureError::WorkerPanicked(name.to_string()))
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run a torture pass with the configured flavor.
pub fn run(config: &TortureConfig) -> Result<TortureReport, TortureError> {
    config.validate()?;
    match config.flavor {
        FlavorKind::Sched => run_with::<Sched>(config),
        FlavorKind::Marked => run_with::<Marked>(config),
    }
}

fn run_with<R: ReadSide>(config: &TortureConfig) -> Result<TortureReport, TortureError> {
    let started = Instant::now();
    let flavor = Arc::new(Flavor::<R>::new(config.grace_config())?);
    for ctx in 0..=config.readers {
        flavor.cpu_online(ctx);
    }
    let pool = Arc::new(Pool::new(POOL_SIZE));
    let stop_readers = Arc::new(AtomicBool::new(false));
    let stop_writer = Arc::new(AtomicBool::new(false));
    let hotplug_invoked = Arc::new(AtomicU64::new(0));
    log::info!(
        "{}: torture start with {} readers and {} spares for {:?}",
        R::NAME,
        config.readers,
        config.spares,
        config.duration
    );

    let writer_handle = {
        let (flavor, pool, stop) = (Arc::clone(&flavor), Arc::clone(&pool), Arc::clone(&stop_writer));
        spawn("torture-writer".to_string(), move || writer(flavor, pool, stop))?
    };

    let mut reader_handles = Vec::with_capacity(config.readers);
    for ctx in 1..=config.readers {
        let (flavor, pool, stop) = (Arc::clone(&flavor), Arc::clone(&pool), Arc::clone(&stop_readers));
        let stall = if ctx == 1 { config.stall } else { None };
        let seed = config.seed ^ (ctx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        reader_handles.push(spawn(format!("torture-reader-{ctx}"), move || {
            reader(flavor, pool, stop, ctx, stall, seed)
        })?);
    }

    let hotplug_handle = if config.spares > 0 {
        let (flavor, stop, invoked) = (
            Arc::clone(&flavor),
            Arc::clone(&stop_readers),
            Arc::clone(&hotplug_invoked),
        );
        let spares = config.readers + 1..config.contexts();
        let seed = config.seed.rotate_left(17);
        Some(spawn("torture-hotplug".to_string(), move || {
            hotplug(flavor, stop, spares, invoked, seed)
        })?)
    } else {
        None
    };

    std::thread::sleep(config.duration);
    stop_readers.store(true, Ordering::Release);

    let mut reads = 0;
    let mut errors = 0;
    let mut pipeline = [0; PIPE_LEN + 1];
    let mut batch = [0; PIPE_LEN + 1];
    for handle in reader_handles {
        let tally = join("reader", handle)?;
        reads += tally.reads;
        errors += tally.errors;
        for (total, n) in pipeline.iter_mut().zip(tally.pipeline) {
            *total += n;
        }
        for (total, n) in batch.iter_mut().zip(tally.batch) {
            *total += n;
        }
    }
    let hotplug_tally = match hotplug_handle {
        Some(handle) => join("hotplug", handle)?,
        None => HotplugTally::default(),
    };

    // Spares are offline now; the writer's final barrier drains everything
    // they handed over.
    stop_writer.store(true, Ordering::Release);
    let writer_tally = join("writer", writer_handle)?;

    let hotplug_callbacks = hotplug_invoked.load(Ordering::Relaxed);
    if hotplug_callbacks != hotplug_tally.deferred {
        errors += 1;
        log::error!(
            "{}: {} of {} hotplug callbacks ran",
            R::NAME,
            hotplug_callbacks,
            hotplug_tally.deferred
        );
    }
    let stats = flavor.stats();
    if stats.orphans_held != 0 {
        errors += 1;
        log::error!("{}: {} callbacks left orphaned", R::NAME, stats.orphans_held);
    }

    let report = TortureReport {
        flavor: config.flavor,
        contexts: config.contexts(),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        updates: writer_tally.updates,
        reads,
        alloc_failures: writer_tally.alloc_failures,
        pipeline,
        batch,
        errors,
        hotplug_ops: hotplug_tally.ops,
        hotplug_callbacks,
        barriers: writer_tally.barriers,
        stats,
    };
    log::info!("{}", report.summary());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_frees_after_pipe_len_stages() {
        let pool = Pool::new(4);
        let new = pool.alloc().unwrap();
        let old = pool.replace(new);
        assert_eq!(old, 0);
        assert_eq!(pool.slots[old].pipe_count.load(Ordering::Relaxed), 1);
        for _ in 2..PIPE_LEN {
            assert!(!pool.pipe_step(old));
        }
        assert!(pool.pipe_step(old));
        assert!(pool.slots[old].freed.load(Ordering::Relaxed));
        assert_eq!(pool.freelist.lock().last(), Some(&old));
    }

    #[test]
    fn test_alloc_bumps_generation_and_exhausts() {
        let pool = Pool::new(3);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert!(pool.alloc().is_none());
        let generation = pool.slots[a].generation.load(Ordering::Relaxed);
        pool.free(a);
        assert_eq!(pool.alloc(), Some(a));
        assert_eq!(pool.slots[a].generation.load(Ordering::Relaxed), generation + 1);
        assert!(!pool.slots[a].freed.load(Ordering::Relaxed));
    }

    #[test]
    fn test_config_validation() {
        let mut config = TortureConfig::new(FlavorKind::Sched);
        assert!(config.validate().is_ok());
        config.readers = 0;
        assert!(matches!(config.validate(), Err(TortureError::InvalidArgument(_))));

        let mut config = TortureConfig::new(FlavorKind::Marked);
        config.grace = config.grace.with_coordinator_context(99);
        assert!(matches!(config.validate(), Err(TortureError::Engine(_))));
    }

    #[test]
    fn test_flavor_kind_names_match_engine() {
        assert_eq!(FlavorKind::Sched.name(), "sched");
        assert_eq!(FlavorKind::Marked.name(), "marked");
        assert_eq!(serde_json::to_string(&FlavorKind::Marked).unwrap(), "\"marked\"");
    }
}
