//! Engine tuning knobs.
//!
//! Every knob has a compiled-in default and can be overridden through a
//! `GRACETREE_*` environment variable:
//! - `GRACETREE_CONTEXTS`: number of execution contexts (default: available parallelism).
//! - `GRACETREE_FANOUT_LEAF` / `GRACETREE_FANOUT`: combining-tree shape (16 / 64).
//! - `GRACETREE_BLIMIT`, `GRACETREE_QHIMARK`, `GRACETREE_QLOWMARK`: callback batching.
//! - `GRACETREE_FIRST_FQS_MS` / `GRACETREE_NEXT_FQS_MS`: force-quiescence cadence.
//! - `GRACETREE_SCHED_QS_MS`: delay before non-reporting contexts are asked to hurry.
//! - `GRACETREE_STALL_TIMEOUT_MS`, `GRACETREE_PANIC_ON_STALL`: stall reporting.
//! - `GRACETREE_COORDINATOR_CONTEXT`: context whose queue the coordinator services.
//! - `GRACETREE_BARRIER_POLL_MS`: how often a waiting context services its own queue.
//!
//! Numeric values must parse; booleans are parsed loosely (`1`, `on`, `yes`, `true`, ...).

use std::time::Duration;

use crate::error::GraceError;
use crate::tree::geometry::MAX_FANOUT;

/// Default callbacks invoked per pass.
pub const DEFAULT_BLIMIT: usize = 10;
/// Queue growth that triggers escalation.
pub const DEFAULT_QHIMARK: usize = 10_000;
/// Queue length at which an escalated batch limit is restored.
pub const DEFAULT_QLOWMARK: usize = 100;
pub const DEFAULT_FANOUT_LEAF: usize = 16;
pub const DEFAULT_FANOUT: usize = 64;

/// Tunables for a single [`crate::Flavor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceConfig {
    /// Number of execution contexts, fixed for the life of the flavor.
    pub contexts: usize,
    /// Contexts per leaf node.
    pub fanout_leaf: usize,
    /// Children per interior node.
    pub fanout: usize,
    /// Callbacks invoked per `process_callbacks` pass.
    pub blimit: usize,
    /// Pending-callback growth that makes `defer` escalate.
    pub qhimark: usize,
    /// Queue length below which an escalated batch limit is dropped back.
    pub qlowmark: usize,
    /// Wait before the first force-quiescence scan of a grace period.
    pub first_fqs_delay: Duration,
    /// Wait between subsequent force-quiescence scans.
    pub next_fqs_delay: Duration,
    /// Grace-period age after which running contexts are asked for a
    /// momentary quiescent state. Twice this age triggers a reschedule nudge.
    pub sched_qs_delay: Duration,
    /// Grace-period age after which non-reporting contexts are dumped.
    pub stall_timeout: Duration,
    /// Abort the process after the coordinator dumps a stall. A stall a
    /// context detects in its own tick panics that context's thread instead.
    pub panic_on_stall: bool,
    /// Context whose callbacks the coordinator advances during cleanup.
    pub coordinator_context: usize,
    /// Poll interval used by `barrier_on`/`synchronize_on` waiters.
    pub barrier_poll: Duration,
}

impl Default for GraceConfig {
    fn default() -> Self {
        let contexts = std::thread::available_parallelism().map_or(1, usize::from);
        Self::for_contexts(contexts)
    }
}

/// Force-quiescence cadence grows slowly with the number of contexts.
fn default_fqs_delay(contexts: usize) -> Duration {
    Duration::from_millis(3 + (contexts / 256) as u64).min(Duration::from_secs(1))
}

impl GraceConfig {
    /// Defaults sized for `contexts` execution contexts.
    #[must_use]
    pub fn for_contexts(contexts: usize) -> Self {
        Self {
            contexts,
            fanout_leaf: DEFAULT_FANOUT_LEAF,
            fanout: DEFAULT_FANOUT,
            blimit: DEFAULT_BLIMIT,
            qhimark: DEFAULT_QHIMARK,
            qlowmark: DEFAULT_QLOWMARK,
            first_fqs_delay: default_fqs_delay(contexts),
            next_fqs_delay: default_fqs_delay(contexts),
            sched_qs_delay: Duration::from_millis(50),
            stall_timeout: Duration::from_secs(21),
            panic_on_stall: false,
            coordinator_context: 0,
            barrier_poll: Duration::from_millis(1),
        }
    }

    #[must_use]
    pub fn with_fanout(mut self, fanout_leaf: usize, fanout: usize) -> Self {
        self.fanout_leaf = fanout_leaf;
        self.fanout = fanout;
        self
    }

    #[must_use]
    pub fn with_batch_limits(mut self, blimit: usize, qhimark: usize, qlowmark: usize) -> Self {
        self.blimit = blimit;
        self.qhimark = qhimark;
        self.qlowmark = qlowmark;
        self
    }

    #[must_use]
    pub fn with_fqs_delays(mut self, first: Duration, next: Duration) -> Self {
        self.first_fqs_delay = first;
        self.next_fqs_delay = next;
        self
    }

    #[must_use]
    pub fn with_sched_qs_delay(mut self, delay: Duration) -> Self {
        self.sched_qs_delay = delay;
        self
    }

    #[must_use]
    pub fn with_stall_timeout(mut self, timeout: Duration, panic_on_stall: bool) -> Self {
        self.stall_timeout = timeout;
        self.panic_on_stall = panic_on_stall;
        self
    }

    #[must_use]
    pub fn with_coordinator_context(mut self, context: usize) -> Self {
        self.coordinator_context = context;
        self
    }

    #[must_use]
    pub fn with_barrier_poll(mut self, poll: Duration) -> Self {
        self.barrier_poll = poll;
        self
    }

    /// Check the knobs for internal consistency. Tree capacity is checked
    /// separately when the geometry is computed.
    pub fn validate(&self) -> Result<(), GraceError> {
        if self.contexts == 0 {
            return Err(GraceError::NoContexts);
        }
        if !(2..=MAX_FANOUT).contains(&self.fanout_leaf) {
            return Err(GraceError::FanoutOutOfRange {
                which: "leaf",
                value: self.fanout_leaf,
            });
        }
        if !(2..=MAX_FANOUT).contains(&self.fanout) {
            return Err(GraceError::FanoutOutOfRange {
                which: "interior",
                value: self.fanout,
            });
        }
        if self.coordinator_context >= self.contexts {
            return Err(GraceError::CoordinatorContext {
                context: self.coordinator_context,
                contexts: self.contexts,
            });
        }
        if self.blimit == 0 {
            return Err(GraceError::ZeroBatchLimit);
        }
        if self.qlowmark > self.qhimark {
            return Err(GraceError::Watermarks {
                qlowmark: self.qlowmark,
                qhimark: self.qhimark,
            });
        }
        Ok(())
    }

    /// Defaults overlaid with `GRACETREE_*` environment variables.
    pub fn from_env() -> Result<Self, GraceError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by env-var name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GraceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::default().overlay(lookup)
    }

    /// Apply overrides from `lookup` on top of `self`.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, GraceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("GRACETREE_CONTEXTS") {
            self.contexts = parse_count("GRACETREE_CONTEXTS", &raw)?;
            let fqs = default_fqs_delay(self.contexts);
            self.first_fqs_delay = fqs;
            self.next_fqs_delay = fqs;
        }
        let counts: [(&'static str, &mut usize); 6] = [
            ("GRACETREE_FANOUT_LEAF", &mut self.fanout_leaf),
            ("GRACETREE_FANOUT", &mut self.fanout),
            ("GRACETREE_BLIMIT", &mut self.blimit),
            ("GRACETREE_QHIMARK", &mut self.qhimark),
            ("GRACETREE_QLOWMARK", &mut self.qlowmark),
            ("GRACETREE_COORDINATOR_CONTEXT", &mut self.coordinator_context),
        ];
        for (key, slot) in counts {
            if let Some(raw) = lookup(key) {
                *slot = parse_count(key, &raw)?;
            }
        }
        let delays: [(&'static str, &mut Duration); 5] = [
            ("GRACETREE_FIRST_FQS_MS", &mut self.first_fqs_delay),
            ("GRACETREE_NEXT_FQS_MS", &mut self.next_fqs_delay),
            ("GRACETREE_SCHED_QS_MS", &mut self.sched_qs_delay),
            ("GRACETREE_STALL_TIMEOUT_MS", &mut self.stall_timeout),
            ("GRACETREE_BARRIER_POLL_MS", &mut self.barrier_poll),
        ];
        for (key, slot) in delays {
            if let Some(raw) = lookup(key) {
                *slot = Duration::from_millis(parse_count(key, &raw)? as u64);
            }
        }
        if let Some(raw) = lookup("GRACETREE_PANIC_ON_STALL") {
            self.panic_on_stall =
                parse_bool_loose(&raw).ok_or_else(|| GraceError::InvalidSetting {
                    key: "GRACETREE_PANIC_ON_STALL",
                    value: raw.clone(),
                })?;
        }
        self.validate()?;
        Ok(self)
    }
}

fn parse_count(key: &'static str, raw: &str) -> Result<usize, GraceError> {
    raw.trim()
        .replace('_', "")
        .parse::<usize>()
        .map_err(|_| GraceError::InvalidSetting {
            key,
            value: raw.to_string(),
        })
}

/// Parse a boolean knob (case-insensitive).
#[must_use]
pub fn parse_bool_loose(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" | "enabled" => Some(true),
        "0" | "false" | "off" | "no" | "disabled" => Some(false),
        _ => None,
    }
}
