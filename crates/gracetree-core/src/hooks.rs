//! Scheduler collaborator interface.

use crate::context::ContextId;

/// Hooks into the scheduler that runs the contexts.
///
/// Both methods are best effort and may be called from the coordinator
/// thread while a grace period is stalled.
pub trait SchedulerHooks: Send + Sync {
    /// Ask the scheduler to force a context switch on `context`.
    fn resched(&self, _context: ContextId) {}

    /// Stack trace or other metadata for a stalled `context`.
    fn describe(&self, _context: ContextId) -> Option<String> {
        None
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl SchedulerHooks for NoopHooks {}
