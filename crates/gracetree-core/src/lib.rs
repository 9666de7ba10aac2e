//! # gracetree-core
//!
//! Tree-structured grace-period engine for deferred reclamation.
//!
//! Writers hand a callback to [`Flavor::defer`]; it runs once every
//! execution context that might still be reading the old state has passed
//! through a quiescent state. Quiescent-state reports fan in through a
//! combining tree, and a background coordinator thread opens and closes
//! grace periods, crediting idle and offline contexts on the way.
//!
//! ```text
//!   defer ──> CallbackQueue ──accelerate──> tagged with epoch c
//!                                              │
//!   note_quiescent_state ──> leaf ──> ... ──> root empty ──> coordinator
//!                                                             │ cleanup
//!   process_callbacks <──advance── completed >= c <───────────┘
//! ```
//!
//! No `unsafe` code is permitted in this crate.

#![forbid(unsafe_code)]

pub mod barrier;
pub mod callbacks;
pub mod config;
pub mod context;
mod coordinator;
pub mod error;
pub mod flavor;
mod fqs;
pub mod hooks;
mod hotplug;
pub mod readside;
pub mod stats;
pub mod tree;

pub use barrier::GpCookie;
pub use callbacks::Callback;
pub use config::GraceConfig;
pub use context::{ContextId, ContextPhase};
pub use error::GraceError;
pub use flavor::{CoordinatorState, Flavor, InvokeOutcome, QueueSnapshot};
pub use hooks::{NoopHooks, SchedulerHooks};
pub use readside::{Marked, ReadSide, Sched};
pub use stats::{ContextStats, FlavorStats};
