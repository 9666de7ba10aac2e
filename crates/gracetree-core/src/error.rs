//! Errors surfaced while building a flavor.
//!
//! Only construction and configuration can fail. Collaborator bugs such as
//! onlining a context twice are assertions, not `Err` values.

use thiserror::Error;

/// Failure to build or configure a [`crate::Flavor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraceError {
    #[error("a flavor needs at least one execution context")]
    NoContexts,
    #[error("{which} fanout {value} outside supported range 2..=64")]
    FanoutOutOfRange { which: &'static str, value: usize },
    #[error("{contexts} contexts exceed the tree capacity of {capacity}")]
    TooManyContexts { contexts: usize, capacity: usize },
    #[error("coordinator context {context} out of range for {contexts} contexts")]
    CoordinatorContext { context: usize, contexts: usize },
    #[error("qlowmark {qlowmark} must not exceed qhimark {qhimark}")]
    Watermarks { qlowmark: usize, qhimark: usize },
    #[error("blimit must be at least 1")]
    ZeroBatchLimit,
    #[error("invalid value {value:?} for {key}")]
    InvalidSetting { key: &'static str, value: String },
    #[error("failed to spawn coordinator thread: {0}")]
    Spawn(String),
}

impl From<std::io::Error> for GraceError {
    fn from(err: std::io::Error) -> Self {
        Self::Spawn(err.to_string())
    }
}
