//! Errors surfaced by torture runs and log validation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TortureError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("engine setup failed: {0}")]
    Engine(#[from] gracetree_core::GraceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("torture worker {0} panicked")]
    WorkerPanicked(String),
    #[error("logger already installed")]
    LoggerInstalled,
    #[error("torture run detected {errors} errors")]
    Failed { errors: u64 },
    #[error("log validation failed with {count} errors")]
    InvalidLog { count: usize },
}
