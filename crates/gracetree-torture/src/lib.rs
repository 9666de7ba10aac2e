//! # gracetree-torture
//!
//! Stress harness for the gracetree engine: a writer retires versioned
//! objects through grace periods while readers check that nothing they
//! hold is freed underneath them. Runs produce a JSON report, a JSONL
//! structured log and a SHA-256 artifact index.

#![forbid(unsafe_code)]

pub mod error;
pub mod logger;
pub mod structured_log;
pub mod torture;

pub use error::TortureError;
pub use torture::{FlavorKind, PIPE_LEN, TortureConfig, TortureReport};
