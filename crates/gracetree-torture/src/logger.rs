//! `log` facade backend that writes engine records as structured JSONL.

use std::sync::Arc;

use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use crate::error::TortureError;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel};

/// Routes `log` records into a shared [`LogEmitter`].
///
/// Engine messages are prefixed with the flavor name (`"sched: ..."`); the
/// prefix is lifted into the entry's `flavor` field.
pub struct JsonlLogger {
    emitter: Arc<Mutex<LogEmitter>>,
    level: LevelFilter,
}

impl JsonlLogger {
    #[must_use]
    pub fn new(emitter: Arc<Mutex<LogEmitter>>, level: LevelFilter) -> Self {
        Self { emitter, level }
    }

    /// Install as the global logger.
    pub fn install(self) -> Result<(), TortureError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self)).map_err(|_| TortureError::LoggerInstalled)?;
        log::set_max_level(level);
        Ok(())
    }

    fn entry_for(record: &Record<'_>) -> LogEntry {
        let message = record.args().to_string();
        let mut entry = LogEntry::new(String::new(), LogLevel::from(record.level()), record.target())
            .with_details(serde_json::json!({ "message": message }));
        if let Some((prefix, _)) = message.split_once(": ")
            && matches!(prefix, "sched" | "marked")
        {
            entry = entry.with_flavor(prefix);
        }
        entry
    }
}

impl Log for JsonlLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let entry = Self::entry_for(record);
        // A failed log write must not take the run down with it.
        let _ = self.emitter.lock().emit_entry(entry);
    }

    fn flush(&self) {
        let _ = self.emitter.lock().flush();
    }
}
