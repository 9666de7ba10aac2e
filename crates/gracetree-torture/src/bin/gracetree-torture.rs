//! CLI entry point for gracetree torture runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use gracetree_core::GraceConfig;
use gracetree_torture::logger::JsonlLogger;
use gracetree_torture::structured_log::{
    ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome, validate_log_file,
};
use gracetree_torture::{FlavorKind, TortureConfig, TortureError, torture};
use parking_lot::Mutex;

#[derive(Parser)]
#[command(name = "gracetree-torture")]
#[command(about = "Torture harness for the gracetree grace-period engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a torture pass and write its report, log and artifact index.
    Run {
        #[arg(long, value_enum, default_value = "sched")]
        flavor: FlavorKind,
        #[arg(long, default_value_t = 4)]
        readers: usize,
        /// Contexts cycled through online/offline (0 disables hotplug).
        #[arg(long, default_value_t = 2)]
        spares: usize,
        #[arg(long, default_value_t = 2000)]
        duration_ms: u64,
        /// Hold one read-side section this long (0 disables).
        #[arg(long, default_value_t = 0)]
        stall_ms: u64,
        #[arg(long, default_value_t = 21_000)]
        stall_timeout_ms: u64,
        #[arg(long, default_value_t = 1)]
        fqs_ms: u64,
        #[arg(long, default_value_t = 0x5EED)]
        seed: u64,
        /// Also honor GRACETREE_* environment overrides.
        #[arg(long)]
        env: bool,
        #[arg(long, default_value = "target/torture")]
        out_dir: PathBuf,
        #[arg(long, default_value = "info")]
        log_level: log::LevelFilter,
    },
    /// Check a structured log against the schema.
    ValidateLog {
        #[arg(long)]
        path: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            flavor,
            readers,
            spares,
            duration_ms,
            stall_ms,
            stall_timeout_ms,
            fqs_ms,
            seed,
            env,
            out_dir,
            log_level,
        } => {
            let fqs = Duration::from_millis(fqs_ms);
            let mut grace = GraceConfig::for_contexts(1)
                .with_fqs_delays(fqs, fqs)
                .with_stall_timeout(Duration::from_millis(stall_timeout_ms), false);
            if env {
                grace = grace.overlay(|key| std::env::var(key).ok())?;
            }
            let config = TortureConfig {
                flavor,
                readers,
                spares,
                duration: Duration::from_millis(duration_ms),
                stall: (stall_ms > 0).then(|| Duration::from_millis(stall_ms)),
                seed,
                grace,
            };

            std::fs::create_dir_all(&out_dir)?;
            let run_id = format!("{}-{seed:x}", flavor.name());
            let log_path = out_dir.join("torture.log.jsonl");
            let emitter = Arc::new(Mutex::new(LogEmitter::to_file(
                &log_path,
                "torture",
                &run_id,
            )?));
            JsonlLogger::new(Arc::clone(&emitter), log_level).install()?;

            emitter.lock().emit_entry(
                LogEntry::new(String::new(), LogLevel::Info, "run_start")
                    .with_flavor(flavor.name())
                    .with_details(serde_json::json!({
                        "readers": readers,
                        "spares": spares,
                        "duration_ms": duration_ms,
                        "stall_ms": stall_ms,
                        "seed": seed,
                    })),
            )?;

            let result = torture::run(&config);
            let report = match result {
                Ok(report) => report,
                Err(err) => {
                    let mut emitter = emitter.lock();
                    emitter.emit_entry(
                        LogEntry::new(String::new(), LogLevel::Error, "run_end")
                            .with_flavor(flavor.name())
                            .with_outcome(Outcome::Error)
                            .with_details(serde_json::json!({ "error": err.to_string() })),
                    )?;
                    emitter.flush()?;
                    return Err(err.into());
                }
            };

            let report_path = out_dir.join("torture.report.json");
            std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;

            let outcome = if report.passed() { Outcome::Pass } else { Outcome::Fail };
            {
                let mut emitter = emitter.lock();
                emitter.emit_entry(
                    LogEntry::new(
                        String::new(),
                        if report.passed() { LogLevel::Info } else { LogLevel::Error },
                        "run_end",
                    )
                    .with_flavor(flavor.name())
                    .with_epochs(report.stats.gp_number, report.stats.completed)
                    .with_outcome(outcome)
                    .with_duration_ms(report.duration_ms)
                    .with_artifacts(vec![report_path.display().to_string()])
                    .with_details(serde_json::json!({
                        "updates": report.updates,
                        "reads": report.reads,
                        "errors": report.errors,
                    })),
                )?;
                emitter.flush()?;
            }

            let mut index = ArtifactIndex::new(&run_id);
            index.add_file(&report_path, "report")?;
            index.add_file(&log_path, "log")?;
            std::fs::write(out_dir.join("artifact_index.json"), index.to_json()?)?;

            println!("{}", report.summary());
            if !report.passed() {
                return Err(TortureError::Failed {
                    errors: report.errors,
                }
                .into());
            }
        }
        Command::ValidateLog { path } => {
            let (lines, errors) = validate_log_file(&path)?;
            for err in &errors {
                eprintln!("{err}");
            }
            println!("{}: {lines} lines, {} errors", path.display(), errors.len());
            if !errors.is_empty() {
                return Err(TortureError::InvalidLog {
                    count: errors.len(),
                }
                .into());
            }
        }
    }
    Ok(())
}
