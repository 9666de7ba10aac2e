use std::time::Duration;

use gracetree_torture::structured_log::{LogEmitter, LogLevel, validate_log_file};
use gracetree_torture::{FlavorKind, PIPE_LEN, TortureConfig, torture};

fn short_run(flavor: FlavorKind) -> TortureConfig {
    let mut config = TortureConfig::new(flavor);
    config.readers = 3;
    config.duration = Duration::from_millis(200);
    config
}

#[test]
fn test_sched_run_is_clean() {
    let report = torture::run(&short_run(FlavorKind::Sched)).unwrap();
    assert!(report.passed(), "{}", report.summary());
    assert!(report.updates > 0);
    assert!(report.reads > 0);
    assert!(report.stats.gp_completed > 0);
    assert_eq!(report.pipeline[2..].iter().sum::<u64>(), 0);
    assert_eq!(report.pipeline.len(), PIPE_LEN + 1);
    assert!(report.barriers >= 1);
}

#[test]
fn test_marked_run_with_hotplug_keeps_every_callback() {
    let mut config = short_run(FlavorKind::Marked);
    config.spares = 2;
    let report = torture::run(&config).unwrap();
    assert!(report.passed(), "{}", report.summary());
    assert!(report.hotplug_ops > 0);
    assert_eq!(report.stats.orphaned, report.stats.adopted);
    assert_eq!(report.stats.orphans_held, 0);
    assert_eq!(report.contexts, 6);
}

#[test]
fn test_injected_stall_is_reported_without_errors() {
    let mut config = short_run(FlavorKind::Sched);
    config.stall = Some(Duration::from_millis(150));
    config.grace = config
        .grace
        .with_stall_timeout(Duration::from_millis(40), false);
    let report = torture::run(&config).unwrap();
    assert!(report.passed(), "{}", report.summary());
    assert!(report.stats.stalls_reported >= 1);
}

#[test]
fn test_report_serializes_with_stats() {
    let report = torture::run(&short_run(FlavorKind::Sched)).unwrap();
    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["flavor"], "sched");
    assert_eq!(json["pipeline"].as_array().unwrap().len(), PIPE_LEN + 1);
    assert_eq!(json["stats"]["name"], "sched");
    assert!(json["stats"]["contexts"].is_array());
}

#[test]
fn test_emitted_log_file_validates() {
    let dir = std::env::temp_dir().join(format!("gracetree-torture-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("run.jsonl");
    {
        let mut emitter = LogEmitter::to_file(&path, "torture", "test").unwrap();
        emitter.emit(LogLevel::Info, "run_start").unwrap();
        emitter.emit(LogLevel::Info, "run_end").unwrap();
        emitter.flush().unwrap();
    }
    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 2);
    assert!(errors.is_empty(), "{errors:?}");
    std::fs::remove_dir_all(&dir).unwrap();
}
