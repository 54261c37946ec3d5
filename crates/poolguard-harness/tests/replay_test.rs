//! Integration test: trace replay end to end.
//!
//! Validates that:
//! 1. Fixture traces replay with the expected violation sequence.
//! 2. The JSONL log written during replay passes validation.
//! 3. Termination stops the replay at the terminating operation.
//!
//! Run: cargo test -p poolguard-harness --test replay_test

use std::path::{Path, PathBuf};

use poolguard_harness::structured_log::validate_log_file;
use poolguard_harness::{replay_file, taxonomy};

fn trace_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/traces")
        .join(name)
}

fn temp_log(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("poolguard-{name}-{}.jsonl", std::process::id()))
}

#[test]
fn heap_lifecycle_reports_each_misuse() {
    let log = temp_log("heap-lifecycle");
    let summary = replay_file(&trace_path("heap_lifecycle.json"), Some(&log)).unwrap();

    assert_eq!(summary.name, "heap_lifecycle");
    assert_eq!(summary.ops_total, 15);
    assert_eq!(summary.ops_executed, 15);
    assert!(!summary.terminated);
    assert_eq!(summary.warnings, 1);
    assert_eq!(summary.faults, 4);

    let seen: Vec<(usize, &str)> = summary
        .violations
        .iter()
        .map(|v| (v.op_index, v.symbol))
        .collect();
    assert_eq!(
        seen,
        [
            (4, "FAULT_WRITE_OUT_OF_BOUNDS"),
            (6, "WARN_LOAD_STORE"),
            (7, "FAULT_DANGLING_PTR"),
            (8, "FAULT_DOUBLE_FREE"),
            (13, "FAULT_OUT_OF_BOUNDS"),
        ]
    );
    assert_eq!(summary.violations[0].record.fault_ptr, 0x2_0043);
    assert_eq!(summary.violations[3].record.fault_ptr, 0x1_0000);

    let digest = summary.trace_sha256.as_deref().unwrap();
    assert_eq!(digest.len(), 64);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    let (lines, errors) = validate_log_file(&log).unwrap();
    assert!(errors.is_empty(), "log errors: {errors:?}");
    assert_eq!(lines, 17);

    let content = std::fs::read_to_string(&log).unwrap();
    let double_free: serde_json::Value = content
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .find(|entry| entry["op_index"] == 8)
        .unwrap();
    assert_eq!(double_free["event"], "free_call");
    assert_eq!(double_free["outcome"], "fault");
    assert_eq!(double_free["violation"], "FAULT_DOUBLE_FREE");
    assert_eq!(double_free["fault_ptr"], "0x10000");

    let _ = std::fs::remove_file(&log);
}

#[test]
fn stop_on_error_halts_at_first_fault() {
    let summary = replay_file(&trace_path("stop_on_error.json"), None).unwrap();
    assert!(summary.terminated);
    assert_eq!(summary.terminated_at, Some(2));
    assert_eq!(summary.ops_executed, 3);
    assert_eq!(summary.faults, 1);
    assert_eq!(summary.violations[0].symbol, "FAULT_NOTHEAP_FREE");
    assert_eq!(summary.metrics.checks, 0);
}

#[test]
fn summary_serializes_for_reporting() {
    let summary = replay_file(&trace_path("stop_on_error.json"), None).unwrap();
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["terminated_at"], 2);
    assert_eq!(json["violations"][0]["record"]["kind"], "FAULT_NOTHEAP_FREE");
    assert_eq!(json["violations"][0]["record"]["cwe"], 590);
    assert_eq!(json["metrics"]["faults"], 1);
}

#[test]
fn missing_trace_is_an_io_error() {
    let err = replay_file(&trace_path("does_not_exist.json"), None).unwrap_err();
    assert!(matches!(err, poolguard_harness::HarnessError::Io(_)));
}

#[test]
fn taxonomy_symbols_round_trip_through_log_validation() {
    for entry in taxonomy() {
        let line = serde_json::json!({
            "timestamp": "2026-10-19T00:00:00.000Z",
            "trace_id": "taxonomy::0001",
            "level": if entry.warning { "warn" } else { "error" },
            "event": "check",
            "violation": entry.symbol,
            "fault_ptr": "0x1000",
        })
        .to_string();
        assert!(
            poolguard_harness::structured_log::validate_log_line(&line, 1).is_ok(),
            "{} rejected",
            entry.symbol
        );
    }
}
