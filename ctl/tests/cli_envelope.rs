// CLI contract: one JSON line on stdout, envelope keys present, documented
// exit codes.

use std::path::Path;
use std::process::Command;

use serde_json::Value;

const ENVELOPE_KEYS: [&str; 6] = [
    "ok",
    "error_code",
    "error",
    "run_id",
    "tool_version",
    "schema_version",
];

struct CliOutput {
    envelope: Value,
    exit_code: i32,
}

fn run_ctl(temp: &Path, args: &[&str]) -> CliOutput {
    let output = Command::new(env!("CARGO_BIN_EXE_headlessctl"))
        .args(args)
        .env("TRI_ROOT", temp.join("tri"))
        .env("TRI_STATE_DIR", temp.join("state"))
        .env("HEADLESS_TOOL_ROOT", temp.join("tool"))
        .env("ANVILOOP_INTEL_ROOT", temp.join("intel"))
        .output()
        .expect("spawn headlessctl");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    assert_eq!(lines.len(), 1, "expected one stdout line, got: {stdout}");
    let envelope: Value = serde_json::from_str(lines[0]).expect("stdout must be JSON");
    for key in ENVELOPE_KEYS {
        assert!(envelope.get(key).is_some(), "missing envelope key {key}");
    }
    CliOutput {
        envelope,
        exit_code: output.status.code().unwrap_or(-1),
    }
}

#[test]
fn unknown_run_reports_run_not_found() {
    let temp = tempfile::tempdir().unwrap();
    let out = run_ctl(temp.path(), &["get_metrics", "nope"]);
    assert_eq!(out.exit_code, 2);
    assert_eq!(out.envelope["ok"], Value::Bool(false));
    assert_eq!(out.envelope["error_code"], "run_not_found");
    assert_eq!(out.envelope["run_id"], "nope");
}

#[test]
fn contract_check_requires_registries() {
    let temp = tempfile::tempdir().unwrap();
    let out = run_ctl(temp.path(), &["contract_check"]);
    assert_eq!(out.exit_code, 2);
    assert_eq!(out.envelope["error_code"], "tasks_missing");
}

#[test]
fn contract_check_reports_structured_errors() {
    let temp = tempfile::tempdir().unwrap();
    let registry = temp.path().join("tool/registry");
    std::fs::create_dir_all(&registry).unwrap();
    std::fs::write(registry.join("tasks.json"), r#"{"tasks": {}}"#).unwrap();
    std::fs::write(
        registry.join("packs.json"),
        r#"{"packs": {"nightly-default": {"env": {}}}}"#,
    )
    .unwrap();

    let out = run_ctl(temp.path(), &["contract_check"]);
    assert_eq!(out.exit_code, 3);
    assert_eq!(out.envelope["error_code"], "contract_failed");
    let errors = out.envelope["errors"].as_array().unwrap();
    assert!(errors.iter().any(|e| e["id"] == "tasks_empty"));
}

#[test]
fn session_lock_contention_flow() {
    let temp = tempfile::tempdir().unwrap();

    let first = run_ctl(temp.path(), &["claim_session_lock", "--purpose", "test"]);
    assert_eq!(first.exit_code, 0);
    assert_eq!(first.envelope["acquired"], Value::Bool(true));
    let holder = first.envelope["lock"]["run_id"].as_str().unwrap().to_string();

    let second = run_ctl(temp.path(), &["claim_session_lock"]);
    assert_eq!(second.exit_code, 3);
    assert_eq!(second.envelope["acquired"], Value::Bool(false));
    assert_eq!(second.envelope["error_code"], "locked");

    let shown = run_ctl(temp.path(), &["show_session_lock"]);
    assert_eq!(shown.exit_code, 3);

    let released = run_ctl(
        temp.path(),
        &["release_session_lock", "--run-id", &holder],
    );
    assert_eq!(released.exit_code, 0);
    assert_eq!(released.envelope["released"], Value::Bool(true));

    let reclaimed = run_ctl(temp.path(), &["claim_session_lock"]);
    assert_eq!(reclaimed.exit_code, 0);
    assert_eq!(reclaimed.envelope["acquired"], Value::Bool(true));
}

#[test]
fn run_task_rejects_conflicting_seed_args() {
    let temp = tempfile::tempdir().unwrap();
    let out = run_ctl(
        temp.path(),
        &["run_task", "T1", "--seed", "1", "--seeds", "1,2"],
    );
    assert_eq!(out.exit_code, 2);
    assert_eq!(out.envelope["error_code"], "conflicting_seed_args");
}

#[test]
fn run_task_rejects_malformed_seed_list() {
    let temp = tempfile::tempdir().unwrap();
    let out = run_ctl(temp.path(), &["run_task", "T1", "--seeds", "1,x"]);
    assert_eq!(out.exit_code, 2);
    assert_eq!(out.envelope["error_code"], "invalid_seeds");
}

#[test]
fn run_task_rejects_non_numeric_seed() {
    let temp = tempfile::tempdir().unwrap();
    let out = run_ctl(temp.path(), &["run_task", "T1", "--seed", "abc"]);
    assert_eq!(out.exit_code, 2);
    assert_eq!(out.envelope["error_code"], "invalid_seed");
}

#[test]
fn unknown_subcommand_emits_envelope() {
    let temp = tempfile::tempdir().unwrap();
    let out = run_ctl(temp.path(), &["frobnicate"]);
    assert_eq!(out.exit_code, 2);
    assert_eq!(out.envelope["error_code"], "unknown_command");
}

#[test]
fn missing_subcommand_emits_envelope() {
    let temp = tempfile::tempdir().unwrap();
    let out = run_ctl(temp.path(), &[]);
    assert_eq!(out.exit_code, 2);
    assert_eq!(out.envelope["error_code"], "missing_command");
}

#[test]
fn cleanup_runs_reports_empty_state() {
    let temp = tempfile::tempdir().unwrap();
    let out = run_ctl(temp.path(), &["cleanup_runs", "--days", "7"]);
    assert_eq!(out.exit_code, 0);
    assert_eq!(out.envelope["removed"], serde_json::json!([]));
}
