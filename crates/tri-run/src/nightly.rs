// Nightly Scheduler
// Batch driver: lock coordination, task selection, gate short-circuit,
// per-run evaluation, artifact collection, previous-run deltas.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use tri_core::{
    check_build_lock, check_nightly_lock, claim_nightly_lock, claim_session_lock,
    clear_nightly_lock, find_previous_run, load_task_registry, release_session_lock, Paths,
};
use tri_types::{parse_utc, Task};

use crate::bundle::bundle_artifacts;
use crate::orchestrator::{run_task, RunTaskOutcome, RunTaskRequest};

/// Session lock TTL for a nightly cycle (90 minutes).
const NIGHTLY_SESSION_TTL_SEC: u64 = 5400;
/// Tasks tagged with this are hoisted to the front of the cycle.
const FAST_SMOKE_TAG: &str = "fast_smoke";
/// High-signal gate tasks whose recent PASS lets the nightly skip them.
const GATE_TASK_IDS: [&str; 2] = ["G0.GODGAME_SMOKE", "S0.SPACE4X_SMOKE"];

#[derive(Debug, Clone)]
pub struct NightlyOptions {
    pub tag: String,
    pub tasks: Vec<String>,
    pub gate: bool,
    pub gate_hours: f64,
    pub artifact_dir: PathBuf,
    pub summary_path: PathBuf,
}

impl Default for NightlyOptions {
    fn default() -> Self {
        Self {
            tag: "nightly".to_string(),
            tasks: Vec::new(),
            gate: false,
            gate_hours: 12.0,
            artifact_dir: PathBuf::from("nightly_artifacts"),
            summary_path: PathBuf::from("nightly_summary.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TopDelta {
    pub key: String,
    pub previous: f64,
    pub current: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NightlyRunEntry {
    pub task_id: String,
    pub run_id: Option<String>,
    pub seed_run_ids: Vec<String>,
    pub ok: bool,
    pub error_code: Option<String>,
    pub error: Option<String>,
    pub failures: Vec<String>,
    pub previous_run_id: Option<String>,
    pub top_metric_deltas: Vec<TopDelta>,
    pub bundle_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NightlySummary {
    pub ok: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tag: String,
    pub tasks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gate_tasks: Vec<String>,
    pub runs: Vec<NightlyRunEntry>,
}

impl NightlySummary {
    fn skipped(tag: &str, reason: &str) -> Self {
        Self {
            ok: true,
            skipped: true,
            reason: Some(reason.to_string()),
            error: None,
            tag: tag.to_string(),
            tasks: Vec::new(),
            gate_tasks: Vec::new(),
            runs: Vec::new(),
        }
    }

    fn failed(tag: &str, reason: &str, error: Option<String>, tasks: Vec<String>) -> Self {
        Self {
            ok: false,
            skipped: false,
            reason: Some(reason.to_string()),
            error,
            tag: tag.to_string(),
            tasks,
            gate_tasks: Vec::new(),
            runs: Vec::new(),
        }
    }
}

fn write_summary(options: &NightlyOptions, summary: &NightlySummary) {
    if let Some(parent) = options.summary_path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = fs::create_dir_all(parent);
        }
    }
    match serde_json::to_string_pretty(summary) {
        Ok(text) => {
            if let Err(err) = fs::write(&options.summary_path, format!("{text}\n")) {
                tracing::error!(error = %err, "failed to write nightly summary");
            }
        }
        Err(err) => tracing::error!(error = %err, "failed to serialize nightly summary"),
    }
}

/// Sort key: nightly_order ascending with missing orders last, ties by id.
fn task_sort_key(task_id: &str, task: &Task) -> (i64, String) {
    (task.nightly_order.unwrap_or(1000), task_id.to_string())
}

/// Select the cycle's tasks: explicit list verbatim, else tag match sorted by
/// nightly_order with fast_smoke tasks hoisted to the front.
pub fn select_tasks(
    registry: &BTreeMap<String, Task>,
    tag: &str,
    explicit: &[String],
) -> Result<Vec<String>, String> {
    if !explicit.is_empty() {
        let missing: Vec<&String> = explicit
            .iter()
            .filter(|task_id| !registry.contains_key(*task_id))
            .collect();
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|s| s.to_string()).collect();
            return Err(format!("unknown tasks: {}", names.join(", ")));
        }
        return Ok(explicit.to_vec());
    }

    let mut selected: Vec<String> = registry
        .iter()
        .filter(|(_, task)| task.tags.iter().any(|t| t == tag))
        .map(|(task_id, _)| task_id.clone())
        .collect();
    selected.sort_by_key(|task_id| task_sort_key(task_id, &registry[task_id]));

    let (mut fast, rest): (Vec<String>, Vec<String>) = selected
        .into_iter()
        .partition(|task_id| registry[task_id].tags.iter().any(|t| t == FAST_SMOKE_TAG));
    fast.extend(rest);
    Ok(fast)
}

/// Failure taxonomy for one evaluated run.
pub fn evaluate_run(run_result: &Value, metrics_result: &Value) -> Vec<String> {
    let mut failures = Vec::new();

    if !run_result.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
        failures.push("run_failed".to_string());
    }

    if let Some(invariants) = metrics_result.get("invariants").and_then(|v| v.as_array()) {
        for inv in invariants {
            if inv.get("ok").and_then(|v| v.as_bool()) == Some(false) {
                let name = inv.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
                failures.push(format!("invariant:{name}"));
            }
        }
    }

    let truncated = metrics_result
        .get("metrics_summary")
        .and_then(|v| v.get("telemetry.truncated"))
        .and_then(|v| v.as_f64());
    match truncated {
        None => failures.push("telemetry.truncated_missing".to_string()),
        Some(value) if value != 0.0 => failures.push(format!("telemetry.truncated:{value}")),
        Some(_) => {}
    }

    let bank_required = run_result
        .get("bank_required")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());
    if bank_required.is_some() {
        let bank_pass = run_result
            .get("bank_status")
            .and_then(|v| v.get("status"))
            .and_then(|v| v.as_str())
            == Some("PASS");
        if !bank_pass {
            failures.push("bank_failed".to_string());
        }
    }

    failures
}

/// Top-N metric deltas by absolute movement against the previous run.
pub fn compute_top_deltas(
    prev_metrics: &Value,
    curr_metrics: &BTreeMap<String, Value>,
    limit: usize,
) -> Vec<TopDelta> {
    let empty = serde_json::Map::new();
    let prev = prev_metrics.as_object().unwrap_or(&empty);
    let mut deltas: Vec<TopDelta> = curr_metrics
        .iter()
        .filter_map(|(key, current)| {
            let current = current.as_f64()?;
            let previous = prev.get(key)?.as_f64()?;
            Some(TopDelta {
                key: key.clone(),
                previous,
                current,
                delta: current - previous,
            })
        })
        .collect();
    deltas.sort_by(|a, b| {
        b.delta
            .abs()
            .partial_cmp(&a.delta.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    deltas.truncate(limit);
    deltas
}

/// Whether a gate task's most recent run lets the cycle skip re-running it.
pub fn gate_run_is_fresh(result: &Value, gate_hours: f64, now: chrono::DateTime<chrono::Utc>) -> bool {
    let Some(ended) = result
        .get("ended_utc")
        .and_then(|v| v.as_str())
        .and_then(parse_utc)
    else {
        return false;
    };
    let age_hours = (now - ended).num_seconds() as f64 / 3600.0;
    if age_hours > gate_hours {
        return false;
    }
    if result.get("exit_code").and_then(|v| v.as_i64()) != Some(0) {
        return false;
    }
    result
        .get("bank_status")
        .and_then(|v| v.get("status"))
        .and_then(|v| v.as_str())
        == Some("PASS")
}

fn load_run_result(paths: &Paths, run_id: &str) -> Option<Value> {
    let text = fs::read_to_string(paths.run_dir(run_id).join("result.json")).ok()?;
    serde_json::from_str(&text).ok()
}

/// Run one nightly cycle. Returns the summary and the process exit code.
pub fn run_nightly(paths: &Paths, options: &NightlyOptions) -> (NightlySummary, i32) {
    if check_nightly_lock(paths, NIGHTLY_SESSION_TTL_SEC) {
        let summary = NightlySummary::skipped(&options.tag, "nightly_lock");
        write_summary(options, &summary);
        return (summary, 0);
    }
    if let Some(lock_path) = check_build_lock(paths) {
        tracing::info!(lock = %lock_path.display(), "nightly skipped: build locked");
        let summary = NightlySummary::skipped(&options.tag, "build_lock");
        write_summary(options, &summary);
        return (summary, 0);
    }

    let claim = claim_session_lock(paths, NIGHTLY_SESSION_TTL_SEC, "nightly", None);
    if !claim.acquired {
        let summary = NightlySummary::skipped(&options.tag, "session_lock_held");
        write_summary(options, &summary);
        return (summary, 0);
    }
    let session_run_id = claim.lock.as_ref().map(|l| l.run_id.clone());
    claim_nightly_lock(paths);

    // Locks must come off on every exit path, panics included.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        run_nightly_locked(paths, options)
    }));

    release_session_lock(paths, session_run_id.as_deref());
    clear_nightly_lock(paths);

    let (summary, exit_code) = match outcome {
        Ok(result) => result,
        Err(_) => (
            NightlySummary::failed(&options.tag, "exception", None, options.tasks.clone()),
            1,
        ),
    };
    write_summary(options, &summary);
    (summary, exit_code)
}

fn run_nightly_locked(paths: &Paths, options: &NightlyOptions) -> (NightlySummary, i32) {
    let registry = match load_task_registry(&paths.tasks_registry_path()) {
        Ok(registry) => registry.tasks,
        Err(err) => {
            return (
                NightlySummary::failed(
                    &options.tag,
                    "tasks_missing",
                    Some(err.to_string()),
                    options.tasks.clone(),
                ),
                1,
            );
        }
    };

    let mut selected = match select_tasks(&registry, &options.tag, &options.tasks) {
        Ok(selected) => selected,
        Err(error) => {
            return (
                NightlySummary::failed(
                    &options.tag,
                    "invalid_tasks",
                    Some(error),
                    options.tasks.clone(),
                ),
                1,
            );
        }
    };
    if selected.is_empty() {
        return (
            NightlySummary::failed(&options.tag, "no_tasks", None, Vec::new()),
            1,
        );
    }

    let mut gate_tasks = Vec::new();
    if options.gate {
        selected.retain(|task_id| !GATE_TASK_IDS.contains(&task_id.as_str()));
        for gate_id in GATE_TASK_IDS {
            if !registry.contains_key(gate_id) {
                continue;
            }
            gate_tasks.push(gate_id.to_string());
            let previous = find_previous_run(paths, gate_id, "");
            let fresh = previous
                .as_ref()
                .map(|result| gate_run_is_fresh(result, options.gate_hours, chrono::Utc::now()))
                .unwrap_or(false);
            if fresh {
                tracing::info!(task = gate_id, "gate task fresh; skipping");
                continue;
            }
            tracing::info!(task = gate_id, "gate task stale; running");
            let outcome = run_task(
                paths,
                &RunTaskRequest {
                    task_id: gate_id.to_string(),
                    ..Default::default()
                },
            );
            if outcome.exit_code() != 0 {
                let mut summary = NightlySummary::failed(
                    &options.tag,
                    "gate_failed",
                    Some(format!("gate task {gate_id} failed")),
                    selected.clone(),
                );
                summary.gate_tasks = gate_tasks;
                return (summary, 1);
            }
        }
    }

    let _ = fs::create_dir_all(&options.artifact_dir);

    let mut runs = Vec::new();
    let mut overall_fail = false;

    for task_id in &selected {
        let outcome = run_task(
            paths,
            &RunTaskRequest {
                task_id: task_id.clone(),
                ..Default::default()
            },
        );
        let run_doc = outcome.to_document();
        let run_id = run_doc
            .get("run_id")
            .and_then(|v| v.as_str())
            .map(String::from);
        let seed_run_ids: Vec<String> = run_doc
            .get("seed_run_ids")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let evaluation_runs: Vec<String> = if seed_run_ids.is_empty() {
            run_id.iter().cloned().collect()
        } else {
            seed_run_ids.clone()
        };

        let mut failures = Vec::new();
        let mut metrics_summary: BTreeMap<String, Value> = run_doc
            .get("metrics_summary")
            .and_then(|v| v.as_object())
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        for eval_run_id in &evaluation_runs {
            let metrics_result = load_run_result(paths, eval_run_id).unwrap_or(Value::Null);
            failures.extend(evaluate_run(&run_doc, &metrics_result));
            if metrics_summary.is_empty() {
                if let Some(map) = metrics_result
                    .get("metrics_summary")
                    .and_then(|v| v.as_object())
                {
                    metrics_summary = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                }
            }
        }

        let mut unique_run_ids: Vec<String> = run_id.iter().cloned().collect();
        for seed_run_id in &seed_run_ids {
            if Some(seed_run_id) != run_id.as_ref() {
                unique_run_ids.push(seed_run_id.clone());
            }
        }
        let mut bundle_paths = Vec::new();
        for bundle_run_id in &unique_run_ids {
            match bundle_artifacts(paths, bundle_run_id) {
                Ok(bundle_path) => {
                    let file_name = bundle_path
                        .file_name()
                        .map(|n| n.to_os_string())
                        .unwrap_or_default();
                    let target = options.artifact_dir.join(file_name);
                    let final_path = if target != bundle_path {
                        match fs::copy(&bundle_path, &target) {
                            Ok(_) => target,
                            Err(_) => bundle_path,
                        }
                    } else {
                        bundle_path
                    };
                    bundle_paths.push(final_path.display().to_string());
                }
                Err(err) => {
                    tracing::warn!(run_id = %bundle_run_id, error = %err, "bundle failed");
                }
            }
        }

        let previous = run_id
            .as_deref()
            .and_then(|rid| find_previous_run(paths, task_id, rid));
        let previous_run_id = previous
            .as_ref()
            .and_then(|p| p.get("run_id"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let top_metric_deltas = previous
            .as_ref()
            .and_then(|p| p.get("metrics_summary").cloned())
            .map(|prev| compute_top_deltas(&prev, &metrics_summary, 5))
            .unwrap_or_default();

        if !failures.is_empty() {
            overall_fail = true;
        }

        runs.push(NightlyRunEntry {
            task_id: task_id.clone(),
            run_id,
            seed_run_ids,
            ok: run_doc.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            error_code: run_doc
                .get("error_code")
                .and_then(|v| v.as_str())
                .map(String::from),
            error: run_doc
                .get("error")
                .and_then(|v| v.as_str())
                .map(String::from),
            failures,
            previous_run_id,
            top_metric_deltas,
            bundle_paths,
        });
    }

    let summary = NightlySummary {
        ok: !overall_fail,
        skipped: false,
        reason: None,
        error: None,
        tag: options.tag.clone(),
        tasks: selected,
        gate_tasks,
        runs,
    };
    let exit_code = if overall_fail { 1 } else { 0 };
    (summary, exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(tags: Vec<&str>, order: Option<i64>) -> Task {
        serde_json::from_value(json!({
            "project": "puredots",
            "runner": "scenario_runner",
            "scenario_path": "scenarios/p0.json",
            "tick_budget": 100,
            "default_pack": "nightly-default",
            "metric_keys": ["m", "telemetry.truncated"],
            "tags": tags,
            "nightly_order": order
        }))
        .unwrap()
    }

    #[test]
    fn selection_sorts_by_order_then_id_and_hoists_fast_smoke() {
        let mut registry = BTreeMap::new();
        registry.insert("C".to_string(), task(vec!["nightly"], Some(5)));
        registry.insert("A".to_string(), task(vec!["nightly"], None));
        registry.insert("B".to_string(), task(vec!["nightly"], Some(5)));
        registry.insert("SMOKE".to_string(), task(vec!["nightly", "fast_smoke"], Some(50)));
        registry.insert("OTHER".to_string(), task(vec!["weekly"], Some(1)));

        let selected = select_tasks(&registry, "nightly", &[]).unwrap();
        assert_eq!(selected, vec!["SMOKE", "B", "C", "A"]);
    }

    #[test]
    fn explicit_selection_rejects_unknown_tasks() {
        let mut registry = BTreeMap::new();
        registry.insert("A".to_string(), task(vec!["nightly"], None));
        let err = select_tasks(&registry, "nightly", &["A".into(), "NOPE".into()]).unwrap_err();
        assert!(err.contains("NOPE"));
        let explicit = select_tasks(&registry, "nightly", &["A".into()]).unwrap();
        assert_eq!(explicit, vec!["A"]);
    }

    #[test]
    fn evaluate_run_collects_failure_taxonomy() {
        let run = json!({
            "ok": false,
            "bank_required": "B1",
            "bank_status": {"status": "FAIL"}
        });
        let metrics = json!({
            "invariants": [
                {"name": "telemetry.parse_errors", "ok": false},
                {"name": "telemetry.monotonic_tick", "ok": true}
            ],
            "metrics_summary": {"telemetry.truncated": 1}
        });
        let failures = evaluate_run(&run, &metrics);
        assert!(failures.contains(&"run_failed".to_string()));
        assert!(failures.contains(&"invariant:telemetry.parse_errors".to_string()));
        assert!(failures.contains(&"telemetry.truncated:1".to_string()));
        assert!(failures.contains(&"bank_failed".to_string()));
        assert!(!failures.iter().any(|f| f == "invariant:telemetry.monotonic_tick"));
    }

    #[test]
    fn evaluate_run_green_path_is_clean() {
        let run = json!({"ok": true});
        let metrics = json!({
            "invariants": [{"name": "telemetry.parse_errors", "ok": true}],
            "metrics_summary": {"telemetry.truncated": 0}
        });
        assert!(evaluate_run(&run, &metrics).is_empty());
    }

    #[test]
    fn top_deltas_rank_by_absolute_movement() {
        let prev = json!({"a": 10.0, "b": 100.0, "c": 5.0, "d": "text"});
        let mut curr = BTreeMap::new();
        curr.insert("a".to_string(), json!(11.0));
        curr.insert("b".to_string(), json!(50.0));
        curr.insert("c".to_string(), json!(5.0));
        curr.insert("missing".to_string(), json!(1.0));

        let deltas = compute_top_deltas(&prev, &curr, 2);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].key, "b");
        assert_eq!(deltas[0].delta, -50.0);
        assert_eq!(deltas[1].key, "a");
    }

    #[test]
    fn gate_freshness_requires_recent_pass() {
        let now = chrono::Utc::now();
        let fresh_stamp = (now - chrono::Duration::hours(1))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        let stale_stamp = (now - chrono::Duration::hours(48))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();

        let good = json!({
            "ended_utc": fresh_stamp,
            "exit_code": 0,
            "bank_status": {"status": "PASS"}
        });
        assert!(gate_run_is_fresh(&good, 12.0, now));

        let mut stale = good.clone();
        stale["ended_utc"] = json!(stale_stamp);
        assert!(!gate_run_is_fresh(&stale, 12.0, now));

        let mut bad_exit = good.clone();
        bad_exit["exit_code"] = json!(3);
        assert!(!gate_run_is_fresh(&bad_exit, 12.0, now));

        let mut bad_bank = good.clone();
        bad_bank["bank_status"] = json!({"status": "FAIL"});
        assert!(!gate_run_is_fresh(&bad_bank, 12.0, now));
    }

    #[test]
    fn nightly_skips_when_build_locked() {
        let temp = tempfile::tempdir().unwrap();
        let paths = Paths::with_roots(
            temp.path().join("tool"),
            temp.path().join("tri"),
            temp.path().join("state"),
        );
        fs::create_dir_all(paths.locks_dir()).unwrap();
        fs::write(paths.build_lock_path(), "x").unwrap();

        let options = NightlyOptions {
            summary_path: temp.path().join("nightly_summary.json"),
            artifact_dir: temp.path().join("nightly_artifacts"),
            ..Default::default()
        };
        let (summary, exit_code) = run_nightly(&paths, &options);
        assert_eq!(exit_code, 0);
        assert!(summary.skipped);
        assert_eq!(summary.reason.as_deref(), Some("build_lock"));
        assert!(options.summary_path.exists());
    }

    #[test]
    fn nightly_reports_missing_registry_and_releases_locks() {
        let temp = tempfile::tempdir().unwrap();
        let paths = Paths::with_roots(
            temp.path().join("tool"),
            temp.path().join("tri"),
            temp.path().join("state"),
        );
        let options = NightlyOptions {
            summary_path: temp.path().join("nightly_summary.json"),
            artifact_dir: temp.path().join("nightly_artifacts"),
            ..Default::default()
        };
        let (summary, exit_code) = run_nightly(&paths, &options);
        assert_eq!(exit_code, 1);
        assert!(!summary.ok);
        assert_eq!(summary.reason.as_deref(), Some("tasks_missing"));
        // Locks must be gone so the next cycle can start.
        assert!(!paths.session_lock_path().exists());
        assert!(!paths.nightly_lock_path().exists());
    }
}
