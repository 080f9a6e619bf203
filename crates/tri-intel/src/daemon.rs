// Intel Daemon & Goal Cursor
// Directory-watching ingestion loop, round-robin goal selection, and the
// reward log.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde_json::{json, Value};
use tri_types::utc_now;

use crate::embed::Embedder;
use crate::explain::{ingest_diag_dir, ingest_ledger, ingest_result_bundle};
use crate::store::{append_jsonl, IntelPaths};

/// How often the ledger is re-ingested regardless of mtime (seconds).
const LEDGER_REFRESH_SEC: u64 = 300;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub results_dir: PathBuf,
    pub diag_root: Option<PathBuf>,
    pub poll_sec: u64,
    /// Bounded iteration count for tests; None polls forever.
    pub max_cycles: Option<u64>,
}

fn ledger_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok()?.modified().ok()
}

/// One polling pass over the results dir and the optional diag root.
fn poll_once(intel: &IntelPaths, embedder: &dyn Embedder, options: &DaemonOptions) {
    let mut bundles: Vec<PathBuf> = fs::read_dir(&options.results_dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    name.starts_with("result_")
                        && name.ends_with(".zip")
                        && !name.ends_with(".tmp")
                })
                .collect()
        })
        .unwrap_or_default();
    bundles.sort();
    for bundle in bundles {
        if let Err(err) = ingest_result_bundle(intel, embedder, &bundle, None) {
            tracing::warn!(bundle = %bundle.display(), error = %err, "bundle ingest failed");
        }
    }

    if let Some(diag_root) = &options.diag_root {
        let mut diag_dirs: Vec<PathBuf> = fs::read_dir(diag_root)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|entry| entry.path())
                    .filter(|path| path.is_dir())
                    .flat_map(|run_dir| {
                        fs::read_dir(run_dir)
                            .map(|inner| {
                                inner
                                    .flatten()
                                    .map(|entry| entry.path())
                                    .filter(|path| {
                                        path.is_dir()
                                            && path
                                                .file_name()
                                                .map(|n| {
                                                    n.to_string_lossy()
                                                        .starts_with("buildbox_diag_")
                                                })
                                                .unwrap_or(false)
                                    })
                                    .collect::<Vec<_>>()
                            })
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        diag_dirs.sort();
        for diag_dir in diag_dirs {
            if let Err(err) = ingest_diag_dir(intel, embedder, &diag_dir) {
                tracing::warn!(diag = %diag_dir.display(), error = %err, "diag ingest failed");
            }
        }
    }
}

/// Watch the results directory, ingesting new bundles as they land. The
/// ledger re-ingests on mtime change and on a fixed refresh deadline.
pub fn run_daemon(
    intel: &IntelPaths,
    embedder: &dyn Embedder,
    options: &DaemonOptions,
) -> std::io::Result<()> {
    intel.ensure_layout()?;
    let mut last_ledger_mtime: Option<SystemTime> = None;
    let mut ledger_refresh_deadline = SystemTime::now();
    let mut cycles = 0u64;

    loop {
        let mtime = ledger_mtime(&intel.ledger_path);
        let mtime_changed = mtime.is_some() && mtime != last_ledger_mtime;
        let deadline_hit = SystemTime::now() >= ledger_refresh_deadline;
        if mtime_changed || deadline_hit {
            if let Err(err) = ingest_ledger(intel, embedder) {
                tracing::warn!(error = %err, "ledger ingest failed");
            }
            last_ledger_mtime = mtime;
            ledger_refresh_deadline =
                SystemTime::now() + Duration::from_secs(LEDGER_REFRESH_SEC);
        }

        poll_once(intel, embedder, options);

        cycles += 1;
        if let Some(max) = options.max_cycles {
            if cycles >= max {
                return Ok(());
            }
        }
        std::thread::sleep(Duration::from_secs(options.poll_sec.max(1)));
    }
}

/// Round-robin goal selection over the plan's candidate list, persisted in
/// the goal cursor.
pub fn choose_goal(intel: &IntelPaths, plan_path: &Path, out_path: &Path) -> std::io::Result<Value> {
    intel.ensure_layout()?;
    let plan: Value = fs::read_to_string(plan_path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(Value::Null);

    let candidates: Vec<Value> = plan
        .get("concept_goals")
        .or_else(|| plan.get("goals"))
        .and_then(|v| v.as_array())
        .cloned()
        .or_else(|| {
            plan.get("concept_goal")
                .or_else(|| plan.get("goal"))
                .map(|goal| vec![goal.clone()])
        })
        .unwrap_or_default();

    let cursor_path = intel.goal_cursor_path();
    let mut cursor: Value = fs::read_to_string(&cursor_path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| json!({"index": 0}));

    let chosen = if candidates.is_empty() {
        plan.get("concept")
            .cloned()
            .unwrap_or_else(|| json!("default"))
    } else {
        let index = cursor.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize
            % candidates.len();
        cursor["index"] = json!(index as u64 + 1);
        fs::write(
            &cursor_path,
            serde_json::to_string_pretty(&cursor).unwrap_or_else(|_| "{}".to_string()),
        )?;
        candidates[index].clone()
    };

    let output = json!({
        "chosen_goal": chosen,
        "why": if candidates.is_empty() { "mvp_default" } else { "mvp_rotation" },
        "timestamp_utc": utc_now(),
    });
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(
        out_path,
        serde_json::to_string_pretty(&output).unwrap_or_else(|_| "{}".to_string()),
    )?;

    append_jsonl(
        &intel.actions_path(),
        &json!({
            "action_id": format!(
                "{}_{}",
                utc_now(),
                out_path.file_stem().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
            ),
            "timestamp_utc": utc_now(),
            "chosen_goal": output["chosen_goal"],
            "source_plan": plan_path.display().to_string(),
        }),
    )?;

    Ok(output)
}

/// Shaped reward from a cycle summary, appended to rewards.jsonl.
pub fn log_reward(intel: &IntelPaths, cycle_json_path: &Path) -> std::io::Result<f64> {
    intel.ensure_layout()?;
    let cycle: Value = fs::read_to_string(cycle_json_path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(Value::Null);

    let exit_code = cycle.get("exit_code").and_then(|v| v.as_i64());
    let exit_reason = cycle
        .get("exit_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_ascii_uppercase();
    let failure_signature = cycle.get("failure_signature").cloned().unwrap_or(Value::Null);
    let proof_present = ["proof", "evidence", "proof_lines"].iter().any(|key| {
        cycle
            .get(*key)
            .map(|v| match v {
                Value::Array(items) => !items.is_empty(),
                Value::String(s) => !s.is_empty(),
                Value::Null => false,
                _ => true,
            })
            .unwrap_or(false)
    });
    let new_signature = [
        "failure_signature_new",
        "is_new_signature",
        "new_failure_signature",
    ]
    .iter()
    .any(|key| {
        cycle
            .get(*key)
            .map(crate::signals::normalize_bool)
            .unwrap_or(false)
    });

    let mut reward = 0.0;
    if proof_present {
        reward += 1.0;
    }
    if exit_code == Some(0) {
        reward += 0.2;
    }
    if exit_reason.contains("INFRA_FAIL")
        || exit_reason.contains("CRASH")
        || exit_reason.contains("HANG_TIMEOUT")
    {
        reward -= 1.0;
    }
    if new_signature {
        reward -= 0.3;
    }

    append_jsonl(
        &intel.rewards_path(),
        &json!({
            "timestamp_utc": utc_now(),
            "cycle_json": cycle_json_path.display().to_string(),
            "exit_code": exit_code,
            "exit_reason": exit_reason,
            "failure_signature": failure_signature,
            "reward": reward,
        }),
    )?;

    Ok(reward)
}
