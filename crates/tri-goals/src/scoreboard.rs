// Scoreboard
// Aggregates the last N result bundles with goal scores, explain joins,
// expected-jobs backfill, triage list, and the nightly headline.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use tri_types::parse_utc;

use crate::score::{build_goal_report, score_goal};

#[derive(Debug, Clone)]
pub struct ScoreboardOptions {
    pub results_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub intel_dir: PathBuf,
    pub goal_specs_dir: PathBuf,
    pub repo_root: PathBuf,
    pub limit: usize,
    pub pending_grace_sec: u64,
}

impl ScoreboardOptions {
    pub fn new(results_dir: PathBuf, reports_dir: PathBuf, intel_dir: PathBuf) -> Self {
        Self {
            goal_specs_dir: reports_dir.join("specs"),
            repo_root: PathBuf::from("."),
            results_dir,
            reports_dir,
            intel_dir,
            limit: 25,
            pending_grace_sec: 600,
        }
    }
}

/// Paths of the three written reports.
#[derive(Debug, Clone)]
pub struct ScoreboardOutput {
    pub scoreboard_path: PathBuf,
    pub triage_path: PathBuf,
    pub headline_path: PathBuf,
    pub scoreboard: Value,
}

fn load_json(path: &Path) -> Option<Value> {
    serde_json::from_str(&fs::read_to_string(path).ok()?).ok()
}

fn load_json_from_bundle(bundle: &Path, member: &str) -> Option<Value> {
    if bundle.is_dir() {
        return load_json(&bundle.join(member));
    }
    let file = fs::File::open(bundle).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    let mut entry = archive.by_name(member).ok()?;
    let mut text = String::new();
    std::io::Read::read_to_string(&mut entry, &mut text).ok()?;
    serde_json::from_str(&text).ok()
}

/// Resolve a goal spec: absolute/repo-relative value, else `<specs>/<id>.json`.
fn resolve_goal_spec_path(
    spec_value: Option<&str>,
    goal_id: Option<&str>,
    specs_dir: &Path,
    repo_root: &Path,
) -> Option<PathBuf> {
    if let Some(value) = spec_value.filter(|v| !v.is_empty()) {
        let candidate = Path::new(value);
        let candidate = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            repo_root.join(candidate)
        };
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    if let Some(goal_id) = goal_id.filter(|v| !v.is_empty()) {
        let candidate = specs_dir.join(format!("{goal_id}.json"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Run the scorer on a bundle, extracting zips to a temp root first.
fn score_bundle(bundle: &Path, goal_spec_path: &Path) -> Option<Value> {
    if bundle.is_dir() {
        return score_goal(bundle, goal_spec_path).ok();
    }
    let temp = tempfile::Builder::new().prefix("tri_goal_").tempdir().ok()?;
    let file = fs::File::open(bundle).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    archive.extract(temp.path()).ok()?;
    score_goal(temp.path(), goal_spec_path).ok()
}

/// Action hint from `{validity, bank_status, goal_score}`.
pub fn next_action(entry: &Value) -> String {
    let validity = entry.get("validity_status").and_then(|v| v.as_str());
    let reason = entry.get("validity_reason").and_then(|v| v.as_str());
    let goal_id = entry
        .get("goal_id")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown_goal");
    let score = entry.get("goal_score").and_then(|v| v.as_u64()).unwrap_or(0);
    let bank_status = entry.get("bank_status").and_then(|v| v.as_str());
    let bank_test_id = entry.get("bank_test_id").and_then(|v| v.as_str());

    if validity == Some("PENDING") {
        return "NEXT: wait for runner backlog (pending)".to_string();
    }
    if let Some(validity) = validity {
        if validity != "VALID" {
            let detail = reason.unwrap_or("invalid_evidence");
            return format!("NEXT: fix infra/instrumentation ({detail})");
        }
    }
    if matches!(bank_status, Some("FAIL") | Some("MISSING")) {
        let action = if bank_status == Some("FAIL") {
            "fix bank failure"
        } else {
            "add bank proof"
        };
        let suffix = bank_test_id
            .map(|id| format!(" ({id})"))
            .unwrap_or_default();
        return format!("NEXT: {action}{suffix}");
    }
    if score > 0 {
        return format!("NEXT: tune behavior for {goal_id} (score={score})");
    }
    format!("NEXT: tune behavior for {goal_id}")
}

fn load_expected_jobs(reports_dir: &Path) -> Vec<Value> {
    let Some(data) = load_json(&reports_dir.join("expected_jobs.json")) else {
        return Vec::new();
    };
    let jobs = match data {
        Value::Object(map) => map.get("jobs").cloned().unwrap_or(Value::Null),
        other => other,
    };
    jobs.as_array()
        .map(|items| items.iter().filter(|v| v.is_object()).cloned().collect())
        .unwrap_or_default()
}

fn reason_counts(reasons: &[String]) -> Vec<Value> {
    let mut counts: std::collections::BTreeMap<&str, u64> = std::collections::BTreeMap::new();
    for reason in reasons {
        *counts.entry(reason.as_str()).or_insert(0) += 1;
    }
    let mut entries: Vec<(&str, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    entries
        .into_iter()
        .map(|(reason, count)| json!({"reason": reason, "count": count}))
        .collect()
}

/// Build and write scoreboard.json, triage_next.md, and the dated headline.
pub fn build_scoreboard(options: &ScoreboardOptions) -> std::io::Result<ScoreboardOutput> {
    fs::create_dir_all(&options.reports_dir)?;

    // Last N result bundles by mtime, newest first.
    let mut bundles: Vec<(PathBuf, std::time::SystemTime)> = fs::read_dir(&options.results_dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .map(|n| {
                            let name = n.to_string_lossy();
                            name.starts_with("result_")
                                && (name.ends_with(".zip") || path.is_dir())
                        })
                        .unwrap_or(false)
                })
                .filter_map(|path| {
                    let mtime = fs::metadata(&path).ok()?.modified().ok()?;
                    Some((path, mtime))
                })
                .collect()
        })
        .unwrap_or_default();
    bundles.sort_by(|a, b| b.1.cmp(&a.1));
    bundles.truncate(options.limit);

    let mut entries: Vec<Value> = Vec::new();
    let mut triage: Vec<Value> = Vec::new();
    let mut invalid_reasons: Vec<String> = Vec::new();
    let mut required_fail_counts: std::collections::BTreeMap<String, u64> =
        std::collections::BTreeMap::new();

    for (bundle, _) in &bundles {
        let meta = load_json_from_bundle(bundle, "meta.json").unwrap_or_else(|| json!({}));
        let run_summary =
            load_json_from_bundle(bundle, "out/run_summary.json").unwrap_or_else(|| json!({}));
        let goal_spec_value = meta
            .get("goal_spec")
            .or_else(|| run_summary.get("goal_spec"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let mut goal_id = meta
            .get("goal_id")
            .or_else(|| run_summary.get("goal_id"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let job_id = meta.get("job_id").and_then(|v| v.as_str()).map(String::from);

        // Explain join.
        let mut explain = None;
        let mut explain_path = None;
        let mut explain_missing = false;
        if let Some(job_id) = &job_id {
            let candidate = options.intel_dir.join(format!("explain_{job_id}.json"));
            if candidate.is_file() {
                explain = load_json(&candidate);
                explain_path = Some(candidate);
            } else {
                explain_missing = true;
            }
        }

        let goal_spec_path = resolve_goal_spec_path(
            goal_spec_value.as_deref(),
            goal_id.as_deref(),
            &options.goal_specs_dir,
            &options.repo_root,
        );
        let goal_report = goal_spec_path
            .as_ref()
            .and_then(|spec_path| score_bundle(bundle, spec_path));

        let mut status = "SKIPPED".to_string();
        let mut score = 0u64;
        if let Some(report) = &goal_report {
            if let Some(s) = report.get("goal_status").and_then(|v| v.as_str()) {
                status = s.to_string();
            }
            score = report.get("goal_score").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(id) = report.get("goal_id").and_then(|v| v.as_str()) {
                goal_id = Some(id.to_string());
            }
        }

        let mut validity_status: Option<String> = None;
        let mut validity_reason: Option<String> = None;
        if explain_missing {
            validity_status = Some("MISSING_EXPLAIN".to_string());
            validity_reason = Some("missing_explain".to_string());
        } else if let Some(explain) = &explain {
            let validity = explain.get("validity");
            validity_status = validity
                .and_then(|v| v.get("status"))
                .and_then(|v| v.as_str())
                .map(String::from);
            validity_reason = validity
                .and_then(|v| v.get("invalid_reasons"))
                .and_then(|v| v.as_array())
                .and_then(|items| items.first())
                .and_then(|v| v.as_str())
                .map(String::from);
            if let Some(primary) = explain
                .get("primary_evidence_issue")
                .and_then(|v| v.as_str())
            {
                validity_reason = Some(primary.to_string());
            }
        }

        let question_summary = explain
            .as_ref()
            .and_then(|e| e.get("questions"))
            .filter(|v| v.is_object())
            .cloned();
        let bank_status = explain
            .as_ref()
            .and_then(|e| e.get("bank"))
            .and_then(|b| b.get("status"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let bank_test_id = explain
            .as_ref()
            .and_then(|e| e.get("bank"))
            .and_then(|b| b.get("test_id"))
            .and_then(|v| v.as_str())
            .map(String::from);

        if let Some(summary) = &question_summary {
            if let Some(ids) = summary.get("failing_required_ids").and_then(|v| v.as_array()) {
                for qid in ids.iter().filter_map(|v| v.as_str()) {
                    *required_fail_counts.entry(qid.to_string()).or_insert(0) += 1;
                }
            }
        }
        if let Some(reason) = &validity_reason {
            invalid_reasons.push(reason.clone());
        }

        let entry = json!({
            "result_zip": bundle.display().to_string(),
            "job_id": job_id,
            "build_id": meta.get("build_id").cloned().unwrap_or(Value::Null),
            "commit": meta.get("commit").cloned().unwrap_or(Value::Null),
            "scenario_id": meta.get("scenario_id").cloned().unwrap_or(Value::Null),
            "seed": meta.get("seed").cloned().unwrap_or(Value::Null),
            "exit_reason": meta.get("exit_reason").cloned().unwrap_or(Value::Null),
            "exit_code": meta.get("exit_code").cloned().unwrap_or(Value::Null),
            "goal_id": goal_id,
            "goal_status": status,
            "goal_score": score,
            "goal_spec": goal_spec_path.as_ref().map(|p| p.display().to_string()),
            "telemetry_event_total": run_summary
                .get("telemetry_summary")
                .and_then(|v| v.get("event_total"))
                .cloned()
                .unwrap_or(Value::Null),
            "validity_status": validity_status,
            "validity_reason": validity_reason,
            "explain_path": explain_path.as_ref().map(|p| p.display().to_string()),
            "question_summary": question_summary,
            "bank_status": bank_status,
            "bank_test_id": bank_test_id,
            "utc": meta.get("end_utc").or_else(|| meta.get("start_utc")).cloned().unwrap_or(Value::Null),
        });

        let invalid_evidence = matches!(
            entry.get("validity_status").and_then(|v| v.as_str()),
            Some("INVALID") | Some("MISSING_EXPLAIN")
        );
        if (status != "PASS" && status != "SKIPPED") || invalid_evidence {
            let mut note = goal_report
                .as_ref()
                .and_then(|r| r.get("notes"))
                .and_then(|n| n.as_array())
                .and_then(|items| items.first())
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_default();
            if invalid_evidence {
                if let Some(reason) = entry.get("validity_reason").and_then(|v| v.as_str()) {
                    note = reason.to_string();
                }
            }
            let note = if note.is_empty() {
                entry
                    .get("exit_reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            } else {
                note
            };
            triage.push(json!({
                "goal_id": entry.get("goal_id").cloned().unwrap_or(json!("unknown_goal")),
                "status": if invalid_evidence { json!("INVALID") } else { json!(status) },
                "score": score,
                "result_zip": bundle.display().to_string(),
                "note": note,
            }));
        }

        entries.push(entry);
    }

    append_expected_jobs(options, &bundles, &mut entries, &mut triage, &mut invalid_reasons);

    let top_invalid: Vec<Value> = reason_counts(&invalid_reasons).into_iter().take(5).collect();
    let mut top_failed_questions: Vec<(String, u64)> =
        required_fail_counts.into_iter().collect();
    top_failed_questions.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let top_failed_questions: Vec<Value> = top_failed_questions
        .into_iter()
        .take(5)
        .map(|(question_id, count)| json!({"question_id": question_id, "count": count}))
        .collect();

    let count_status = |status: &str| {
        entries
            .iter()
            .filter(|e| e.get("validity_status").and_then(|v| v.as_str()) == Some(status))
            .count()
    };
    let jobs_total = entries.len();
    let jobs_valid = count_status("VALID");
    let jobs_invalid = count_status("INVALID");
    let jobs_warn = count_status("OK_WITH_WARNINGS");

    let scoreboard = json!({
        "generated_at": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "limit": options.limit,
        "summary": {
            "jobs_total": jobs_total,
            "jobs_valid": jobs_valid,
            "jobs_invalid": jobs_invalid,
            "jobs_ok_with_warnings": jobs_warn,
            "top_invalid_reasons": top_invalid,
            "top_failed_questions_required": top_failed_questions,
        },
        "entries": entries,
    });

    tracing::info!(
        jobs_total,
        jobs_valid,
        jobs_invalid,
        "scoreboard assembled"
    );

    let scoreboard_path = options.reports_dir.join("scoreboard.json");
    fs::write(
        &scoreboard_path,
        format!(
            "{}\n",
            serde_json::to_string_pretty(&scoreboard).unwrap_or_else(|_| "{}".to_string())
        ),
    )?;

    let triage_path = options.reports_dir.join("triage_next.md");
    let triage_shown: Vec<&Value> = triage.iter().take(3).collect();
    let mut triage_md = String::from("# Triage Next\n\n");
    if triage_shown.is_empty() {
        triage_md.push_str("No failing goals in recent runs.\n");
    } else {
        for item in &triage_shown {
            triage_md.push_str(&format!(
                "- {} status={} score={} note={}\n  result={}\n",
                item["goal_id"].as_str().unwrap_or("unknown_goal"),
                item["status"].as_str().unwrap_or(""),
                item["score"],
                item["note"].as_str().unwrap_or(""),
                item["result_zip"].as_str().unwrap_or("(missing)"),
            ));
        }
    }
    fs::write(&triage_path, triage_md)?;

    let date = Utc::now().format("%Y%m%d").to_string();
    let headline_path = options
        .reports_dir
        .join(format!("nightly_headline_{date}.md"));
    fs::write(&headline_path, render_headline(&date, &scoreboard))?;

    Ok(ScoreboardOutput {
        scoreboard_path,
        triage_path,
        headline_path,
        scoreboard,
    })
}

fn append_expected_jobs(
    options: &ScoreboardOptions,
    bundles: &[(PathBuf, std::time::SystemTime)],
    entries: &mut Vec<Value>,
    triage: &mut Vec<Value>,
    invalid_reasons: &mut Vec<String>,
) {
    let expected_jobs = load_expected_jobs(&options.reports_dir);
    if expected_jobs.is_empty() {
        return;
    }
    let now = Utc::now();
    let existing_ids: Vec<String> = entries
        .iter()
        .filter_map(|e| e.get("job_id").and_then(|v| v.as_str()).map(String::from))
        .collect();
    let existing_prefixes: Vec<String> = bundles
        .iter()
        .filter_map(|(path, _)| {
            let name = path.file_name()?.to_string_lossy().to_string();
            name.strip_suffix(".zip").map(String::from)
        })
        .collect();

    for item in expected_jobs {
        let Some(job_id) = item.get("job_id").and_then(|v| v.as_str()) else {
            continue;
        };
        if existing_ids.iter().any(|id| id == job_id) {
            continue;
        }
        if let Some(prefix) = item.get("expected_result_prefix").and_then(|v| v.as_str()) {
            if existing_prefixes.iter().any(|p| p == prefix) {
                continue;
            }
        }
        let created = item
            .get("created_utc")
            .and_then(|v| v.as_str())
            .and_then(parse_utc);
        let age_ok = created
            .map(|t| (now - t).num_seconds() < options.pending_grace_sec as i64)
            .unwrap_or(false);
        let (validity_status, validity_reason, bank_status) = if age_ok {
            ("PENDING", "result_pending", "PENDING")
        } else {
            ("INVALID", "result_missing", "MISSING")
        };

        entries.push(json!({
            "result_zip": Value::Null,
            "job_id": job_id,
            "build_id": item.get("build_id").cloned().unwrap_or(Value::Null),
            "commit": item.get("commit").cloned().unwrap_or(Value::Null),
            "scenario_id": item.get("scenario_id").cloned().unwrap_or(Value::Null),
            "seed": item.get("seed").cloned().unwrap_or(Value::Null),
            "exit_reason": "RESULT_MISSING",
            "exit_code": Value::Null,
            "goal_id": item.get("goal_id").cloned().unwrap_or(Value::Null),
            "goal_status": "SKIPPED",
            "goal_score": 0,
            "goal_spec": item.get("goal_spec").cloned().unwrap_or(Value::Null),
            "telemetry_event_total": Value::Null,
            "validity_status": validity_status,
            "validity_reason": validity_reason,
            "explain_path": Value::Null,
            "question_summary": Value::Null,
            "bank_status": bank_status,
            "bank_test_id": Value::Null,
            "utc": item.get("created_utc").cloned().unwrap_or(Value::Null),
        }));
        if !age_ok {
            invalid_reasons.push("result_missing".to_string());
            triage.push(json!({
                "goal_id": item.get("goal_id").cloned().unwrap_or(json!("unknown_goal")),
                "status": "INVALID",
                "score": 0,
                "result_zip": "(missing)",
                "note": "result_missing",
            }));
        }
    }
}

fn render_headline(date: &str, scoreboard: &Value) -> String {
    let summary = &scoreboard["summary"];
    let mut out = format!("# Nightly Headline {date}\n\n");
    out.push_str(&format!(
        "- jobs_total={} jobs_valid={} jobs_invalid={} jobs_ok_with_warnings={}\n",
        summary["jobs_total"], summary["jobs_valid"], summary["jobs_invalid"],
        summary["jobs_ok_with_warnings"],
    ));
    if let Some(top) = summary["top_invalid_reasons"].as_array().filter(|a| !a.is_empty()) {
        let items: Vec<String> = top
            .iter()
            .map(|item| {
                format!(
                    "{}({})",
                    item["reason"].as_str().unwrap_or(""),
                    item["count"]
                )
            })
            .collect();
        out.push_str(&format!("- top_invalid_reasons: {}\n", items.join(", ")));
    }
    if let Some(top) = summary["top_failed_questions_required"]
        .as_array()
        .filter(|a| !a.is_empty())
    {
        let items: Vec<String> = top
            .iter()
            .map(|item| {
                format!(
                    "{}({})",
                    item["question_id"].as_str().unwrap_or(""),
                    item["count"]
                )
            })
            .collect();
        out.push_str(&format!(
            "- top_failed_required_questions: {}\n",
            items.join(", ")
        ));
    }

    out.push_str("\n## Jobs\n");
    for entry in scoreboard["entries"].as_array().into_iter().flatten() {
        let validity = entry
            .get("validity_status")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN");
        let reason = entry
            .get("validity_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let questions = entry.get("question_summary");
        let req = questions.and_then(|q| q.get("required"));
        let opt = questions.and_then(|q| q.get("optional"));
        let tally = |bucket: Option<&Value>, field: &str| {
            bucket
                .and_then(|b| b.get(field))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let bank_status = entry
            .get("bank_status")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN");
        let mut bank_line = format!("bank={bank_status}");
        if let Some(test_id) = entry.get("bank_test_id").and_then(|v| v.as_str()) {
            bank_line = format!("{bank_line} test_id={test_id}");
        }

        out.push('\n');
        out.push_str(&format!(
            "### {}\n",
            entry
                .get("job_id")
                .and_then(|v| v.as_str())
                .unwrap_or("(unknown)")
        ));
        out.push_str(&format!(
            "- goal={} scenario={} seed={}\n",
            entry.get("goal_id").and_then(|v| v.as_str()).unwrap_or("none"),
            entry
                .get("scenario_id")
                .and_then(|v| v.as_str())
                .unwrap_or("none"),
            entry.get("seed").cloned().unwrap_or(Value::Null),
        ));
        out.push_str(&format!("- validity={validity} {reason}\n"));
        out.push_str(&format!(
            "- oracle: req pass={} fail={} unknown={}; opt pass={} fail={} unknown={}\n",
            tally(req, "pass"),
            tally(req, "fail"),
            tally(req, "unknown"),
            tally(opt, "pass"),
            tally(opt, "fail"),
            tally(opt, "unknown"),
        ));
        out.push_str(&format!("- {bank_line}\n"));
        out.push_str(&format!(
            "- score={} status={}\n",
            entry.get("goal_score").cloned().unwrap_or(json!(0)),
            entry
                .get("goal_status")
                .and_then(|v| v.as_str())
                .unwrap_or("UNKNOWN"),
        ));
        out.push_str(&format!("- next: {}\n", next_action(entry)));
        out.push_str(&format!(
            "- result={}\n",
            entry
                .get("result_zip")
                .and_then(|v| v.as_str())
                .unwrap_or("(missing)"),
        ));
        if let Some(explain) = entry.get("explain_path").and_then(|v| v.as_str()) {
            out.push_str(&format!("- explain={explain}\n"));
        }
    }
    out
}
