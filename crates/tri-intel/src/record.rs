// Record Ingestor
// Normalized run records from result bundles and diagnostics directories,
// with the closed validity taxonomy.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tri_types::utc_now;

use crate::bundle::{parse_telemetry_tail_metrics, telemetry_contains_key, BundleReader};
use crate::signals::{
    extract_bank_signal, extract_compilation_signals, extract_proof_lines, extract_stall_signals,
    normalize_bool, normalize_text, parse_smoke_summary, pick_headline, split_lines, BankSignal,
};

/// Optional log-template mining capability. Absent backends degrade to empty
/// template lists.
pub trait TemplateMiner {
    fn mine(&mut self, lines: &[String]) -> (Vec<String>, Vec<String>);
}

/// Derived evidence-completeness summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validity {
    pub status: String,
    pub invalid_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warning_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparability: Option<Value>,
    pub evidence: Value,
}

/// Normalized, append-only run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub record_id: String,
    pub created_utc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_zip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diag_dir: Option<String>,
    pub meta: Value,
    pub headline: String,
    pub raw_signature_string: String,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
    pub proof_lines: Vec<String>,
    pub template_ids: Vec<String>,
    pub template_texts: Vec<String>,
    pub metrics: Value,
    pub validity: Validity,
    #[serde(default)]
    pub questions: Option<Value>,
    #[serde(default)]
    pub bank: Option<BankSignal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<Value>,
    pub embed_text: String,
}

impl RunRecord {
    pub fn job_id(&self) -> Option<&str> {
        self.meta.get("job_id").and_then(|v| v.as_str())
    }

    /// Explain/questions file id: record_id for diag records, else job_id.
    pub fn explain_file_id(&self) -> String {
        if self.diag_dir.is_some() {
            return self.record_id.clone();
        }
        self.job_id()
            .map(String::from)
            .unwrap_or_else(|| self.record_id.clone())
    }
}

fn meta_str(meta: &Value, key: &str) -> Option<String> {
    meta.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Tallied operator-report summary consumed by scoreboards and validity.
pub fn summarize_operator_report(report: &Value) -> Option<Value> {
    let report = report.as_object()?;

    let mut required = json!({"pass": 0, "fail": 0, "unknown": 0, "total": 0});
    let mut optional = json!({"pass": 0, "fail": 0, "unknown": 0, "total": 0});
    let mut unknown_reason_counts: Map<String, Value> = Map::new();
    let mut failing_required_ids: Vec<String> = Vec::new();
    let mut unknown_required_ids: Vec<String> = Vec::new();
    let mut source = "operator_report".to_string();

    fn normalize_status(value: Option<&Value>) -> &'static str {
        let text = value
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match text.as_str() {
            "pass" | "passed" | "ok" | "success" | "true" => "pass",
            "fail" | "failed" | "error" | "false" => "fail",
            _ => "unknown",
        }
    }

    fn bump(bucket: &mut Value, field: &str) {
        if let Some(slot) = bucket.get_mut(field) {
            let next = slot.as_u64().unwrap_or(0) + 1;
            *slot = json!(next);
        }
    }

    let questions = report
        .get("questions")
        .or_else(|| report.get("required_questions"))
        .or_else(|| report.get("question_statuses"))
        .and_then(|v| v.as_array());

    if let Some(questions) = questions {
        for item in questions {
            let Some(item) = item.as_object() else {
                continue;
            };
            let is_required = item
                .get("required")
                .map(normalize_bool)
                .unwrap_or(false);
            let status = normalize_status(item.get("status"));
            let reason = item
                .get("unknown_reason")
                .or_else(|| item.get("reason"))
                .or_else(|| item.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let qid = item
                .get("id")
                .or_else(|| item.get("question_id"))
                .or_else(|| item.get("key"))
                .and_then(|v| v.as_str());

            let bucket = if is_required {
                &mut required
            } else {
                &mut optional
            };
            bump(bucket, "total");
            bump(bucket, status);
            if status == "unknown" {
                if !reason.is_empty() {
                    let next = unknown_reason_counts
                        .get(reason)
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0)
                        + 1;
                    unknown_reason_counts.insert(reason.to_string(), json!(next));
                }
                if is_required {
                    if let Some(qid) = qid {
                        unknown_required_ids.push(qid.to_string());
                    }
                }
            }
            if status == "fail" && is_required {
                if let Some(qid) = qid {
                    failing_required_ids.push(qid.to_string());
                }
            }
        }
    } else {
        source = "operator_report_missing_questions".to_string();
        for key in [
            "required_questions_unknown",
            "unknown_required_questions",
            "required_questions_missing",
            "required_questions_unanswered",
            "required_questions_unresolved",
        ] {
            if report.get(key).map(normalize_bool).unwrap_or(false) {
                bump(&mut required, "unknown");
                bump(&mut required, "total");
                unknown_reason_counts.insert(key.to_string(), json!(1));
            }
        }
    }

    let mut unknown_reasons: Vec<(String, u64)> = unknown_reason_counts
        .into_iter()
        .map(|(reason, count)| (reason, count.as_u64().unwrap_or(0)))
        .collect();
    unknown_reasons.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let unknown_reasons: Vec<Value> = unknown_reasons
        .into_iter()
        .take(5)
        .map(|(reason, count)| json!({"reason": reason, "count": count}))
        .collect();
    failing_required_ids.truncate(5);
    unknown_required_ids.truncate(5);

    Some(json!({
        "required": required,
        "optional": optional,
        "unknown_reasons": unknown_reasons,
        "failing_required_ids": failing_required_ids,
        "unknown_required_ids": unknown_required_ids,
        "source": source,
    }))
}

/// Build a run record from a result bundle (zip or extracted dir).
pub fn build_record_from_bundle(
    bundle_path: &Path,
    miner: Option<&mut dyn TemplateMiner>,
) -> Option<RunRecord> {
    let mut reader = BundleReader::open(bundle_path)?;

    let meta = reader.read_json("meta.json").unwrap_or(Value::Null);
    let watchdog = reader.read_json("out/watchdog.json").unwrap_or(Value::Null);
    let run_summary = reader
        .read_json("out/run_summary.json")
        .unwrap_or(Value::Null);
    let score = reader
        .read_json("out/polish_score_v0.json")
        .unwrap_or(Value::Null);
    let operator_report = reader
        .read_json_any(&["out/operator_report.json", "operator_report.json"])
        .unwrap_or(Value::Null);
    let questions_summary = summarize_operator_report(&operator_report);

    let artifact_paths = meta
        .get("artifact_paths")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    let has_watchdog = watchdog.is_object() && !watchdog.as_object().map(|m| m.is_empty()).unwrap_or(true);
    let has_run_summary =
        run_summary.is_object() && !run_summary.as_object().map(|m| m.is_empty()).unwrap_or(true);
    let has_goal_report = reader.has_entry("out/goal_report.json");

    let telemetry_summary = run_summary.get("telemetry_summary").cloned();
    let telemetry_events = telemetry_summary
        .as_ref()
        .and_then(|v| v.get("event_total"))
        .and_then(|v| v.as_u64());
    let telemetry_block = run_summary.get("telemetry");
    let telemetry_bytes = telemetry_block
        .and_then(|v| v.get("bytes_total"))
        .and_then(|v| v.as_u64());
    let telemetry_files = telemetry_block
        .and_then(|v| v.get("files"))
        .and_then(|v| v.as_u64());

    let telemetry_metrics = parse_telemetry_tail_metrics(&mut reader);
    let telemetry_truncated = telemetry_metrics
        .get("telemetry.truncated")
        .cloned()
        .or_else(|| telemetry_block.and_then(|v| v.get("truncated")).cloned())
        .or_else(|| run_summary.get("telemetry_truncated").cloned());

    let mut oracle_heartbeat_present = ["telemetry.heartbeat", "telemetry.oracle.heartbeat"]
        .iter()
        .any(|key| {
            telemetry_metrics
                .get(*key)
                .map(normalize_bool)
                .unwrap_or(false)
        });
    if !oracle_heartbeat_present {
        oracle_heartbeat_present = telemetry_contains_key(&mut reader, "telemetry.heartbeat")
            || telemetry_contains_key(&mut reader, "telemetry.oracle.heartbeat");
    }

    let mut invalid_reasons: Vec<String> = Vec::new();
    let mut push_reason = |reasons: &mut Vec<String>, reason: &str| {
        if !reasons.iter().any(|r| r == reason) {
            reasons.push(reason.to_string());
        }
    };

    if meta.as_object().map(|m| m.is_empty()).unwrap_or(true) {
        push_reason(&mut invalid_reasons, "meta_missing");
    }
    if !has_watchdog {
        push_reason(&mut invalid_reasons, "watchdog_missing");
    }
    if !has_run_summary {
        push_reason(&mut invalid_reasons, "run_summary_missing");
    }
    if telemetry_summary.is_none() {
        push_reason(&mut invalid_reasons, "telemetry_summary_missing");
    } else if telemetry_events.unwrap_or(0) == 0 {
        push_reason(&mut invalid_reasons, "telemetry_event_total_missing_or_zero");
    }
    if telemetry_truncated
        .as_ref()
        .map(normalize_bool)
        .unwrap_or(false)
    {
        push_reason(&mut invalid_reasons, "telemetry_truncated");
    }
    if !oracle_heartbeat_present {
        push_reason(&mut invalid_reasons, "telemetry_oracle_heartbeat_missing");
    }

    let invariants_present =
        artifact_paths.contains_key("invariants_json") || reader.has_entry("out/invariants.json");
    if !invariants_present {
        push_reason(&mut invalid_reasons, "invariants_missing");
    }

    if meta
        .get("repo_dirty_post")
        .map(normalize_bool)
        .unwrap_or(false)
    {
        push_reason(&mut invalid_reasons, "repo_dirty_post");
    }
    let manifest_drift = meta.get("manifest_drift").cloned();
    if manifest_drift
        .as_ref()
        .and_then(|v| v.get("detected"))
        .map(normalize_bool)
        .unwrap_or(false)
    {
        push_reason(&mut invalid_reasons, "manifest_drift");
    }

    if meta_str(&meta, "goal_id").is_some() && meta_str(&meta, "base_ref").is_none() {
        push_reason(&mut invalid_reasons, "base_ref_missing");
    }
    if meta_str(&meta, "scenario_id").is_none() && meta_str(&meta, "scenario_rel").is_none() {
        push_reason(&mut invalid_reasons, "scenario_missing");
    }

    let exit_reason = meta_str(&meta, "exit_reason");
    if exit_reason.as_deref() == Some("OK_WITH_WARNINGS")
        && meta_str(&meta, "original_exit_reason").as_deref() == Some("TEST_FAIL")
    {
        push_reason(&mut invalid_reasons, "required_questions_unknown");
    }
    if let Some(summary) = &questions_summary {
        let unknown = summary
            .get("required")
            .and_then(|v| v.get("unknown"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if unknown > 0 {
            push_reason(&mut invalid_reasons, "required_questions_unknown");
        }
    }

    let stdout_tail = tail_text_field(&watchdog, "stdout_tail");
    let stderr_tail = tail_text_field(&watchdog, "stderr_tail");
    let mut player_tail = reader.read_tail_text("out/player.log", 65_536);
    if player_tail.is_empty() {
        player_tail = reader.read_tail_text("player.log", 65_536);
    }

    let required_bank = meta_str(&meta, "required_bank")
        .or_else(|| meta_str(&run_summary, "required_bank"));
    let bank_info = extract_bank_signal(&player_tail);
    if required_bank.is_some() {
        if !bank_info.found {
            push_reason(&mut invalid_reasons, "bank_missing");
        } else if bank_info.status != "PASS" {
            push_reason(&mut invalid_reasons, "bank_fail");
        } else if bank_info
            .test_id
            .as_deref()
            .map(|id| Some(id) != required_bank.as_deref())
            .unwrap_or(false)
        {
            push_reason(&mut invalid_reasons, "bank_wrong_test");
        }
    }

    let validity_status = if !invalid_reasons.is_empty() {
        "INVALID"
    } else if exit_reason.as_deref() == Some("OK_WITH_WARNINGS") {
        "OK_WITH_WARNINGS"
    } else {
        "VALID"
    };

    let mut evidence = json!({
        "artifact_paths": artifact_paths.keys().collect::<Vec<_>>(),
        "telemetry_bytes": telemetry_bytes,
        "telemetry_events": telemetry_events,
        "telemetry_files": telemetry_files,
        "telemetry_truncated": telemetry_truncated,
        "oracle_heartbeat_present": oracle_heartbeat_present,
        "has_watchdog": has_watchdog,
        "has_run_summary": has_run_summary,
        "has_goal_report": has_goal_report,
        "repo_status_pre": meta.get("repo_status_pre").cloned().unwrap_or(Value::Null),
        "repo_status_post": meta.get("repo_status_post").cloned().unwrap_or(Value::Null),
    });
    if let Some(drift) = &manifest_drift {
        if drift.is_object() {
            evidence["manifest_drift"] = drift.clone();
        }
    }

    let validity = Validity {
        status: validity_status.to_string(),
        invalid_reasons,
        warning_reasons: Vec::new(),
        comparability: Some(json!({
            "scenario_id": meta_str(&meta, "scenario_id"),
            "scenario_rel": meta_str(&meta, "scenario_rel"),
            "seed": meta.get("seed").cloned().unwrap_or(Value::Null),
            "build_id": meta.get("build_id").cloned().unwrap_or(Value::Null),
            "commit": meta.get("commit").cloned().unwrap_or(Value::Null),
            "base_ref": meta_str(&meta, "base_ref"),
            "goal_id": meta_str(&meta, "goal_id"),
            "goal_spec": meta_str(&meta, "goal_spec"),
        })),
        evidence,
    };

    let stderr_lines = split_lines(&stderr_tail, 80);
    let stdout_lines = split_lines(&stdout_tail, 80);
    let player_lines = split_lines(&player_tail, 120);

    let mut proof_lines = extract_proof_lines(&player_tail, 10);
    if proof_lines.is_empty() {
        proof_lines = extract_proof_lines(&stderr_tail, 10);
    }
    let raw_signature = watchdog
        .get("raw_signature_string")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let headline = pick_headline(&stderr_lines, &raw_signature, exit_reason.as_deref());

    let (template_ids, template_texts) = match miner {
        Some(miner) => {
            let mut all_lines = stderr_lines.clone();
            all_lines.extend(stdout_lines.clone());
            all_lines.extend(player_lines);
            miner.mine(&all_lines)
        }
        None => (Vec::new(), Vec::new()),
    };
    let template_texts: Vec<String> = template_texts.into_iter().take(10).collect();

    let embed_text = build_embed_text(
        exit_reason.as_deref().unwrap_or(""),
        &headline,
        meta_str(&meta, "failure_signature").as_deref().unwrap_or(""),
        &proof_lines,
        &template_texts,
    );

    let record_id = meta_str(&meta, "job_id").unwrap_or_else(|| {
        bundle_path
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    });

    let meta_view = json!({
        "job_id": meta.get("job_id").cloned().unwrap_or(Value::Null),
        "build_id": meta.get("build_id").cloned().unwrap_or(Value::Null),
        "commit": meta.get("commit").cloned().unwrap_or(Value::Null),
        "scenario_id": meta.get("scenario_id").cloned().unwrap_or(Value::Null),
        "seed": meta.get("seed").cloned().unwrap_or(Value::Null),
        "exit_reason": meta.get("exit_reason").cloned().unwrap_or(Value::Null),
        "exit_code": meta.get("exit_code").cloned().unwrap_or(Value::Null),
        "failure_signature": meta.get("failure_signature").cloned().unwrap_or(Value::Null),
        "goal_id": meta.get("goal_id").cloned().unwrap_or(Value::Null),
        "goal_spec": meta.get("goal_spec").cloned().unwrap_or(Value::Null),
        "base_ref": meta.get("base_ref").cloned().unwrap_or(Value::Null),
        "required_bank": required_bank,
        "repo_dirty_post": meta.get("repo_dirty_post").cloned().unwrap_or(Value::Null),
        "manifest_drift": manifest_drift,
        "repo_status_pre": meta.get("repo_status_pre").cloned().unwrap_or(Value::Null),
        "repo_status_post": meta.get("repo_status_post").cloned().unwrap_or(Value::Null),
        "original_exit_reason": meta.get("original_exit_reason").cloned().unwrap_or(Value::Null),
        "original_exit_code": meta.get("original_exit_code").cloned().unwrap_or(Value::Null),
        "artifact_paths": Value::Object(artifact_paths),
    });

    Some(RunRecord {
        record_id,
        created_utc: utc_now(),
        result_zip: Some(bundle_path.display().to_string()),
        diag_dir: None,
        meta: meta_view,
        headline,
        raw_signature_string: raw_signature,
        stdout_tail: last_n(stdout_lines, 20),
        stderr_tail: last_n(stderr_lines, 20),
        proof_lines,
        template_ids,
        template_texts,
        metrics: json!({
            "determinism_hash": run_summary.get("determinism_hash").cloned().unwrap_or(Value::Null),
            "failing_invariants": run_summary.get("failing_invariants").cloned().unwrap_or(Value::Null),
            "telemetry_bytes": run_summary.get("telemetry_bytes").cloned().unwrap_or(Value::Null),
            "perf": run_summary.get("perf").cloned().unwrap_or(Value::Null),
            "grade": score.get("grade").cloned().unwrap_or(Value::Null),
            "total_loss": score.get("total_loss").cloned().unwrap_or(Value::Null),
        }),
        validity,
        questions: questions_summary,
        bank: Some(bank_info),
        signals: None,
        embed_text,
    })
}

fn tail_text_field(doc: &Value, field: &str) -> String {
    let raw = match doc.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    };
    normalize_text(&raw, 4000)
}

fn last_n(lines: Vec<String>, n: usize) -> Vec<String> {
    if lines.len() <= n {
        lines
    } else {
        lines[lines.len() - n..].to_vec()
    }
}

fn build_embed_text(
    exit_reason: &str,
    headline: &str,
    failure_signature: &str,
    proof_lines: &[String],
    template_texts: &[String],
) -> String {
    [
        exit_reason.to_string(),
        headline.to_string(),
        failure_signature.to_string(),
        proof_lines
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(" "),
        template_texts
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(" "),
    ]
    .join(" | ")
    .trim()
    .to_string()
}

static BUILD_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:artifact|result)_(?P<build_id>\d{8}_\d{6}_\d+_[0-9a-f]{8})")
        .expect("build id regex")
});

/// Build id encoded in an `artifact_*`/`result_*` entry name.
pub fn extract_build_id_from_filename(name: &str) -> Option<String> {
    BUILD_ID_RE
        .captures(name)
        .and_then(|caps| caps.name("build_id"))
        .map(|m| m.as_str().to_string())
}

/// Locate the artifact and result entries for a build id under results/.
/// Extracted directories win; zips are the older layout fallback.
fn pick_results_entries(
    results_dir: &Path,
    build_id: Option<&str>,
) -> (Option<PathBuf>, Option<PathBuf>, Vec<String>) {
    let mut artifact_entry = None;
    let mut result_entry = None;
    let mut all_build_ids = Vec::new();

    let Some(build_id) = build_id else {
        return (None, None, all_build_ids);
    };
    let Ok(read_dir) = fs::read_dir(results_dir) else {
        return (None, None, all_build_ids);
    };
    let mut entries: Vec<PathBuf> = read_dir.flatten().map(|e| e.path()).collect();
    entries.sort();

    for candidate in &entries {
        let name = candidate
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let Some(bid) = extract_build_id_from_filename(&name) else {
            continue;
        };
        if !all_build_ids.contains(&bid) {
            all_build_ids.push(bid.clone());
        }
        if bid != build_id {
            continue;
        }
        if name.starts_with("artifact_") && artifact_entry.is_none() && candidate.is_dir() {
            artifact_entry = Some(candidate.clone());
        }
        if name.starts_with("result_") && result_entry.is_none() && candidate.is_dir() {
            result_entry = Some(candidate.clone());
        }
    }
    // Zip fallback for older layouts.
    if artifact_entry.is_none() || result_entry.is_none() {
        for candidate in &entries {
            let name = candidate
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !name.ends_with(".zip") {
                continue;
            }
            let Some(bid) = extract_build_id_from_filename(&name) else {
                continue;
            };
            if bid != build_id {
                continue;
            }
            if name.starts_with("artifact_") && artifact_entry.is_none() {
                artifact_entry = Some(candidate.clone());
            }
            if name.starts_with("result_") && result_entry.is_none() {
                result_entry = Some(candidate.clone());
            }
        }
    }

    (artifact_entry, result_entry, all_build_ids)
}

fn read_text_file(path: &Path, max_bytes: usize) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let slice = if bytes.len() > max_bytes {
        &bytes[bytes.len() - max_bytes..]
    } else {
        &bytes[..]
    };
    String::from_utf8_lossy(slice).to_string()
}

fn pick_build_headline(
    smoke: &std::collections::BTreeMap<String, String>,
    compiler_samples: &[String],
    fallback_text: &str,
) -> String {
    if let Some(first) = smoke.get("build_first_error").filter(|s| !s.trim().is_empty()) {
        return first.trim().to_string();
    }
    for line in split_lines(fallback_text, 120) {
        let lowered = line.to_ascii_lowercase();
        if lowered.contains("error") || lowered.contains("exception") || lowered.contains("fatal") {
            return line.trim().to_string();
        }
    }
    if let Some(sample) = compiler_samples.last() {
        return sample.clone();
    }
    smoke
        .get("failure")
        .or_else(|| smoke.get("status"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

/// Build a run record from a buildbox diagnostics directory.
pub fn build_record_from_diag_dir(diag_dir: &Path) -> RunRecord {
    let smoke_text = read_text_file(&diag_dir.join("pipeline_smoke_summary_latest.md"), 262_144);
    let smoke = parse_smoke_summary(&smoke_text);

    let compiler_errors = read_text_file(&diag_dir.join("compiler_errors.txt"), 262_144);
    let build_error_summary = read_text_file(&diag_dir.join("build_error_summary.txt"), 262_144);
    let missing_scripts = read_text_file(&diag_dir.join("missing_scripts.txt"), 262_144);
    let pipeline_smoke_log = read_text_file(&diag_dir.join("pipeline_smoke.log"), 262_144);

    let build_id = smoke.get("build_id").cloned().filter(|s| !s.is_empty());
    let smoke_commit = smoke.get("commit").cloned().filter(|s| !s.is_empty());
    let smoke_scenario_id = smoke.get("scenario_id").cloned().filter(|s| !s.is_empty());
    let status = smoke.get("status").cloned().unwrap_or_default();
    let title = smoke.get("title").cloned().filter(|s| !s.is_empty());

    let results_dir = diag_dir.join("results");
    let (artifact_entry, result_entry, found_build_ids) =
        pick_results_entries(&results_dir, build_id.as_deref());

    let mut artifact_snippet = String::new();
    if let Some(entry) = &artifact_entry {
        if entry.is_dir() {
            artifact_snippet = read_text_file(&entry.join("logs/primary_error_snippet.txt"), 65_536);
            if artifact_snippet.is_empty() {
                artifact_snippet = read_text_file(&entry.join("logs/unity_build_tail.txt"), 65_536);
            }
        } else if let Some(mut reader) = BundleReader::open(entry) {
            artifact_snippet = reader.read_tail_text("logs/primary_error_snippet.txt", 65_536);
            if artifact_snippet.is_empty() {
                artifact_snippet = reader.read_tail_text("logs/unity_build_tail.txt", 65_536);
            }
        }
    }

    // A matching result entry adds telemetry/evidence signals.
    let mut meta = Value::Null;
    let mut watchdog = Value::Null;
    let mut run_summary = Value::Null;
    let mut telemetry_truncated: Option<Value> = None;
    let mut telemetry_events: Option<u64> = None;
    let mut telemetry_bytes: Option<u64> = None;
    if let Some(entry) = &result_entry {
        if let Some(mut reader) = BundleReader::open(entry) {
            meta = reader.read_json("meta.json").unwrap_or(Value::Null);
            watchdog = reader.read_json("out/watchdog.json").unwrap_or(Value::Null);
            run_summary = reader
                .read_json("out/run_summary.json")
                .unwrap_or(Value::Null);
            let telemetry_metrics = parse_telemetry_tail_metrics(&mut reader);
            telemetry_truncated = telemetry_metrics.get("telemetry.truncated").cloned();
        }
        if telemetry_truncated.is_none() {
            telemetry_truncated = run_summary
                .get("telemetry")
                .and_then(|v| v.get("truncated"))
                .cloned()
                .or_else(|| run_summary.get("telemetry_truncated").cloned());
        }
        telemetry_events = run_summary
            .get("telemetry_summary")
            .and_then(|v| v.get("event_total"))
            .and_then(|v| v.as_u64());
        telemetry_bytes = run_summary
            .get("telemetry_bytes")
            .and_then(|v| v.as_u64());
    }

    let mut meta_mismatch: Vec<String> = Vec::new();
    if result_entry.is_some() && meta.is_object() {
        let pairs: [(&str, Option<&String>); 3] = [
            ("build_id", build_id.as_ref()),
            ("commit", smoke_commit.as_ref()),
            ("scenario_id", smoke_scenario_id.as_ref()),
        ];
        for (field, expected) in pairs {
            let Some(expected) = expected else { continue };
            let Some(actual) = meta.get(field).and_then(|v| v.as_str()) else {
                continue;
            };
            if actual != expected {
                meta_mismatch.push(field.to_string());
            }
        }
    }

    let heartbeat_log = read_text_file(&diag_dir.join("logs/watchdog_heartbeat.log"), 262_144);
    let corpus = [
        smoke_text.trim(),
        build_error_summary.trim(),
        compiler_errors.trim(),
        missing_scripts.trim(),
        artifact_snippet.trim(),
        pipeline_smoke_log.trim(),
        heartbeat_log.trim(),
    ]
    .join("\n");
    let compiler_signals = extract_compilation_signals(&corpus);
    let stall_signals = extract_stall_signals(&corpus);

    static DIAG_RUN_ID_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"_(\d{6,})$").expect("diag run id regex"));
    let dir_name = diag_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let run_id = DIAG_RUN_ID_RE
        .captures(&dir_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    let mut invalid_reasons = Vec::new();
    let mut warning_reasons = Vec::new();
    if smoke.is_empty() {
        invalid_reasons.push("smoke_summary_missing".to_string());
    }
    if build_id.is_some() && artifact_entry.is_none() && results_dir.exists() {
        invalid_reasons.push("artifact_zip_missing_for_build_id".to_string());
    }
    if let Some(build_id) = &build_id {
        if found_build_ids.iter().any(|bid| bid != build_id) {
            warning_reasons.push("stale_mixed_results_present".to_string());
        }
    }
    if status.eq_ignore_ascii_case("SUCCESS") && result_entry.is_none() && results_dir.exists() {
        invalid_reasons.push("result_zip_missing_for_success".to_string());
    }
    if result_entry.is_some() {
        if meta.as_object().map(|m| m.is_empty()).unwrap_or(true) {
            invalid_reasons.push("meta_missing_in_result_zip".to_string());
        }
        if watchdog.as_object().map(|m| m.is_empty()).unwrap_or(true) {
            invalid_reasons.push("watchdog_missing_in_result_zip".to_string());
        }
        if run_summary.as_object().map(|m| m.is_empty()).unwrap_or(true) {
            invalid_reasons.push("run_summary_missing_in_result_zip".to_string());
        }
        if telemetry_events.unwrap_or(0) == 0 {
            warning_reasons.push("telemetry_event_total_missing_or_zero".to_string());
        }
        if telemetry_truncated
            .as_ref()
            .map(normalize_bool)
            .unwrap_or(false)
        {
            warning_reasons.push("telemetry_truncated".to_string());
        }
        if !meta_mismatch.is_empty() {
            let mut fields = meta_mismatch.clone();
            fields.sort();
            fields.dedup();
            warning_reasons.push(format!("meta_mismatch:{}", fields.join(",")));
        }
    }

    let validity_status = if !invalid_reasons.is_empty() {
        "INVALID"
    } else if !warning_reasons.is_empty() {
        "OK_WITH_WARNINGS"
    } else {
        "VALID"
    };

    let headline = pick_build_headline(
        &smoke,
        &compiler_signals.sample_lines,
        if !build_error_summary.trim().is_empty() {
            &build_error_summary
        } else if !artifact_snippet.trim().is_empty() {
            &artifact_snippet
        } else {
            &pipeline_smoke_log
        },
    );

    let embed_text = [
        "BUILD".to_string(),
        title.clone().unwrap_or_default(),
        status.clone(),
        smoke.get("failure").cloned().unwrap_or_default(),
        headline.clone(),
        compiler_signals.csharp_error_codes.join(" "),
        compiler_signals.burst_error_codes.join(" "),
        if stall_signals.has_beestall {
            "BeeStall".to_string()
        } else {
            String::new()
        },
        if stall_signals.has_hang_timeout {
            "HANG_TIMEOUT".to_string()
        } else {
            String::new()
        },
    ]
    .join(" | ")
    .trim()
    .to_string();

    let record_id = match &run_id {
        Some(run_id) => format!("diag_{run_id}"),
        None => format!("diag_{dir_name}"),
    };

    let mut sorted_build_ids = found_build_ids.clone();
    sorted_build_ids.sort();
    sorted_build_ids.dedup();
    sorted_build_ids.truncate(10);

    let validity = Validity {
        status: validity_status.to_string(),
        invalid_reasons,
        warning_reasons: warning_reasons.clone(),
        comparability: None,
        evidence: json!({
            "has_smoke_summary": !smoke_text.trim().is_empty(),
            "has_build_error_summary": !build_error_summary.trim().is_empty(),
            "has_compiler_errors": !compiler_errors.trim().is_empty(),
            "has_missing_scripts_report": !missing_scripts.trim().is_empty(),
            "artifact_zip_for_build_id": artifact_entry.as_ref().map(|p| p.display().to_string()),
            "result_zip_for_build_id": result_entry.as_ref().map(|p| p.display().to_string()),
            "results_build_ids": sorted_build_ids,
            "meta_mismatch": meta_mismatch,
            "telemetry_events": telemetry_events,
            "telemetry_bytes": telemetry_bytes,
            "telemetry_truncated": telemetry_truncated,
        }),
    };

    let telemetry_signal = if result_entry.is_some() {
        json!({
            "truncated": validity.evidence.get("telemetry_truncated").cloned().unwrap_or(Value::Null),
            "event_total": telemetry_events,
            "bytes": telemetry_bytes,
        })
    } else {
        json!({"present": false})
    };

    RunRecord {
        record_id,
        created_utc: utc_now(),
        result_zip: None,
        diag_dir: Some(diag_dir.display().to_string()),
        meta: json!({
            "job_id": run_id,
            "build_id": build_id,
            "title": title,
            "status": status,
            "failure": smoke.get("failure").cloned().filter(|s| !s.is_empty()),
            "build_first_error": smoke.get("build_first_error").cloned().filter(|s| !s.is_empty()),
        }),
        headline,
        raw_signature_string: String::new(),
        stdout_tail: last_n(split_lines(&pipeline_smoke_log, 60), 20),
        stderr_tail: last_n(
            split_lines(
                if !build_error_summary.trim().is_empty() {
                    &build_error_summary
                } else if !compiler_errors.trim().is_empty() {
                    &compiler_errors
                } else {
                    &artifact_snippet
                },
                60,
            ),
            20,
        ),
        proof_lines: Vec::new(),
        template_ids: Vec::new(),
        template_texts: Vec::new(),
        metrics: json!({}),
        validity,
        questions: None,
        bank: None,
        signals: Some(json!({
            "compilation": compiler_signals,
            "stall": stall_signals,
            "telemetry": telemetry_signal,
            "evidence": {
                "stale_mixed_results_present": warning_reasons
                    .iter()
                    .any(|r| r == "stale_mixed_results_present"),
                "artifact_zip_for_build_id_present": artifact_entry.is_some(),
                "result_zip_for_build_id_present": result_entry.is_some(),
            },
            "missing_scripts_text_present": !missing_scripts.trim().is_empty()
                && !missing_scripts.to_ascii_lowercase().contains("no missing script"),
        })),
        embed_text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_zip(dir: &Path, name: &str, members: &[(&str, String)]) -> PathBuf {
        let path = dir.join(name);
        let file = fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (member, body) in members {
            writer.start_file(*member, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn full_members() -> Vec<(&'static str, String)> {
        vec![
            (
                "meta.json",
                json!({
                    "job_id": "job1",
                    "build_id": "b1",
                    "commit": "abc",
                    "scenario_id": "p0",
                    "seed": 7,
                    "exit_reason": "OK",
                    "exit_code": 0,
                    "repo_status_pre": "clean",
                    "repo_status_post": "clean",
                    "artifact_paths": {"invariants_json": "out/invariants.json"}
                })
                .to_string(),
            ),
            (
                "out/watchdog.json",
                json!({
                    "stdout_tail": "all systems go",
                    "stderr_tail": "",
                    "raw_signature_string": ""
                })
                .to_string(),
            ),
            (
                "out/run_summary.json",
                json!({
                    "exit_reason": "OK",
                    "telemetry_summary": {"event_total": 12}
                })
                .to_string(),
            ),
            (
                "out/telemetry.ndjson",
                concat!(
                    "{\"type\":\"metric\",\"key\":\"telemetry.heartbeat\",\"value\":1}\n",
                    "{\"type\":\"metric\",\"key\":\"telemetry.truncated\",\"value\":0}\n"
                )
                .to_string(),
            ),
        ]
    }

    #[test]
    fn complete_bundle_is_valid() {
        let temp = tempfile::tempdir().unwrap();
        let path = make_zip(temp.path(), "result_full.zip", &full_members());
        let record = build_record_from_bundle(&path, None).unwrap();
        assert_eq!(record.record_id, "job1");
        assert_eq!(record.validity.status, "VALID");
        assert!(record.validity.invalid_reasons.is_empty());
        assert_eq!(record.explain_file_id(), "job1");
        assert!(record.embed_text.starts_with("OK |"));
        assert_eq!(record.meta["repo_status_pre"], json!("clean"));
        assert_eq!(record.meta["repo_status_post"], json!("clean"));
    }

    #[test]
    fn meta_only_bundle_is_invalid_with_missing_reasons() {
        let temp = tempfile::tempdir().unwrap();
        let path = make_zip(
            temp.path(),
            "result_meta_only.zip",
            &[(
                "meta.json",
                json!({"job_id": "job2", "scenario_id": "p0"}).to_string(),
            )],
        );
        let record = build_record_from_bundle(&path, None).unwrap();
        assert_eq!(record.validity.status, "INVALID");
        let reasons = &record.validity.invalid_reasons;
        assert!(reasons.contains(&"run_summary_missing".to_string()));
        assert!(reasons.contains(&"telemetry_summary_missing".to_string()));
        assert!(reasons.contains(&"watchdog_missing".to_string()));
        assert!(reasons.contains(&"invariants_missing".to_string()));
    }

    #[test]
    fn bank_rules_apply_when_required() {
        let temp = tempfile::tempdir().unwrap();
        let mut members = full_members();
        members[0] = (
            "meta.json",
            json!({
                "job_id": "job3",
                "scenario_id": "p0",
                "exit_reason": "OK",
                "required_bank": "B1",
                "artifact_paths": {"invariants_json": "x"}
            })
            .to_string(),
        );
        members.push(("out/player.log", "BANK:B2:PASS\n".to_string()));
        let path = make_zip(temp.path(), "result_bank.zip", &members);
        let record = build_record_from_bundle(&path, None).unwrap();
        assert!(record
            .validity
            .invalid_reasons
            .contains(&"bank_wrong_test".to_string()));
        assert_eq!(record.bank.as_ref().unwrap().status, "PASS");
    }

    #[test]
    fn questions_summary_counts_required_unknowns() {
        let report = json!({
            "questions": [
                {"id": "q1", "required": true, "status": "pass"},
                {"id": "q2", "required": true, "status": "fail"},
                {"id": "q3", "required": true, "status": "unknown", "reason": "no data"},
                {"id": "q4", "required": false, "status": "unknown"}
            ]
        });
        let summary = summarize_operator_report(&report).unwrap();
        assert_eq!(summary["required"]["total"], json!(3));
        assert_eq!(summary["required"]["fail"], json!(1));
        assert_eq!(summary["required"]["unknown"], json!(1));
        assert_eq!(summary["optional"]["unknown"], json!(1));
        assert_eq!(summary["failing_required_ids"], json!(["q2"]));
        assert_eq!(summary["unknown_required_ids"], json!(["q3"]));
    }

    #[test]
    fn build_id_filename_pattern() {
        assert_eq!(
            extract_build_id_from_filename("artifact_20260101_010101_7_deadbeef_rest"),
            Some("20260101_010101_7_deadbeef".to_string())
        );
        assert_eq!(
            extract_build_id_from_filename("result_20260101_010101_7_deadbeef.zip"),
            Some("20260101_010101_7_deadbeef".to_string())
        );
        assert!(extract_build_id_from_filename("other_thing.zip").is_none());
    }

    #[test]
    fn diag_dir_without_smoke_summary_is_invalid() {
        let temp = tempfile::tempdir().unwrap();
        let diag = temp.path().join("buildbox_diag_title_123456");
        fs::create_dir_all(&diag).unwrap();
        let record = build_record_from_diag_dir(&diag);
        assert_eq!(record.record_id, "diag_123456");
        assert_eq!(record.validity.status, "INVALID");
        assert!(record
            .validity
            .invalid_reasons
            .contains(&"smoke_summary_missing".to_string()));
        assert_eq!(record.explain_file_id(), "diag_123456");
    }

    #[test]
    fn diag_dir_with_compile_errors_classifies_compilation() {
        let temp = tempfile::tempdir().unwrap();
        let diag = temp.path().join("buildbox_diag_build_777777");
        fs::create_dir_all(&diag).unwrap();
        fs::write(
            diag.join("pipeline_smoke_summary_latest.md"),
            "* status: FAILED\n* build_id: 20260101_010101_7_deadbeef\n* failure: compile\n",
        )
        .unwrap();
        fs::write(
            diag.join("compiler_errors.txt"),
            "Assets/Foo.cs(1,1): error CS0246: type not found\n",
        )
        .unwrap();

        let record = build_record_from_diag_dir(&diag);
        let signals = record.signals.as_ref().unwrap();
        assert_eq!(signals["compilation"]["detected"], json!(true));
        assert_eq!(
            signals["compilation"]["csharp_error_codes"],
            json!(["CS0246"])
        );
        assert!(record.headline.contains("CS0246"));
        assert!(record.embed_text.starts_with("BUILD |"));
        // No results/ dir at all: absence is not an artifact-missing defect.
        assert!(!record
            .validity
            .invalid_reasons
            .contains(&"artifact_zip_missing_for_build_id".to_string()));
    }

    #[test]
    fn diag_success_without_result_entry_is_flagged() {
        let temp = tempfile::tempdir().unwrap();
        let diag = temp.path().join("buildbox_diag_build_888888");
        fs::create_dir_all(diag.join("results")).unwrap();
        fs::write(
            diag.join("pipeline_smoke_summary_latest.md"),
            "* status: SUCCESS\n* build_id: 20260101_010101_7_deadbeef\n",
        )
        .unwrap();
        let record = build_record_from_diag_dir(&diag);
        assert!(record
            .validity
            .invalid_reasons
            .contains(&"result_zip_missing_for_success".to_string()));
        assert!(record
            .validity
            .invalid_reasons
            .contains(&"artifact_zip_missing_for_build_id".to_string()));
    }
}
