// Goal Scorer
// Scores a result bundle 0-5 against a declarative goal spec. Each level
// requires every condition of the level below it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

/// Largest log tail inspected for regex proof (5 MiB).
const LOG_TAIL_MAX_BYTES: usize = 5 * 1024 * 1024;

fn load_json(path: &Path) -> Option<Value> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn read_tail(path: &Path, max_bytes: usize) -> String {
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

/// Event-type counts and last metric values from a telemetry stream.
fn collect_telemetry_signals(
    telemetry_path: &Path,
) -> (u64, BTreeMap<String, u64>, BTreeMap<String, Value>) {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut metric_last: BTreeMap<String, Value> = BTreeMap::new();
    let mut total = 0u64;

    let Ok(text) = fs::read_to_string(telemetry_path) else {
        return (total, counts, metric_last);
    };
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        total += 1;
        let Ok(obj) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let event_type = obj
            .get("type")
            .or_else(|| obj.get("event"))
            .or_else(|| obj.get("name"))
            .or_else(|| obj.get("event_type"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        *counts.entry(event_type.clone()).or_insert(0) += 1;

        if event_type.eq_ignore_ascii_case("metric") {
            let metric_name = obj
                .get("metric")
                .or_else(|| obj.get("name"))
                .or_else(|| obj.get("key"))
                .and_then(|v| v.as_str());
            if let (Some(name), Some(value)) = (metric_name, obj.get("value")) {
                metric_last.insert(name.to_string(), value.clone());
            }
        }
    }
    (total, counts, metric_last)
}

fn match_prefixes(
    counts: &BTreeMap<String, u64>,
    prefixes: &[String],
) -> Vec<(String, String, u64)> {
    let lowered: Vec<String> = prefixes
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.to_ascii_lowercase())
        .collect();
    let mut matches = Vec::new();
    for (event_type, count) in counts {
        let key = event_type.to_ascii_lowercase();
        if let Some(prefix) = lowered.iter().find(|prefix| key.starts_with(*prefix)) {
            matches.push((event_type.clone(), prefix.clone(), *count));
        }
    }
    matches
}

fn match_metric_prefixes(
    metric_last: &BTreeMap<String, Value>,
    prefixes: &[String],
) -> Vec<(String, String, Value)> {
    let lowered: Vec<String> = prefixes
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.to_ascii_lowercase())
        .collect();
    let mut matches = Vec::new();
    for (metric_name, value) in metric_last {
        let key = metric_name.to_ascii_lowercase();
        if let Some(prefix) = lowered.iter().find(|prefix| key.starts_with(*prefix)) {
            matches.push((metric_name.clone(), prefix.clone(), value.clone()));
        }
    }
    matches
}

fn scan_logs_for_regex(log_paths: &[PathBuf], patterns: &[String]) -> Vec<(String, String)> {
    let compiled: Vec<regex::Regex> = patterns
        .iter()
        .filter(|p| !p.is_empty())
        .filter_map(|pattern| {
            regex::RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .ok()
        })
        .collect();
    if compiled.is_empty() {
        return Vec::new();
    }
    let mut matches = Vec::new();
    for path in log_paths {
        let text = read_tail(path, LOG_TAIL_MAX_BYTES);
        if text.is_empty() {
            continue;
        }
        for regex in &compiled {
            if regex.is_match(&text) {
                matches.push((regex.as_str().to_string(), path.display().to_string()));
            }
        }
    }
    matches
}

fn operator_hints(
    operator_report: &Value,
    keywords: &[String],
    question_ids: &[String],
) -> Vec<Value> {
    let mut matches = Vec::new();
    let Some(report) = operator_report.as_object() else {
        return matches;
    };
    if !keywords.is_empty() {
        let blob = serde_json::to_string(report)
            .unwrap_or_default()
            .to_ascii_lowercase();
        for token in keywords {
            if !token.is_empty() && blob.contains(&token.to_ascii_lowercase()) {
                matches.push(json!({"keyword": token}));
            }
        }
    }
    if !question_ids.is_empty() {
        if let Some(questions) = report.get("questions").and_then(|v| v.as_array()) {
            for item in questions {
                let Some(qid) = item.get("id").and_then(|v| v.as_str()) else {
                    continue;
                };
                if question_ids.iter().any(|id| id == qid) {
                    matches.push(json!({"question_id": qid}));
                }
            }
        }
    }
    matches
}

fn str_list(spec: &Value, key: &str) -> Vec<String> {
    spec.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Score one extracted result bundle against a goal spec.
///
/// Levels: 1 run completed + telemetry summary; 2 events observed; 3 any
/// proof signal; 4 required-proof and thresholds hold; 5 delta criterion.
pub fn build_goal_report(
    result_root: &Path,
    goal_spec_path: Option<&Path>,
    goal_spec: Option<&Value>,
    run_summary: &Value,
    meta: &Value,
) -> Value {
    let out_dir = result_root.join("out");
    let goal_id = goal_spec
        .and_then(|spec| spec.get("goal_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown_goal")
        .to_string();
    let goal_version = goal_spec
        .and_then(|spec| spec.get("goal_version"))
        .and_then(|v| v.as_str())
        .unwrap_or("v0")
        .to_string();

    let mut proof: Vec<Value> = Vec::new();
    let mut notes: Vec<String> = Vec::new();
    let mut score = 0u32;

    let run_completed = meta.get("exit_reason").and_then(|v| v.as_str()).is_some()
        || run_summary.get("exit_reason").and_then(|v| v.as_str()).is_some();
    let telemetry_summary = run_summary.get("telemetry_summary").filter(|v| !v.is_null());

    let Some(goal_spec) = goal_spec else {
        notes.push("goal_spec missing; scorer skipped".to_string());
        return json!({
            "goal_id": goal_id,
            "goal_version": goal_version,
            "goal_status": "SKIPPED",
            "goal_score": 0,
            "proof": proof,
            "notes": notes,
            "run_refs": {
                "result_root": result_root.display().to_string(),
                "goal_spec": goal_spec_path.map(|p| p.display().to_string()),
            },
        });
    };

    if run_completed && telemetry_summary.is_some() {
        score = 1;
    } else {
        notes.push("run incomplete or telemetry_summary missing".to_string());
    }

    let event_total = telemetry_summary
        .and_then(|v| v.get("event_total"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    if score >= 1 && event_total > 0 {
        score = 2;
    } else if score >= 1 {
        notes.push("telemetry_summary.event_total missing or zero".to_string());
    }

    let proof_spec = goal_spec.get("proof").cloned().unwrap_or(Value::Null);
    let telemetry_prefixes = str_list(&proof_spec, "telemetry_event_prefixes");
    let log_regex = str_list(&proof_spec, "log_regex");
    let operator_contains = str_list(&proof_spec, "operator_contains");
    let operator_question_ids = str_list(&proof_spec, "operator_question_ids");
    let metric_keys = str_list(&proof_spec, "metric_keys");
    let metric_prefixes = str_list(&proof_spec, "metric_prefixes");

    let telemetry_path = out_dir.join("telemetry.ndjson");
    let (_, telemetry_counts, metric_last) = collect_telemetry_signals(&telemetry_path);

    let telemetry_matches = match_prefixes(&telemetry_counts, &telemetry_prefixes);
    for (event_type, prefix, count) in &telemetry_matches {
        proof.push(json!({
            "type": "telemetry",
            "event_type": event_type,
            "prefix": prefix,
            "count": count,
        }));
    }

    let mut metric_matches: Vec<Value> = Vec::new();
    let mut seen_metrics: Vec<String> = Vec::new();
    for metric_name in &metric_keys {
        if let Some(value) = metric_last.get(metric_name) {
            metric_matches.push(json!({"metric": metric_name, "value": value}));
            seen_metrics.push(metric_name.clone());
        }
    }
    for (metric_name, prefix, value) in match_metric_prefixes(&metric_last, &metric_prefixes) {
        if !seen_metrics.contains(&metric_name) {
            metric_matches.push(json!({"metric": metric_name, "value": value, "prefix": prefix}));
            seen_metrics.push(metric_name);
        }
    }
    for entry in &metric_matches {
        proof.push(json!({
            "type": "metric",
            "metric": entry.get("metric"),
            "value": entry.get("value"),
            "ok": true,
        }));
    }

    let log_paths = vec![
        out_dir.join("player.log"),
        out_dir.join("stdout.log"),
        out_dir.join("stderr.log"),
    ];
    let log_matches = scan_logs_for_regex(&log_paths, &log_regex);
    for (pattern, file) in &log_matches {
        proof.push(json!({"type": "log", "regex": pattern, "file": file}));
    }

    let operator_report = load_json(&out_dir.join("operator_report.json")).unwrap_or(Value::Null);
    let operator_matches = operator_hints(&operator_report, &operator_contains, &operator_question_ids);
    for entry in &operator_matches {
        let mut tagged = entry.clone();
        if let Some(obj) = tagged.as_object_mut() {
            obj.insert("type".to_string(), json!("operator"));
        }
        proof.push(tagged);
    }

    let has_proof_signal = !telemetry_matches.is_empty()
        || !log_matches.is_empty()
        || !operator_matches.is_empty()
        || !metric_matches.is_empty();
    if score >= 2 && has_proof_signal {
        score = 3;
    } else if score >= 2 {
        notes.push("no proof signals detected".to_string());
    }

    let proof_flags: BTreeMap<&str, bool> = BTreeMap::from([
        ("telemetry", !telemetry_matches.is_empty()),
        ("log", !log_matches.is_empty()),
        ("operator", !operator_matches.is_empty()),
        ("metric", !metric_matches.is_empty()),
    ]);

    let mut thresholds_ok = true;
    if let Some(thresholds) = goal_spec.get("thresholds").and_then(|v| v.as_object()) {
        for (bound, is_max) in [("metric_max", true), ("metric_min", false)] {
            let Some(limits) = thresholds.get(bound).and_then(|v| v.as_object()) else {
                continue;
            };
            for (metric_name, limit) in limits {
                let value = metric_last.get(metric_name).cloned();
                let value_num = value.as_ref().and_then(|v| v.as_f64());
                let limit_num = limit.as_f64();
                let ok = match (value_num, limit_num) {
                    (Some(value), Some(limit)) => {
                        if is_max {
                            value <= limit
                        } else {
                            value >= limit
                        }
                    }
                    _ => false,
                };
                thresholds_ok = thresholds_ok && ok;
                let mut entry = json!({
                    "type": "metric",
                    "metric": metric_name,
                    "value": value,
                    "ok": ok,
                });
                entry[if is_max { "max" } else { "min" }] = limit.clone();
                proof.push(entry);
            }
        }
    }

    let required_spec = goal_spec.get("required");
    let mut required_met = match required_spec.and_then(|v| v.as_object()) {
        Some(spec) if spec.get("all_of").and_then(|v| v.as_array()).is_some() => spec
            .get("all_of")
            .and_then(|v| v.as_array())
            .map(|items| {
                items.iter().all(|item| {
                    item.as_str()
                        .map(|flag| *proof_flags.get(flag).unwrap_or(&false))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false),
        Some(spec) if spec.get("any_of").and_then(|v| v.as_array()).is_some() => spec
            .get("any_of")
            .and_then(|v| v.as_array())
            .map(|items| {
                items.iter().any(|item| {
                    item.as_str()
                        .map(|flag| *proof_flags.get(flag).unwrap_or(&false))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false),
        _ => has_proof_signal,
    };
    if required_met && !thresholds_ok {
        notes.push("thresholds not met".to_string());
    }
    required_met = required_met && thresholds_ok;

    if score >= 3 && required_met {
        score = 4;
    } else if score >= 3 {
        notes.push("required proof conditions not met".to_string());
    }

    let mut delta_met = false;
    if let Some(delta_spec) = goal_spec.get("delta").and_then(|v| v.as_object()) {
        let prefix = delta_spec
            .get("telemetry_event_prefix")
            .and_then(|v| v.as_str());
        let min_count = delta_spec.get("min_count").and_then(|v| v.as_u64());
        if let (Some(prefix), Some(min_count)) = (prefix, min_count) {
            let matches = match_prefixes(&telemetry_counts, &[prefix.to_string()]);
            let count: u64 = matches.iter().map(|(_, _, count)| count).sum();
            delta_met = count >= min_count;
            proof.push(json!({
                "type": "delta",
                "telemetry_event_prefix": prefix,
                "count": count,
                "min_count": min_count,
            }));
        }
    }
    if score >= 4 && delta_met {
        score = 5;
    }

    let status = if score >= 4 {
        "PASS"
    } else if run_completed {
        "FAIL"
    } else {
        "UNKNOWN"
    };

    json!({
        "goal_id": goal_id,
        "goal_version": goal_version,
        "goal_status": status,
        "goal_score": score,
        "proof": proof,
        "notes": notes,
        "run_refs": {
            "job_id": meta.get("job_id").cloned().unwrap_or(Value::Null),
            "build_id": meta.get("build_id").cloned().unwrap_or(Value::Null),
            "commit": meta.get("commit").cloned().unwrap_or(Value::Null),
            "scenario_id": meta.get("scenario_id").cloned().unwrap_or(Value::Null),
            "seed": meta.get("seed").cloned().unwrap_or(Value::Null),
            "result_root": result_root.display().to_string(),
            "run_summary_path": out_dir.join("run_summary.json").display().to_string(),
            "meta_path": result_root.join("meta.json").display().to_string(),
            "goal_spec": goal_spec_path.map(|p| p.display().to_string()),
        },
    })
}

/// Score a result root and write `out/goal_report.json`.
pub fn score_goal(result_root: &Path, goal_spec_path: &Path) -> std::io::Result<Value> {
    let out_dir = result_root.join("out");
    let meta = load_json(&result_root.join("meta.json")).unwrap_or_else(|| json!({}));
    let run_summary = load_json(&out_dir.join("run_summary.json")).unwrap_or_else(|| json!({}));
    let goal_spec = load_json(goal_spec_path);

    let report = build_goal_report(
        result_root,
        goal_spec.as_ref().map(|_| goal_spec_path),
        goal_spec.as_ref(),
        &run_summary,
        &meta,
    );

    fs::create_dir_all(&out_dir)?;
    fs::write(
        out_dir.join("goal_report.json"),
        format!(
            "{}\n",
            serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
        ),
    )?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bundle(
        root: &Path,
        telemetry: &str,
        run_summary: Value,
        meta: Value,
    ) {
        let out = root.join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(root.join("meta.json"), meta.to_string()).unwrap();
        fs::write(out.join("run_summary.json"), run_summary.to_string()).unwrap();
        fs::write(out.join("telemetry.ndjson"), telemetry).unwrap();
    }

    fn spec() -> Value {
        json!({
            "goal_id": "g.rewind",
            "goal_version": "v1",
            "proof": {
                "telemetry_event_prefixes": ["rewind."],
                "metric_keys": ["timing.total_ms"]
            },
            "required": {"all_of": ["telemetry"]},
            "thresholds": {"metric_max": {"timing.total_ms": 100}},
            "delta": {"telemetry_event_prefix": "rewind.", "min_count": 2}
        })
    }

    const FULL_TELEMETRY: &str = concat!(
        "{\"type\":\"rewind.start\",\"tick\":1}\n",
        "{\"type\":\"rewind.apply\",\"tick\":2}\n",
        "{\"type\":\"metric\",\"metric\":\"timing.total_ms\",\"value\":42}\n",
    );

    #[test]
    fn full_evidence_scores_five() {
        let temp = tempfile::tempdir().unwrap();
        write_bundle(
            temp.path(),
            FULL_TELEMETRY,
            json!({"exit_reason": "OK", "telemetry_summary": {"event_total": 3}}),
            json!({"exit_reason": "OK", "job_id": "j1"}),
        );
        let spec = spec();
        let report = build_goal_report(
            temp.path(),
            None,
            Some(&spec),
            &load_json(&temp.path().join("out/run_summary.json")).unwrap(),
            &load_json(&temp.path().join("meta.json")).unwrap(),
        );
        assert_eq!(report["goal_score"], json!(5));
        assert_eq!(report["goal_status"], json!("PASS"));
    }

    #[test]
    fn threshold_violation_caps_at_three() {
        let temp = tempfile::tempdir().unwrap();
        let telemetry = concat!(
            "{\"type\":\"rewind.start\",\"tick\":1}\n",
            "{\"type\":\"metric\",\"metric\":\"timing.total_ms\",\"value\":500}\n",
        );
        write_bundle(
            temp.path(),
            telemetry,
            json!({"exit_reason": "OK", "telemetry_summary": {"event_total": 2}}),
            json!({"exit_reason": "OK"}),
        );
        let spec = spec();
        let report = build_goal_report(
            temp.path(),
            None,
            Some(&spec),
            &load_json(&temp.path().join("out/run_summary.json")).unwrap(),
            &load_json(&temp.path().join("meta.json")).unwrap(),
        );
        assert_eq!(report["goal_score"], json!(3));
        assert_eq!(report["goal_status"], json!("FAIL"));
        assert!(report["notes"]
            .as_array()
            .unwrap()
            .iter()
            .any(|n| n.as_str() == Some("thresholds not met")));
    }

    #[test]
    fn missing_telemetry_summary_scores_zero() {
        let temp = tempfile::tempdir().unwrap();
        write_bundle(
            temp.path(),
            "",
            json!({"exit_reason": "OK"}),
            json!({"exit_reason": "OK"}),
        );
        let spec = spec();
        let report = build_goal_report(
            temp.path(),
            None,
            Some(&spec),
            &load_json(&temp.path().join("out/run_summary.json")).unwrap(),
            &load_json(&temp.path().join("meta.json")).unwrap(),
        );
        assert_eq!(report["goal_score"], json!(0));
        assert_eq!(report["goal_status"], json!("FAIL"));
    }

    #[test]
    fn no_spec_skips() {
        let temp = tempfile::tempdir().unwrap();
        write_bundle(
            temp.path(),
            "",
            json!({"exit_reason": "OK"}),
            json!({"exit_reason": "OK"}),
        );
        let report = build_goal_report(
            temp.path(),
            None,
            None,
            &json!({"exit_reason": "OK"}),
            &json!({}),
        );
        assert_eq!(report["goal_status"], json!("SKIPPED"));
        assert_eq!(report["goal_score"], json!(0));
    }

    #[test]
    fn scores_are_monotonic_in_evidence() {
        // Each richer bundle must score at least as high as the poorer one.
        let spec = spec();
        let cases: Vec<(&str, Value)> = vec![
            ("", json!({"exit_reason": "OK"})),
            (
                "",
                json!({"exit_reason": "OK", "telemetry_summary": {"event_total": 0}}),
            ),
            (
                "{\"type\":\"other\"}\n",
                json!({"exit_reason": "OK", "telemetry_summary": {"event_total": 1}}),
            ),
            (
                FULL_TELEMETRY,
                json!({"exit_reason": "OK", "telemetry_summary": {"event_total": 3}}),
            ),
        ];
        let mut last_score = 0;
        for (telemetry, run_summary) in cases {
            let temp = tempfile::tempdir().unwrap();
            write_bundle(temp.path(), telemetry, run_summary, json!({"exit_reason": "OK"}));
            let report = build_goal_report(
                temp.path(),
                None,
                Some(&spec),
                &load_json(&temp.path().join("out/run_summary.json")).unwrap(),
                &load_json(&temp.path().join("meta.json")).unwrap(),
            );
            let score = report["goal_score"].as_u64().unwrap();
            assert!(score >= last_score, "score regressed: {score} < {last_score}");
            last_score = score;
        }
        assert_eq!(last_score, 5);
    }

    #[test]
    fn log_regex_and_operator_hints_count_as_proof() {
        let temp = tempfile::tempdir().unwrap();
        write_bundle(
            temp.path(),
            "{\"type\":\"other\"}\n",
            json!({"exit_reason": "OK", "telemetry_summary": {"event_total": 1}}),
            json!({"exit_reason": "OK"}),
        );
        fs::write(
            temp.path().join("out/player.log"),
            "frame 100\nRewind applied successfully\n",
        )
        .unwrap();
        fs::write(
            temp.path().join("out/operator_report.json"),
            json!({"questions": [{"id": "q.rewind", "status": "pass"}]}).to_string(),
        )
        .unwrap();

        let spec = json!({
            "goal_id": "g",
            "proof": {
                "log_regex": ["rewind applied"],
                "operator_question_ids": ["q.rewind"]
            },
            "required": {"any_of": ["log", "operator"]}
        });
        let report = build_goal_report(
            temp.path(),
            None,
            Some(&spec),
            &load_json(&temp.path().join("out/run_summary.json")).unwrap(),
            &load_json(&temp.path().join("meta.json")).unwrap(),
        );
        assert_eq!(report["goal_score"], json!(4));
        let proof = report["proof"].as_array().unwrap();
        assert!(proof.iter().any(|p| p["type"] == json!("log")));
        assert!(proof.iter().any(|p| p["type"] == json!("operator")));
    }

    #[test]
    fn score_goal_writes_report_file() {
        let temp = tempfile::tempdir().unwrap();
        write_bundle(
            temp.path(),
            FULL_TELEMETRY,
            json!({"exit_reason": "OK", "telemetry_summary": {"event_total": 3}}),
            json!({"exit_reason": "OK"}),
        );
        let spec_path = temp.path().join("goal.json");
        fs::write(&spec_path, spec().to_string()).unwrap();

        let report = score_goal(temp.path(), &spec_path).unwrap();
        assert_eq!(report["goal_status"], json!("PASS"));
        assert!(temp.path().join("out/goal_report.json").exists());
    }
}
