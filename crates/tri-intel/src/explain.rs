// Explain Pipeline
// Record ingestion, index maintenance, and per-run explain documents with
// graceful degradation when no embedding backend is present.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::embed::Embedder;
use crate::index::{FlatIndex, VectorIndex};
use crate::ledger::parse_ledger_entries;
use crate::record::{
    build_record_from_bundle, build_record_from_diag_dir, RunRecord, TemplateMiner,
};
use crate::store::{append_jsonl, file_key, read_jsonl, IntelPaths, ProcessedState};

/// Missing-evidence reasons that become the explain headline.
const MISSING_EVIDENCE_REASONS: [&str; 6] = [
    "meta_missing",
    "watchdog_missing",
    "run_summary_missing",
    "telemetry_summary_missing",
    "telemetry_event_total_missing_or_zero",
    "invariants_missing",
];

fn run_meta_entry(record: &RunRecord) -> Value {
    json!({
        "record_id": record.record_id,
        "job_id": record.meta.get("job_id").cloned().unwrap_or(Value::Null),
        "failure_signature": record.meta.get("failure_signature").cloned().unwrap_or(Value::Null),
        "exit_reason": record.meta.get("exit_reason").cloned().unwrap_or(Value::Null),
        "headline": record.headline,
        "result_zip": record.result_zip,
    })
}

/// Parse the ledger and (when an embedder is present) rebuild its index.
pub fn ingest_ledger(intel: &IntelPaths, embedder: &dyn Embedder) -> std::io::Result<usize> {
    intel.ensure_layout()?;
    let ledger_text = fs::read_to_string(&intel.ledger_path).unwrap_or_default();
    let entries = parse_ledger_entries(&ledger_text);

    let meta_path = intel.ledger_meta_path();
    fs::write(&meta_path, "")?;
    for entry in &entries {
        append_jsonl(&meta_path, entry)?;
    }

    let texts: Vec<String> = entries.iter().map(|entry| entry.embed_text()).collect();
    if let Some(embeddings) = embedder.encode(&texts) {
        if let Some(dim) = embeddings.first().map(|v| v.len()) {
            let mut index = FlatIndex::new(dim);
            if index.add(&embeddings).is_ok() {
                if let Err(err) = index.save(&intel.ledger_index_path()) {
                    tracing::warn!(error = %err, "failed to save ledger index");
                }
            }
        }
    }
    tracing::info!(entries = entries.len(), "ledger ingested");
    Ok(entries.len())
}

fn rebuild_runs_index(intel: &IntelPaths, embedder: &dyn Embedder) -> Option<FlatIndex> {
    let records: Vec<RunRecord> = read_jsonl(&intel.records_path());
    let mut texts = Vec::new();
    let mut meta_entries = Vec::new();
    for record in &records {
        if record.embed_text.is_empty() {
            continue;
        }
        texts.push(record.embed_text.clone());
        meta_entries.push(run_meta_entry(record));
    }
    let embeddings = embedder.encode(&texts)?;
    let dim = embeddings.first().map(|v| v.len())?;
    let mut index = FlatIndex::new(dim);
    index.add(&embeddings).ok()?;
    index.save(&intel.runs_index_path()).ok()?;

    let meta_path = intel.runs_meta_path();
    let _ = fs::write(&meta_path, "");
    for entry in &meta_entries {
        let _ = append_jsonl(&meta_path, entry);
    }
    Some(index)
}

/// Add one record to the runs index; first call rebuilds from records.jsonl.
pub fn update_runs_index(intel: &IntelPaths, embedder: &dyn Embedder, record: &RunRecord) {
    let index_path = intel.runs_index_path();
    let Ok(mut index) = FlatIndex::load(&index_path) else {
        rebuild_runs_index(intel, embedder);
        return;
    };

    if record.embed_text.is_empty() {
        return;
    }
    let Some(embeddings) = embedder.encode(std::slice::from_ref(&record.embed_text)) else {
        return;
    };
    if index.add(&embeddings).is_err() {
        return;
    }
    if let Err(err) = index.save(&index_path) {
        tracing::warn!(error = %err, "failed to save runs index");
        return;
    }
    let _ = append_jsonl(&intel.runs_meta_path(), &run_meta_entry(record));
}

fn search_with_meta(
    index_path: &Path,
    meta_path: &Path,
    query: &[f32],
    k: usize,
) -> Vec<Value> {
    let Ok(index) = FlatIndex::load(index_path) else {
        return Vec::new();
    };
    let meta_lines: Vec<Value> = read_jsonl(meta_path);
    index
        .search(query, k)
        .into_iter()
        .filter_map(|(row, score)| {
            let mut entry = meta_lines.get(row)?.clone();
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("score".to_string(), json!(score));
            }
            Some(entry)
        })
        .collect()
}

/// Build and write the explain (and questions) documents for one record.
pub fn build_explain(
    intel: &IntelPaths,
    embedder: &dyn Embedder,
    record: &RunRecord,
) -> std::io::Result<PathBuf> {
    intel.ensure_layout()?;

    let query = if record.embed_text.is_empty() {
        None
    } else {
        embedder
            .encode(std::slice::from_ref(&record.embed_text))
            .and_then(|mut vectors| vectors.pop())
    };

    let mut similar_runs = Vec::new();
    let mut similar_ledger = Vec::new();
    if let Some(query) = &query {
        similar_runs = search_with_meta(
            &intel.runs_index_path(),
            &intel.runs_meta_path(),
            query,
            5,
        );
        let own_job_id = record.meta.get("job_id").cloned().unwrap_or(Value::Null);
        similar_runs.retain(|run| run.get("job_id") != Some(&own_job_id));
        similar_ledger = search_with_meta(
            &intel.ledger_index_path(),
            &intel.ledger_meta_path(),
            query,
            3,
        );
    }

    let mut suggested_fix = Value::Null;
    let mut suggested_prevention = Value::Null;
    if let Some(top) = similar_ledger.first() {
        let score = top.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
        if score >= 0.6 {
            suggested_fix = top.get("fix").cloned().unwrap_or(Value::Null);
            suggested_prevention = top.get("prevention").cloned().unwrap_or(Value::Null);
        }
    }

    let mut explain = json!({
        "job_id": record.meta.get("job_id").cloned().unwrap_or(Value::Null),
        "build_id": record.meta.get("build_id").cloned().unwrap_or(Value::Null),
        "goal_id": record.meta.get("goal_id").cloned().unwrap_or(Value::Null),
        "exit_reason": record.meta.get("exit_reason").cloned().unwrap_or(Value::Null),
        "exit_code": record.meta.get("exit_code").cloned().unwrap_or(Value::Null),
        "failure_signature": record.meta.get("failure_signature").cloned().unwrap_or(Value::Null),
        "headline": record.headline,
        "similar_runs": similar_runs,
        "similar_ledger": similar_ledger,
        "suggested_fix": suggested_fix,
        "suggested_prevention": suggested_prevention,
    });

    if let Some(signals) = &record.signals {
        explain["signals"] = signals.clone();
    }

    explain["validity"] = serde_json::to_value(&record.validity).unwrap_or(Value::Null);
    let primary_issue = record
        .validity
        .invalid_reasons
        .iter()
        .find(|reason| MISSING_EVIDENCE_REASONS.contains(&reason.as_str()));
    if let Some(issue) = primary_issue {
        explain["primary_evidence_issue"] = json!(issue);
        explain["headline"] = json!(format!("EVIDENCE_INVALID:{issue}"));
    }
    if let Some(questions) = &record.questions {
        explain["questions"] = questions.clone();
    }
    if let Some(bank) = &record.bank {
        explain["bank"] = serde_json::to_value(bank).unwrap_or(Value::Null);
    }

    let file_id = record.explain_file_id();
    let explain_path = intel.reports_dir.join(format!("explain_{file_id}.json"));
    fs::write(
        &explain_path,
        format!(
            "{}\n",
            serde_json::to_string_pretty(&explain).unwrap_or_else(|_| "{}".to_string())
        ),
    )?;
    if let Some(questions) = &record.questions {
        let questions_path = intel.reports_dir.join(format!("questions_{file_id}.json"));
        fs::write(
            &questions_path,
            format!(
                "{}\n",
                serde_json::to_string_pretty(questions).unwrap_or_else(|_| "{}".to_string())
            ),
        )?;
    }
    Ok(explain_path)
}

fn ingest_record(
    intel: &IntelPaths,
    embedder: &dyn Embedder,
    record: &RunRecord,
) -> std::io::Result<PathBuf> {
    append_jsonl(&intel.records_path(), record)?;
    update_runs_index(intel, embedder, record);
    build_explain(intel, embedder, record)
}

/// Ingest one result bundle (zip or dir); None when already processed.
pub fn ingest_result_bundle(
    intel: &IntelPaths,
    embedder: &dyn Embedder,
    bundle_path: &Path,
    miner: Option<&mut dyn TemplateMiner>,
) -> std::io::Result<Option<PathBuf>> {
    intel.ensure_layout()?;
    let mut processed = ProcessedState::load(&intel.processed_path());
    let key = file_key(bundle_path)?;
    if processed.has(&key) {
        return Ok(None);
    }

    let Some(record) = build_record_from_bundle(bundle_path, miner) else {
        tracing::warn!(bundle = %bundle_path.display(), "unreadable result bundle");
        return Ok(None);
    };
    let explain_path = ingest_record(intel, embedder, &record)?;

    processed.put(key, ProcessedState::stamp("result_zip", bundle_path));
    processed.flush(&intel.processed_path())?;
    Ok(Some(explain_path))
}

/// Ingest one diagnostics directory; None when already processed.
pub fn ingest_diag_dir(
    intel: &IntelPaths,
    embedder: &dyn Embedder,
    diag_dir: &Path,
) -> std::io::Result<Option<PathBuf>> {
    intel.ensure_layout()?;
    let mut processed = ProcessedState::load(&intel.processed_path());
    let smoke_path = diag_dir.join("pipeline_smoke_summary_latest.md");
    let key_basis = if smoke_path.exists() {
        smoke_path
    } else {
        diag_dir.to_path_buf()
    };
    let key = format!("diag|{}", file_key(&key_basis)?);
    if processed.has(&key) {
        return Ok(None);
    }

    let record = build_record_from_diag_dir(diag_dir);
    let explain_path = ingest_record(intel, embedder, &record)?;

    processed.put(key, ProcessedState::stamp("diag_dir", diag_dir));
    processed.flush(&intel.processed_path())?;
    Ok(Some(explain_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::NullEmbedder;
    use std::io::Write;

    /// Deterministic embedder for tests: maps text length and first byte
    /// into a 2-d vector.
    struct StubEmbedder;

    impl Embedder for StubEmbedder {
        fn encode(&self, texts: &[String]) -> Option<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return None;
            }
            Some(
                texts
                    .iter()
                    .map(|text| {
                        let first = text.bytes().next().unwrap_or(0) as f32 / 255.0;
                        vec![first, 1.0]
                    })
                    .collect(),
            )
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    fn make_bundle(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let file = fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        writer.start_file("meta.json", options).unwrap();
        writer
            .write_all(
                json!({"job_id": name.trim_end_matches(".zip"), "scenario_id": "p0", "exit_reason": "TEST_FAIL"})
                    .to_string()
                    .as_bytes(),
            )
            .unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn ingestion_is_idempotent_per_file_identity() {
        let temp = tempfile::tempdir().unwrap();
        let intel = IntelPaths::with_root(temp.path().join("intel"));
        let embedder = NullEmbedder::new("test");
        let bundle = make_bundle(temp.path(), "result_a.zip");

        let first = ingest_result_bundle(&intel, &embedder, &bundle, None).unwrap();
        assert!(first.is_some());
        let second = ingest_result_bundle(&intel, &embedder, &bundle, None).unwrap();
        assert!(second.is_none());

        let records: Vec<Value> = read_jsonl(&intel.records_path());
        assert_eq!(records.len(), 1);
        assert!(first.unwrap().exists());
    }

    #[test]
    fn degraded_explain_has_empty_similarity() {
        let temp = tempfile::tempdir().unwrap();
        let intel = IntelPaths::with_root(temp.path().join("intel"));
        let embedder = NullEmbedder::new("no backend");
        let bundle = make_bundle(temp.path(), "result_b.zip");

        let explain_path = ingest_result_bundle(&intel, &embedder, &bundle, None)
            .unwrap()
            .unwrap();
        let explain: Value =
            serde_json::from_str(&fs::read_to_string(&explain_path).unwrap()).unwrap();
        assert_eq!(explain["similar_runs"], json!([]));
        assert_eq!(explain["similar_ledger"], json!([]));
        assert_eq!(explain["suggested_fix"], Value::Null);
        // Evidence failure is promoted into the headline.
        assert!(explain["headline"]
            .as_str()
            .unwrap()
            .starts_with("EVIDENCE_INVALID:"));
        assert!(explain["primary_evidence_issue"].is_string());
    }

    #[test]
    fn ledger_ingest_builds_meta_and_index() {
        let temp = tempfile::tempdir().unwrap();
        let intel = IntelPaths::with_root(temp.path().join("intel"));
        fs::create_dir_all(intel.ledger_path.parent().unwrap()).unwrap();
        fs::write(
            &intel.ledger_path,
            "ERR-0001 stall\n- Symptom: stuck\n- Fix: restart\n- Prevention: watchdog\n",
        )
        .unwrap();

        let embedder = StubEmbedder;
        let count = ingest_ledger(&intel, &embedder).unwrap();
        assert_eq!(count, 1);
        assert!(intel.ledger_index_path().exists());
        let meta: Vec<Value> = read_jsonl(&intel.ledger_meta_path());
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0]["fix"], json!("restart"));
    }

    #[test]
    fn similar_ledger_suggestions_attach_above_threshold() {
        let temp = tempfile::tempdir().unwrap();
        let intel = IntelPaths::with_root(temp.path().join("intel"));
        fs::create_dir_all(intel.ledger_path.parent().unwrap()).unwrap();
        fs::write(
            &intel.ledger_path,
            "ERR-0001 stall\n- Symptom: stuck\n- Fix: restart\n- Prevention: watchdog\n",
        )
        .unwrap();
        let embedder = StubEmbedder;
        ingest_ledger(&intel, &embedder).unwrap();

        let bundle = make_bundle(temp.path(), "result_c.zip");
        let explain_path = ingest_result_bundle(&intel, &embedder, &bundle, None)
            .unwrap()
            .unwrap();
        let explain: Value =
            serde_json::from_str(&fs::read_to_string(&explain_path).unwrap()).unwrap();
        // Stub vectors have inner product > 0.6 for any non-empty texts.
        assert_eq!(explain["suggested_fix"], json!("restart"));
        assert_eq!(explain["suggested_prevention"], json!("watchdog"));
        assert_eq!(explain["similar_ledger"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn runs_index_rebuilds_then_updates_incrementally() {
        let temp = tempfile::tempdir().unwrap();
        let intel = IntelPaths::with_root(temp.path().join("intel"));
        let embedder = StubEmbedder;

        let first = make_bundle(temp.path(), "result_r1.zip");
        ingest_result_bundle(&intel, &embedder, &first, None).unwrap();
        assert!(intel.runs_index_path().exists());
        let meta_after_first: Vec<Value> = read_jsonl(&intel.runs_meta_path());
        assert_eq!(meta_after_first.len(), 1);

        let second = make_bundle(temp.path(), "result_r2.zip");
        ingest_result_bundle(&intel, &embedder, &second, None).unwrap();
        let meta_after_second: Vec<Value> = read_jsonl(&intel.runs_meta_path());
        assert_eq!(meta_after_second.len(), 2);

        let index = FlatIndex::load(&intel.runs_index_path()).unwrap();
        assert_eq!(index.len(), 2);
    }
}
