// Run Orchestrator
// Pre-checks, scenario seed override, child supervision, telemetry scan,
// outcome reduction, and result materialization.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tri_core::{check_build_lock, load_pack_registry, load_task_registry, Paths, RegistryError};
use tri_telemetry::{scan_telemetry, TelemetryScan};
use tri_types::{
    utc_now, AggregateResult, BankResult, ErrorCode, EvalMetrics, Pack, Project, RunResult,
    SeedPolicy, Task, SCHEMA_VERSION, TOOL_VERSION,
};

use crate::seeds::{check_seed_policy, collect_seed_metrics, resolve_seed_list};
use crate::supervise::supervise_child;

/// Inputs for one run_task invocation.
#[derive(Debug, Clone, Default)]
pub struct RunTaskRequest {
    pub task_id: String,
    pub seed: Option<u64>,
    pub seeds: Option<Vec<u64>>,
    pub pack: Option<String>,
}

/// What a run_task invocation produced.
#[derive(Debug)]
pub enum RunTaskOutcome {
    /// Pre-check failure; nothing ran. Maps to exit 2.
    Fatal {
        code: ErrorCode,
        error: String,
        run_id: Option<String>,
        extra: Map<String, Value>,
    },
    /// A single-seed run completed (ok or not). Exit 0 / 3.
    Single(Box<RunResult>),
    /// A seed-aggregate run completed. Exit 0 / 3.
    Aggregate(Box<AggregateResult>),
}

impl RunTaskOutcome {
    pub fn fatal(code: ErrorCode, error: impl Into<String>) -> Self {
        RunTaskOutcome::Fatal {
            code,
            error: error.into(),
            run_id: None,
            extra: Map::new(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunTaskOutcome::Fatal { .. } => 2,
            RunTaskOutcome::Single(result) => {
                if result.ok {
                    0
                } else {
                    3
                }
            }
            RunTaskOutcome::Aggregate(result) => {
                if result.ok {
                    0
                } else {
                    3
                }
            }
        }
    }

    /// Full result document for the stdout envelope.
    pub fn to_document(&self) -> Value {
        match self {
            RunTaskOutcome::Fatal {
                code,
                error,
                run_id,
                extra,
            } => {
                let mut doc = Map::new();
                doc.insert("ok".into(), Value::Bool(false));
                doc.insert(
                    "error_code".into(),
                    Value::String(code.as_str().to_string()),
                );
                doc.insert("error".into(), Value::String(error.clone()));
                doc.insert(
                    "run_id".into(),
                    run_id.clone().map(Value::String).unwrap_or(Value::Null),
                );
                for (key, value) in extra {
                    doc.insert(key.clone(), value.clone());
                }
                Value::Object(doc)
            }
            RunTaskOutcome::Single(result) => {
                serde_json::to_value(result.as_ref()).unwrap_or(Value::Null)
            }
            RunTaskOutcome::Aggregate(result) => {
                serde_json::to_value(result.as_ref()).unwrap_or(Value::Null)
            }
        }
    }
}

fn registry_fatal(err: RegistryError, missing_code: ErrorCode) -> RunTaskOutcome {
    match err {
        RegistryError::Missing(path) => {
            RunTaskOutcome::fatal(missing_code, format!("registry not found: {path}"))
        }
        other => RunTaskOutcome::fatal(ErrorCode::Exception, other.to_string()),
    }
}

/// Top-level run_task: lock check, seed resolution, single vs multi dispatch.
pub fn run_task(paths: &Paths, request: &RunTaskRequest) -> RunTaskOutcome {
    if let Some(lock_path) = check_build_lock(paths) {
        let mut outcome = RunTaskOutcome::fatal(
            ErrorCode::BuildLocked,
            format!("build lock present: {}", lock_path.display()),
        );
        if let RunTaskOutcome::Fatal { extra, .. } = &mut outcome {
            extra.insert(
                "lock_path".into(),
                Value::String(lock_path.display().to_string()),
            );
        }
        return outcome;
    }

    let tasks = match load_task_registry(&paths.tasks_registry_path()) {
        Ok(registry) => registry.tasks,
        Err(err) => return registry_fatal(err, ErrorCode::TasksMissing),
    };
    let Some(task) = tasks.get(&request.task_id) else {
        return RunTaskOutcome::fatal(
            ErrorCode::TaskNotFound,
            format!("task not found: {}", request.task_id),
        );
    };

    // ai_polish auto-multi: no explicit seed input and a well-formed default
    // seed set promotes the invocation to a seed-aggregate run.
    let auto_multi = request.seeds.is_none()
        && request.seed.is_none()
        && task.seed_policy == SeedPolicy::AiPolish
        && task.default_seeds.len() >= 3;
    let seed_list = if auto_multi {
        task.default_seeds.clone()
    } else {
        resolve_seed_list(task, request.seed, request.seeds.as_deref())
    };

    if let Err((code, error)) = check_seed_policy_for_request(task, request, auto_multi, &seed_list)
    {
        return RunTaskOutcome::fatal(code, error);
    }

    if (request.seeds.is_some() || auto_multi) && seed_list.len() > 1 {
        return run_task_multi(paths, &request.task_id, task, &seed_list, request.pack.as_deref());
    }

    let seed_value = seed_list.first().copied().or(request.seed);
    match run_single(paths, &request.task_id, seed_value, request.pack.as_deref()) {
        SingleOutcome::Fatal(outcome) => outcome,
        SingleOutcome::Completed(result) => RunTaskOutcome::Single(result),
    }
}

/// A single user seed under ai_polish is a targeted repro, not a policy
/// violation; the policy gates multi-seed evaluation only.
fn check_seed_policy_for_request(
    task: &Task,
    request: &RunTaskRequest,
    auto_multi: bool,
    seed_list: &[u64],
) -> Result<(), (ErrorCode, String)> {
    if request.seeds.is_none() && !auto_multi {
        return Ok(());
    }
    check_seed_policy(task, seed_list)
}

enum SingleOutcome {
    Fatal(RunTaskOutcome),
    Completed(Box<RunResult>),
}

fn run_single(
    paths: &Paths,
    task_id: &str,
    seed: Option<u64>,
    pack_name: Option<&str>,
) -> SingleOutcome {
    if !paths.is_tri_root_valid() {
        return SingleOutcome::Fatal(RunTaskOutcome::fatal(
            ErrorCode::TriRootInvalid,
            format!("TRI_ROOT invalid: {}", paths.tri_root.display()),
        ));
    }

    let tasks = match load_task_registry(&paths.tasks_registry_path()) {
        Ok(registry) => registry.tasks,
        Err(err) => return SingleOutcome::Fatal(registry_fatal(err, ErrorCode::TasksMissing)),
    };
    let packs = match load_pack_registry(&paths.packs_registry_path()) {
        Ok(registry) => registry.packs,
        Err(err) => return SingleOutcome::Fatal(registry_fatal(err, ErrorCode::PacksMissing)),
    };

    let Some(task) = tasks.get(task_id) else {
        return SingleOutcome::Fatal(RunTaskOutcome::fatal(
            ErrorCode::TaskNotFound,
            format!("task not found: {task_id}"),
        ));
    };

    let pack_name = pack_name
        .map(String::from)
        .or_else(|| Some(task.default_pack.clone()).filter(|p| !p.is_empty()))
        .unwrap_or_else(|| "nightly-default".to_string());
    let Some(pack) = packs.get(&pack_name) else {
        return SingleOutcome::Fatal(RunTaskOutcome::fatal(
            ErrorCode::PackNotFound,
            format!("pack not found: {pack_name}"),
        ));
    };

    let Some(binary) = find_binary(paths, task.project) else {
        return SingleOutcome::Fatal(RunTaskOutcome::fatal(
            ErrorCode::BinaryMissing,
            format!("binary not found for project {}", task.project),
        ));
    };
    ensure_executable(&binary);

    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let run_dir = paths.run_dir(&run_id);
    if let Err(err) = fs::create_dir_all(&run_dir) {
        return SingleOutcome::Fatal(RunTaskOutcome::fatal(
            ErrorCode::Exception,
            format!("failed to create run dir: {err}"),
        ));
    }

    let scenario_abs = paths.scenario_abs(&task.scenario_path);
    if !scenario_abs.exists() {
        let mut outcome = RunTaskOutcome::fatal(
            ErrorCode::ScenarioMissing,
            format!("scenario not found: {}", scenario_abs.display()),
        );
        if let RunTaskOutcome::Fatal { run_id: slot, .. } = &mut outcome {
            *slot = Some(run_id);
        }
        return SingleOutcome::Fatal(outcome);
    }

    let seed_requested = seed.or_else(|| task.default_seeds.first().copied());
    let (scenario_used, seed_effective) =
        override_seed_if_supported(&scenario_abs, &run_dir, seed_requested, task);

    let telemetry_path = run_dir.join("telemetry.ndjson");
    let stdout_path = run_dir.join("stdout.log");

    let env = compose_child_env(task, pack, &scenario_abs, &scenario_used, &telemetry_path);

    let started_utc = utc_now();
    tracing::info!(task = task_id, run_id = %run_id, pack = %pack_name, "run_task start");

    let supervised = supervise_child(
        &binary,
        &scenario_used,
        &env,
        &stdout_path,
        task.effective_timeout_s(),
    );
    let (exit_code, timed_out, bank_results, telemetry_out) = match supervised {
        Ok(outcome) => (
            outcome.exit_code,
            outcome.timed_out,
            outcome.bank_results,
            outcome.telemetry_out,
        ),
        Err(err) => {
            // Spawn failure is a run failure, not an infrastructure error:
            // the result file still gets written below.
            tracing::warn!(error = %err, "child spawn failed");
            let _ = fs::write(
                &stdout_path,
                format!("HEADLESSCTL: run failed {err}\n"),
            );
            (Some(1), false, Vec::new(), None)
        }
    };

    tracing::info!(run_id = %run_id, ?exit_code, "run_task finished");

    // The binary may have written telemetry to its own location; adopt it
    // when the canonical path is empty.
    if let Some(override_path) = &telemetry_out {
        if override_path != &telemetry_path
            && override_path.exists()
            && !telemetry_path.exists()
        {
            let _ = fs::copy(override_path, &telemetry_path);
        }
    }

    let telemetry_ok = telemetry_path.exists();
    let scan: Option<TelemetryScan> = if telemetry_ok {
        match scan_telemetry(&telemetry_path, &run_dir, pack.caps.as_ref()) {
            Ok(scan) => Some(scan),
            Err(err) => {
                tracing::warn!(error = %err, "telemetry scan failed");
                None
            }
        }
    } else {
        None
    };

    let compress = pack.compress_jsonl;
    let metrics_path = scan
        .as_ref()
        .map(|s| maybe_compress(&s.metrics_path, compress));
    let events_path = scan
        .as_ref()
        .map(|s| maybe_compress(&s.events_path, compress));
    let invariants_path = scan
        .as_ref()
        .map(|s| maybe_compress(&s.invariants_path, compress));

    let metrics_summary = scan.as_ref().map(|s| s.metrics_summary.clone()).unwrap_or_default();
    let metrics_stats = scan.as_ref().map(|s| s.metrics_stats.clone()).unwrap_or_default();
    let invariants = scan.as_ref().map(|s| s.invariants.clone()).unwrap_or_default();
    let seed_used = scan.as_ref().and_then(|s| s.seed_used);
    let scenario_id = scan.as_ref().and_then(|s| s.scenario_id.clone());

    let allow_exit_codes = task.effective_allow_exit_codes();
    let invariant_fail = invariants.iter().any(|inv| !inv.ok);
    let bank_required = task.required_bank.clone();
    let bank_status: Option<BankResult> = bank_required.as_ref().and_then(|required| {
        bank_results.iter().find(|bank| &bank.id == required).cloned()
    });
    let bank_ok = match &bank_required {
        Some(_) => bank_status.as_ref().map(|b| b.passed()).unwrap_or(false),
        None => true,
    };

    // Outcome reduction, first match wins.
    let mut ok = true;
    let mut error_code = ErrorCode::None;
    let mut error: Option<String> = None;
    let mut warnings: Vec<String> = Vec::new();

    if timed_out {
        ok = false;
        error_code = ErrorCode::Timeout;
        error = Some(format!("timeout_s={}", task.effective_timeout_s()));
    } else if exit_code.map(|code| !allow_exit_codes.contains(&code)).unwrap_or(false) {
        ok = false;
        error_code = ErrorCode::RunFailed;
        error = Some(format!("exit_code={}", exit_code.unwrap_or(-1)));
    } else if !telemetry_ok {
        ok = false;
        error_code = ErrorCode::TelemetryMissing;
        error = Some("telemetry output missing".to_string());
    } else if bank_required.is_some() && !bank_ok && task.bank_strict {
        ok = false;
        error_code = ErrorCode::BankFailed;
        error = Some(format!(
            "required bank {} not PASS",
            bank_required.as_deref().unwrap_or("")
        ));
    } else if invariant_fail {
        ok = false;
        error_code = ErrorCode::InvariantFailed;
        error = Some("invariant check failed".to_string());
    }
    if bank_required.is_some() && !bank_ok && !task.bank_strict {
        warnings.push(format!(
            "required bank {} not PASS",
            bank_required.as_deref().unwrap_or("")
        ));
    }

    let artifacts = select_artifacts(
        pack,
        &stdout_path,
        telemetry_ok.then(|| telemetry_path.clone()),
        metrics_path,
        events_path,
        invariants_path,
    );

    let result = RunResult {
        ok,
        error_code,
        error,
        run_id: run_id.clone(),
        task_id: task_id.to_string(),
        project: task.project,
        runner: task.runner,
        scenario_path: task.scenario_path.clone(),
        scenario_used: Some(scenario_used.display().to_string()),
        scenario_id,
        tick_budget: task.tick_budget,
        seed_requested,
        seed_used,
        seed_effective,
        pack: pack_name,
        started_utc,
        ended_utc: utc_now(),
        exit_code,
        timeout_s: task.effective_timeout_s(),
        timed_out,
        bank_required,
        bank_results,
        bank_status,
        warnings,
        telemetry_path: telemetry_ok.then(|| telemetry_path.display().to_string()),
        metrics_summary,
        metrics_stats,
        invariants,
        artifacts,
        tool_version: TOOL_VERSION.to_string(),
        schema_version: SCHEMA_VERSION,
    };

    if let Err(err) = write_result_once(&run_dir, &serde_json::to_value(&result).unwrap_or_default())
    {
        return SingleOutcome::Fatal(RunTaskOutcome::fatal(
            ErrorCode::Exception,
            format!("failed to write result.json: {err}"),
        ));
    }

    tracing::info!(
        run_id = %run_id,
        ok = result.ok,
        bank = result
            .bank_status
            .as_ref()
            .map(|b| b.status.as_str())
            .unwrap_or("none"),
        "run_task summary"
    );

    SingleOutcome::Completed(Box::new(result))
}

fn run_task_multi(
    paths: &Paths,
    task_id: &str,
    task: &Task,
    seeds: &[u64],
    pack_name: Option<&str>,
) -> RunTaskOutcome {
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let run_dir = paths.run_dir(&run_id);
    if let Err(err) = fs::create_dir_all(&run_dir) {
        return RunTaskOutcome::fatal(
            ErrorCode::Exception,
            format!("failed to create run dir: {err}"),
        );
    }

    let pack_used = pack_name
        .map(String::from)
        .or_else(|| Some(task.default_pack.clone()).filter(|p| !p.is_empty()))
        .unwrap_or_else(|| "nightly-default".to_string());

    let started_utc = utc_now();
    let mut seed_results: Vec<RunResult> = Vec::with_capacity(seeds.len());
    for seed in seeds {
        match run_single(paths, task_id, Some(*seed), pack_name) {
            SingleOutcome::Fatal(outcome) => return outcome,
            SingleOutcome::Completed(result) => seed_results.push(*result),
        }
    }

    let aggregation = collect_seed_metrics(&seed_results, &task.metric_keys, &task.variance_band);
    let mut summary = aggregation.summary;
    summary.insert(
        "eval.variance_failed_count".to_string(),
        serde_json::json!(aggregation.variance_failed_count),
    );

    let seed_ok = seed_results.iter().all(|run| run.ok);
    let ok = seed_ok && aggregation.variance_pass;
    let (error_code, error) = if !seed_ok {
        (
            ErrorCode::SeedRunFailed,
            Some("one or more seed runs failed".to_string()),
        )
    } else if !aggregation.variance_pass {
        (
            ErrorCode::VarianceFailed,
            Some("variance band exceeded".to_string()),
        )
    } else {
        (ErrorCode::None, None)
    };

    let result = AggregateResult {
        ok,
        error_code,
        error,
        run_id: run_id.clone(),
        task_id: task_id.to_string(),
        project: task.project,
        runner: task.runner,
        scenario_path: task.scenario_path.clone(),
        scenario_used: seed_results.first().and_then(|r| r.scenario_used.clone()),
        scenario_id: seed_results.first().and_then(|r| r.scenario_id.clone()),
        tick_budget: task.tick_budget,
        seeds_requested: seeds.to_vec(),
        pack: pack_used,
        started_utc,
        ended_utc: utc_now(),
        exit_code: if ok { 0 } else { 3 },
        metrics_summary: summary,
        metrics_stats: aggregation.stats,
        variance_grades: aggregation.variance_grades,
        variance_pass: aggregation.variance_pass,
        eval_metrics: EvalMetrics {
            variance_failed_count: aggregation.variance_failed_count,
        },
        seed_run_ids: aggregation
            .seed_runs
            .iter()
            .filter_map(|run| run.run_id.clone())
            .collect(),
        seed_runs: aggregation.seed_runs,
        artifacts: BTreeMap::new(),
        tool_version: TOOL_VERSION.to_string(),
        schema_version: SCHEMA_VERSION,
    };

    if let Err(err) = write_result_once(&run_dir, &serde_json::to_value(&result).unwrap_or_default())
    {
        return RunTaskOutcome::fatal(
            ErrorCode::Exception,
            format!("failed to write result.json: {err}"),
        );
    }

    tracing::info!(
        run_id = %run_id,
        ok,
        seeds = %seeds.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(","),
        "run_task summary"
    );

    RunTaskOutcome::Aggregate(Box::new(result))
}

/// result.json is written exactly once per run_id; an existing file means a
/// bookkeeping bug upstream and is never clobbered.
fn write_result_once(run_dir: &Path, document: &Value) -> std::io::Result<()> {
    let path = run_dir.join("result.json");
    let mut handle = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    let text = serde_json::to_string_pretty(document).unwrap_or_else(|_| "{}".to_string());
    handle.write_all(text.as_bytes())?;
    handle.write_all(b"\n")?;
    Ok(())
}

/// Resolve the simulator binary: build pointer first, conventional path next.
fn find_binary(paths: &Paths, project: Project) -> Option<PathBuf> {
    let pointer_path = paths.build_pointer_path(project);
    if pointer_path.is_file() {
        let pointer = fs::read_to_string(&pointer_path)
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok());
        if let Some(executable) = pointer
            .as_ref()
            .and_then(|doc| doc.get("executable"))
            .and_then(|v| v.as_str())
        {
            let candidate = PathBuf::from(executable);
            if candidate.exists() {
                tracing::info!(project = %project, binary = %candidate.display(), "using build pointer");
                return Some(candidate);
            }
        }
    }
    let conventional = paths.conventional_binary_path(project);
    conventional.exists().then_some(conventional)
}

fn ensure_executable(binary: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let Ok(meta) = fs::metadata(binary) else {
            return;
        };
        let mode = meta.permissions().mode();
        if mode & 0o111 == 0 {
            let mut perms = meta.permissions();
            perms.set_mode(mode | 0o111);
            if fs::set_permissions(binary, perms).is_ok() {
                tracing::info!(binary = %binary.display(), "chmod +x applied");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = binary;
    }
}

/// Produce a seed-override copy of the scenario for runners that accept one.
/// Returns the effective scenario path and the seed actually injected.
fn override_seed_if_supported(
    scenario_abs: &Path,
    run_dir: &Path,
    seed: Option<u64>,
    task: &Task,
) -> (PathBuf, Option<u64>) {
    let Some(seed) = seed else {
        return (scenario_abs.to_path_buf(), None);
    };
    if !task.runner.supports_seed_override() {
        return (scenario_abs.to_path_buf(), None);
    }
    let Ok(text) = fs::read_to_string(scenario_abs) else {
        return (scenario_abs.to_path_buf(), None);
    };
    let Ok(mut doc) = serde_json::from_str::<Value>(&text) else {
        return (scenario_abs.to_path_buf(), None);
    };
    let Some(map) = doc.as_object_mut() else {
        return (scenario_abs.to_path_buf(), None);
    };
    map.insert("seed".to_string(), serde_json::json!(seed));

    let dest = run_dir.join("scenario_seed_override.json");
    let rendered = serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string());
    if fs::write(&dest, rendered).is_err() {
        return (scenario_abs.to_path_buf(), None);
    }
    copy_scenario_templates(scenario_abs, run_dir);
    (dest, Some(seed))
}

/// Copy the sibling Templates/*.json next to the override so relative lookups
/// keep working from the run dir.
fn copy_scenario_templates(scenario_abs: &Path, run_dir: &Path) {
    let Some(scenario_dir) = scenario_abs.parent() else {
        return;
    };
    let templates_dir = scenario_dir.join("Templates");
    if !templates_dir.is_dir() {
        return;
    }
    let dest_dir = run_dir.join("Templates");
    if fs::create_dir_all(&dest_dir).is_err() {
        return;
    }
    let Ok(entries) = fs::read_dir(&templates_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let lower = name.to_string_lossy().to_ascii_lowercase();
        if !lower.ends_with(".json") {
            continue;
        }
        if let Err(err) = fs::copy(entry.path(), dest_dir.join(&name)) {
            tracing::warn!(
                template = %entry.path().display(),
                error = %err,
                "failed to copy scenario template"
            );
        }
    }
}

fn compose_child_env(
    task: &Task,
    pack: &Pack,
    scenario_abs: &Path,
    scenario_used: &Path,
    telemetry_path: &Path,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for (key, value) in &pack.env {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in &task.env {
        env.insert(key.clone(), value.clone());
    }
    env.insert(
        "PUREDOTS_TELEMETRY_PATH".to_string(),
        telemetry_path.display().to_string(),
    );
    env.insert(
        "TELEMETRY_PATH".to_string(),
        telemetry_path.display().to_string(),
    );
    if task.project == Project::Space4x {
        env.insert(
            "SPACE4X_SCENARIO_SOURCE_PATH".to_string(),
            scenario_abs.display().to_string(),
        );
        env.insert(
            "SPACE4X_SCENARIO_PATH".to_string(),
            scenario_used.display().to_string(),
        );
    }
    env
}

/// Gzip a jsonl artifact in place when the pack asks for it.
fn maybe_compress(path: &Path, compress: bool) -> PathBuf {
    if !compress || !path.exists() {
        return path.to_path_buf();
    }
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let compress_result = (|| -> std::io::Result<()> {
        let mut input = fs::File::open(path)?;
        let output = fs::File::create(&gz_path)?;
        let mut encoder = flate2::write::GzEncoder::new(output, flate2::Compression::default());
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    })();
    match compress_result {
        Ok(()) => {
            let _ = fs::remove_file(path);
            gz_path
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "gzip failed; keeping raw file");
            let _ = fs::remove_file(&gz_path);
            path.to_path_buf()
        }
    }
}

fn select_artifacts(
    pack: &Pack,
    stdout_path: &Path,
    telemetry_path: Option<PathBuf>,
    metrics_path: Option<PathBuf>,
    events_path: Option<PathBuf>,
    invariants_path: Option<PathBuf>,
) -> BTreeMap<String, String> {
    let mut all: BTreeMap<&str, Option<PathBuf>> = BTreeMap::new();
    all.insert("stdout", Some(stdout_path.to_path_buf()));
    all.insert("telemetry", telemetry_path);
    all.insert("metrics", metrics_path);
    all.insert("events", events_path);
    all.insert("invariants", invariants_path);

    let include: Vec<String> = pack
        .artifacts_include
        .clone()
        .unwrap_or_else(|| all.keys().map(|k| k.to_string()).collect());
    let exclude: std::collections::BTreeSet<&String> = pack.artifacts_exclude.iter().collect();

    let mut artifacts = BTreeMap::new();
    for name in include {
        if exclude.contains(&name) {
            continue;
        }
        if let Some(Some(path)) = all.get(name.as_str()) {
            artifacts.insert(name, path.display().to_string());
        }
    }
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_fixture(runner: &str) -> Task {
        serde_json::from_value(json!({
            "project": "puredots",
            "runner": runner,
            "scenario_path": "scenarios/p0.json",
            "tick_budget": 100,
            "default_pack": "nightly-default",
            "metric_keys": ["m", "telemetry.truncated"]
        }))
        .unwrap()
    }

    #[test]
    fn seed_override_merges_seed_into_copy() {
        let temp = tempfile::tempdir().unwrap();
        let scenario = temp.path().join("scenario.json");
        fs::write(&scenario, json!({"name": "p0", "ticks": 100}).to_string()).unwrap();
        let run_dir = temp.path().join("run");
        fs::create_dir_all(&run_dir).unwrap();

        let task = task_fixture("scenario_runner");
        let (used, effective) = override_seed_if_supported(&scenario, &run_dir, Some(9), &task);
        assert_eq!(effective, Some(9));
        assert_eq!(used, run_dir.join("scenario_seed_override.json"));

        let copy: Value = serde_json::from_str(&fs::read_to_string(&used).unwrap()).unwrap();
        assert_eq!(copy["seed"], json!(9));
        assert_eq!(copy["name"], json!("p0"));
        assert_eq!(copy["ticks"], json!(100));
    }

    #[test]
    fn seed_override_skipped_for_loader_runner() {
        let temp = tempfile::tempdir().unwrap();
        let scenario = temp.path().join("scenario.json");
        fs::write(&scenario, "{}").unwrap();
        let run_dir = temp.path().join("run");
        fs::create_dir_all(&run_dir).unwrap();

        let task = task_fixture("godgame_loader");
        let (used, effective) = override_seed_if_supported(&scenario, &run_dir, Some(9), &task);
        assert_eq!(used, scenario);
        assert!(effective.is_none());
    }

    #[test]
    fn seed_override_copies_sibling_templates() {
        let temp = tempfile::tempdir().unwrap();
        let scenario_dir = temp.path().join("scenarios");
        fs::create_dir_all(scenario_dir.join("Templates")).unwrap();
        let scenario = scenario_dir.join("p0.json");
        fs::write(&scenario, "{}").unwrap();
        fs::write(scenario_dir.join("Templates/villager.json"), "{}").unwrap();
        fs::write(scenario_dir.join("Templates/readme.txt"), "skip me").unwrap();
        let run_dir = temp.path().join("run");
        fs::create_dir_all(&run_dir).unwrap();

        let task = task_fixture("scenario_runner");
        override_seed_if_supported(&scenario, &run_dir, Some(1), &task);

        assert!(run_dir.join("Templates/villager.json").exists());
        assert!(!run_dir.join("Templates/readme.txt").exists());
    }

    #[test]
    fn child_env_layers_pack_then_task() {
        let task: Task = serde_json::from_value(json!({
            "project": "space4x",
            "runner": "space4x_loader",
            "scenario_path": "scenarios/s0.json",
            "tick_budget": 100,
            "default_pack": "nightly-default",
            "metric_keys": ["m", "telemetry.truncated"],
            "env": {"SHARED": "task", "TASK_ONLY": "1"}
        }))
        .unwrap();
        let mut pack = Pack::default();
        pack.env.insert("SHARED".into(), "pack".into());
        pack.env.insert("PACK_ONLY".into(), "1".into());

        let env = compose_child_env(
            &task,
            &pack,
            Path::new("/tri/scenarios/s0.json"),
            Path::new("/runs/x/scenario_seed_override.json"),
            Path::new("/runs/x/telemetry.ndjson"),
        );
        assert_eq!(env.get("SHARED").unwrap(), "task");
        assert_eq!(env.get("PACK_ONLY").unwrap(), "1");
        assert_eq!(env.get("TASK_ONLY").unwrap(), "1");
        assert_eq!(
            env.get("PUREDOTS_TELEMETRY_PATH").unwrap(),
            "/runs/x/telemetry.ndjson"
        );
        assert_eq!(
            env.get("SPACE4X_SCENARIO_SOURCE_PATH").unwrap(),
            "/tri/scenarios/s0.json"
        );
        assert_eq!(
            env.get("SPACE4X_SCENARIO_PATH").unwrap(),
            "/runs/x/scenario_seed_override.json"
        );
    }

    #[test]
    fn artifacts_include_exclude_filtering() {
        let mut pack = Pack::default();
        pack.artifacts_exclude = vec!["events".to_string()];
        let artifacts = select_artifacts(
            &pack,
            Path::new("/r/stdout.log"),
            Some(PathBuf::from("/r/telemetry.ndjson")),
            Some(PathBuf::from("/r/metrics.jsonl")),
            Some(PathBuf::from("/r/events.jsonl")),
            None,
        );
        assert!(artifacts.contains_key("stdout"));
        assert!(artifacts.contains_key("telemetry"));
        assert!(artifacts.contains_key("metrics"));
        assert!(!artifacts.contains_key("events"));
        assert!(!artifacts.contains_key("invariants"));

        pack.artifacts_include = Some(vec!["stdout".to_string()]);
        pack.artifacts_exclude.clear();
        let artifacts = select_artifacts(
            &pack,
            Path::new("/r/stdout.log"),
            Some(PathBuf::from("/r/telemetry.ndjson")),
            None,
            None,
            None,
        );
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts.contains_key("stdout"));
    }

    #[test]
    fn result_json_is_never_overwritten() {
        let temp = tempfile::tempdir().unwrap();
        let doc = json!({"ok": true});
        write_result_once(temp.path(), &doc).unwrap();
        let second = write_result_once(temp.path(), &doc);
        assert!(second.is_err());
    }

    #[test]
    fn gzip_replaces_original_when_enabled() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("metrics.jsonl");
        fs::write(&path, "{\"a\":1}\n").unwrap();
        let compressed = maybe_compress(&path, true);
        assert!(compressed.to_string_lossy().ends_with(".gz"));
        assert!(compressed.exists());
        assert!(!path.exists());

        let path2 = temp.path().join("events.jsonl");
        fs::write(&path2, "{}\n").unwrap();
        let untouched = maybe_compress(&path2, false);
        assert_eq!(untouched, path2);
        assert!(path2.exists());
    }
}
