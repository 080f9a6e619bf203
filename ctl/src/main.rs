// headlessctl entry point.
// Every subcommand prints exactly one JSON result line on stdout; human
// progress goes to stderr through tracing.

mod validate;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tri_core::{
    claim_session_lock, cleanup_runs, cleanup_session_locks, contract_check, load_registry_value,
    load_task_registry, release_session_lock, show_session_lock, Paths, RegistryError,
    DEFAULT_SESSION_LOCK_TTL_SEC,
};
use tri_goals::{build_scoreboard, ScoreboardOptions};
use tri_intel::{
    choose_goal, default_embedder, ingest_diag_dir, ingest_ledger, ingest_result_bundle,
    log_reward, run_daemon, DaemonOptions, IntelPaths,
};
use tri_run::{
    bundle_artifacts, diff_metrics, parse_seed_list, run_nightly, run_task, NightlyOptions,
    RunTaskRequest,
};
use tri_types::{ErrorCode, ResultEnvelope};

#[derive(Parser, Debug)]
#[command(name = "headlessctl")]
#[command(about = "Headless experiment-execution control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a task (optionally multi-seed) and materialize its run.
    #[command(name = "run_task")]
    RunTask {
        task_id: String,
        /// Single seed; digits only.
        #[arg(long)]
        seed: Option<String>,
        /// Comma-separated seed list, e.g. 7,7,9
        #[arg(long)]
        seeds: Option<String>,
        #[arg(long)]
        pack: Option<String>,
    },
    /// Re-read metrics and invariants for a finished run.
    #[command(name = "get_metrics")]
    GetMetrics { run_id: String },
    /// Diff run B against run A over the task's metric keys.
    #[command(name = "diff_metrics")]
    DiffMetrics { run_id_a: String, run_id_b: String },
    /// Check the task and pack registries against the declarative contract.
    #[command(name = "contract_check")]
    ContractCheck,
    /// Create bundle_<run_id>.tar.gz inside the run directory.
    #[command(name = "bundle_artifacts")]
    BundleArtifacts { run_id: String },
    /// Run one representative task per runner kind and verify the contract.
    #[command(name = "validate")]
    Validate,
    /// Claim the exclusive nightly session lock.
    #[command(name = "claim_session_lock")]
    ClaimSessionLock {
        #[arg(long, default_value_t = DEFAULT_SESSION_LOCK_TTL_SEC)]
        ttl: u64,
        #[arg(long, default_value = "nightly")]
        purpose: String,
        #[arg(long = "run-id")]
        run_id: Option<String>,
    },
    /// Release the session lock (idempotent; run-id guarded).
    #[command(name = "release_session_lock")]
    ReleaseSessionLock {
        #[arg(long = "run-id")]
        run_id: Option<String>,
    },
    /// Show the current session lock holder.
    #[command(name = "show_session_lock")]
    ShowSessionLock,
    /// Reclaim stale session locks (primary and legacy paths).
    #[command(name = "cleanup_locks")]
    CleanupLocks {
        #[arg(long, default_value_t = DEFAULT_SESSION_LOCK_TTL_SEC)]
        ttl: u64,
    },
    /// Apply run-directory retention policies.
    #[command(name = "cleanup_runs")]
    CleanupRuns {
        #[arg(long)]
        days: Option<u64>,
        #[arg(long = "keep-per-task")]
        keep_per_task: Option<usize>,
        #[arg(long = "max-bytes")]
        max_bytes: Option<u64>,
    },
    /// Run a nightly cycle: selection, gating, runs, bundles, summary.
    #[command(name = "nightly")]
    Nightly {
        #[arg(long, default_value = "nightly")]
        tag: String,
        /// Comma-separated explicit task ids.
        #[arg(long, default_value = "")]
        tasks: String,
        #[arg(long, default_value_t = false)]
        gate: bool,
        #[arg(long = "gate-hours", default_value_t = 12.0)]
        gate_hours: f64,
    },
    /// Build scoreboard.json, triage_next.md, and the nightly headline.
    #[command(name = "scoreboard")]
    Scoreboard {
        #[arg(long = "results-dir")]
        results_dir: PathBuf,
        #[arg(long = "reports-dir")]
        reports_dir: PathBuf,
        #[arg(long = "intel-dir")]
        intel_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 25)]
        limit: usize,
        #[arg(long = "goal-specs-dir")]
        goal_specs_dir: Option<PathBuf>,
        #[arg(long = "pending-grace-sec", default_value_t = 600)]
        pending_grace_sec: u64,
    },
    /// Evidence & triage engine commands.
    #[command(name = "intel")]
    Intel {
        #[command(subcommand)]
        command: IntelCommand,
    },
}

#[derive(Subcommand, Debug)]
enum IntelCommand {
    /// Parse the recurring-error ledger and rebuild its index.
    #[command(name = "ingest-ledger")]
    IngestLedger,
    /// Ingest one result bundle (zip or extracted directory).
    #[command(name = "ingest-result-zip")]
    IngestResultZip {
        #[arg(long = "result-zip")]
        result_zip: PathBuf,
    },
    /// Ingest one buildbox diagnostics directory.
    #[command(name = "ingest-diag-dir")]
    IngestDiagDir {
        #[arg(long = "diag-dir")]
        diag_dir: PathBuf,
    },
    /// Watch a results directory and ingest new bundles as they land.
    #[command(name = "daemon")]
    Daemon {
        #[arg(long = "results-dir")]
        results_dir: PathBuf,
        #[arg(long = "poll-sec", default_value_t = 2)]
        poll_sec: u64,
        #[arg(long = "diag-root")]
        diag_root: Option<PathBuf>,
    },
    /// Round-robin goal selection over a plan document.
    #[command(name = "choose-goal")]
    ChooseGoal {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Append a shaped reward for a cycle summary.
    #[command(name = "log-reward")]
    LogReward {
        #[arg(long = "cycle-json")]
        cycle_json: PathBuf,
    },
}

/// Bad invocations still emit a result envelope; help and version requests
/// keep clap's plain rendering.
fn emit_parse_error(err: clap::Error) -> ExitCode {
    use clap::error::ErrorKind;
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            let _ = err.print();
            ExitCode::SUCCESS
        }
        kind => {
            let code = match kind {
                ErrorKind::MissingSubcommand => ErrorCode::MissingCommand,
                ErrorKind::InvalidSubcommand => ErrorCode::UnknownCommand,
                ErrorKind::MissingRequiredArgument => ErrorCode::MissingArgs,
                _ => ErrorCode::InvalidArg,
            };
            emit_failure(code, err.to_string().lines().next().unwrap_or("").to_string(), 2)
        }
    }
}

fn emit(envelope: &ResultEnvelope, exit_code: u8) -> ExitCode {
    println!("{}", envelope.to_line());
    ExitCode::from(exit_code)
}

fn emit_failure(code: ErrorCode, error: String, exit_code: u8) -> ExitCode {
    emit(&ResultEnvelope::failure(code, error), exit_code)
}

fn registry_failure(err: RegistryError, missing_code: ErrorCode) -> ExitCode {
    match err {
        RegistryError::Missing(path) => {
            emit_failure(missing_code, format!("registry not found: {path}"), 2)
        }
        other => emit_failure(ErrorCode::Exception, other.to_string(), 2),
    }
}

fn load_run_document(paths: &Paths, run_id: &str) -> Option<Value> {
    let text = std::fs::read_to_string(paths.run_dir(run_id).join("result.json")).ok()?;
    serde_json::from_str(&text).ok()
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => return emit_parse_error(err),
    };
    let paths = Paths::resolve();

    let log_config = tri_observability::LogConfig::for_component("ctl", &paths.state_dir);
    let _logging = tri_observability::init_logging(&log_config).ok();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        dispatch(cli.command, &paths)
    }));
    match result {
        Ok(exit) => exit,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "panic".to_string());
            emit_failure(ErrorCode::Exception, detail, 2)
        }
    }
}

fn dispatch(command: Command, paths: &Paths) -> ExitCode {
    match command {
        Command::RunTask {
            task_id,
            seed,
            seeds,
            pack,
        } => cmd_run_task(paths, task_id, seed, seeds, pack),
        Command::GetMetrics { run_id } => cmd_get_metrics(paths, &run_id),
        Command::DiffMetrics { run_id_a, run_id_b } => {
            cmd_diff_metrics(paths, &run_id_a, &run_id_b)
        }
        Command::ContractCheck => cmd_contract_check(paths),
        Command::BundleArtifacts { run_id } => cmd_bundle_artifacts(paths, &run_id),
        Command::Validate => validate::cmd_validate(paths),
        Command::ClaimSessionLock {
            ttl,
            purpose,
            run_id,
        } => cmd_claim_session_lock(paths, ttl, &purpose, run_id.as_deref()),
        Command::ReleaseSessionLock { run_id } => {
            cmd_release_session_lock(paths, run_id.as_deref())
        }
        Command::ShowSessionLock => cmd_show_session_lock(paths),
        Command::CleanupLocks { ttl } => cmd_cleanup_locks(paths, ttl),
        Command::CleanupRuns {
            days,
            keep_per_task,
            max_bytes,
        } => cmd_cleanup_runs(paths, days, keep_per_task, max_bytes),
        Command::Nightly {
            tag,
            tasks,
            gate,
            gate_hours,
        } => cmd_nightly(paths, tag, tasks, gate, gate_hours),
        Command::Scoreboard {
            results_dir,
            reports_dir,
            intel_dir,
            limit,
            goal_specs_dir,
            pending_grace_sec,
        } => cmd_scoreboard(
            paths,
            results_dir,
            reports_dir,
            intel_dir,
            limit,
            goal_specs_dir,
            pending_grace_sec,
        ),
        Command::Intel { command } => cmd_intel(command),
    }
}

fn cmd_run_task(
    paths: &Paths,
    task_id: String,
    seed: Option<String>,
    seeds: Option<String>,
    pack: Option<String>,
) -> ExitCode {
    let seed = match seed.as_deref() {
        Some(raw) => match raw.parse::<u64>() {
            Ok(seed) => Some(seed),
            Err(_) => {
                return emit_failure(ErrorCode::InvalidSeed, "invalid run_task args".to_string(), 2)
            }
        },
        None => None,
    };
    let seeds = match seeds.as_deref() {
        Some(raw) => match parse_seed_list(raw) {
            Ok(seeds) => Some(seeds),
            Err(code) => return emit_failure(code, "invalid run_task args".to_string(), 2),
        },
        None => None,
    };
    if seed.is_some() && seeds.is_some() {
        return emit_failure(
            ErrorCode::ConflictingSeedArgs,
            "invalid run_task args".to_string(),
            2,
        );
    }

    let request = RunTaskRequest {
        task_id,
        seed,
        seeds,
        pack,
    };
    let outcome = run_task(paths, &request);
    let exit_code = outcome.exit_code() as u8;
    let envelope = ResultEnvelope::from_document(outcome.to_document());
    emit(&envelope, exit_code)
}

fn cmd_get_metrics(paths: &Paths, run_id: &str) -> ExitCode {
    let Some(result) = load_run_document(paths, run_id) else {
        return emit(
            &ResultEnvelope::failure(ErrorCode::RunNotFound, format!("run not found: {run_id}"))
                .with_run_id(run_id),
            2,
        );
    };
    let mut envelope = ResultEnvelope::success().with_run_id(run_id);
    envelope = envelope
        .with_field(
            "task_id",
            result.get("task_id").cloned().unwrap_or(Value::Null),
        )
        .with_field(
            "metrics_summary",
            result.get("metrics_summary").cloned().unwrap_or(json!({})),
        )
        .with_field(
            "metrics_stats",
            result.get("metrics_stats").cloned().unwrap_or(json!({})),
        )
        .with_field(
            "invariants",
            result.get("invariants").cloned().unwrap_or(json!([])),
        )
        .with_field(
            "artifacts",
            result.get("artifacts").cloned().unwrap_or(json!({})),
        );
    if result.get("seed_runs").is_some() {
        envelope = envelope
            .with_field(
                "seed_runs",
                result.get("seed_runs").cloned().unwrap_or(json!([])),
            )
            .with_field(
                "seed_run_ids",
                result.get("seed_run_ids").cloned().unwrap_or(json!([])),
            )
            .with_field(
                "variance_grades",
                result.get("variance_grades").cloned().unwrap_or(json!({})),
            )
            .with_field(
                "variance_pass",
                result.get("variance_pass").cloned().unwrap_or(json!(true)),
            );
    }
    emit(&envelope, 0)
}

fn cmd_diff_metrics(paths: &Paths, run_id_a: &str, run_id_b: &str) -> ExitCode {
    let run_a = load_run_document(paths, run_id_a);
    let run_b = load_run_document(paths, run_id_b);
    let (Some(run_a), Some(run_b)) = (run_a, run_b) else {
        return emit(
            &ResultEnvelope::failure(
                ErrorCode::RunNotFound,
                "one or more runs not found".to_string(),
            )
            .with_run_id(run_id_a),
            2,
        );
    };

    let task_id = run_b
        .get("task_id")
        .or_else(|| run_a.get("task_id"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let task = task_id.as_ref().and_then(|task_id| {
        load_task_registry(&paths.tasks_registry_path())
            .ok()
            .and_then(|registry| registry.tasks.get(task_id).cloned())
    });

    let diff = diff_metrics(&run_a, &run_b, task.as_ref());
    let envelope = ResultEnvelope::success()
        .with_run_id(run_id_a)
        .with_field("run_id_b", json!(run_id_b))
        .with_field("task_id", json!(task_id))
        .with_field(
            "diffs",
            serde_json::to_value(&diff.diffs).unwrap_or(json!({})),
        )
        .with_field(
            "grades",
            serde_json::to_value(&diff.grades).unwrap_or(json!({})),
        )
        .with_field("pass", json!(diff.pass));
    emit(&envelope, 0)
}

fn cmd_contract_check(paths: &Paths) -> ExitCode {
    let tasks_doc = match load_registry_value(&paths.tasks_registry_path()) {
        Ok(doc) => doc,
        Err(err) => return registry_failure(err, ErrorCode::TasksMissing),
    };
    let packs_doc = match load_registry_value(&paths.packs_registry_path()) {
        Ok(doc) => doc,
        Err(err) => return registry_failure(err, ErrorCode::PacksMissing),
    };

    let report = contract_check(&tasks_doc, &packs_doc);
    let envelope = if report.ok {
        ResultEnvelope::success()
    } else {
        ResultEnvelope::failure(ErrorCode::ContractFailed, "contract check failed".to_string())
    }
    .with_field(
        "errors",
        serde_json::to_value(&report.errors).unwrap_or(json!([])),
    )
    .with_field(
        "warnings",
        serde_json::to_value(&report.warnings).unwrap_or(json!([])),
    );
    emit(&envelope, if report.ok { 0 } else { 3 })
}

fn cmd_bundle_artifacts(paths: &Paths, run_id: &str) -> ExitCode {
    match bundle_artifacts(paths, run_id) {
        Ok(bundle_path) => emit(
            &ResultEnvelope::success()
                .with_run_id(run_id)
                .with_field("bundle_path", json!(bundle_path.display().to_string())),
            0,
        ),
        Err(tri_run::bundle::BundleError::RunNotFound(_)) => emit(
            &ResultEnvelope::failure(ErrorCode::RunNotFound, format!("run not found: {run_id}"))
                .with_run_id(run_id),
            2,
        ),
        Err(err) => emit_failure(ErrorCode::Exception, err.to_string(), 2),
    }
}

fn cmd_claim_session_lock(
    paths: &Paths,
    ttl: u64,
    purpose: &str,
    run_id: Option<&str>,
) -> ExitCode {
    let outcome = claim_session_lock(paths, ttl, purpose, run_id);
    let run_id = outcome.lock.as_ref().map(|l| l.run_id.clone());
    let mut envelope = if outcome.acquired {
        ResultEnvelope::success()
    } else {
        ResultEnvelope::failure(ErrorCode::Locked, "session lock already held".to_string())
    };
    if let Some(run_id) = run_id {
        envelope = envelope.with_run_id(run_id);
    }
    let envelope = envelope
        .with_field("acquired", json!(outcome.acquired))
        .with_field(
            "lock_path",
            json!(outcome.lock_path.display().to_string()),
        )
        .with_field(
            "lock",
            serde_json::to_value(&outcome.lock).unwrap_or(Value::Null),
        )
        .with_field("warning", json!(outcome.warning))
        .with_field("ttl_sec", json!(ttl));
    emit(&envelope, if outcome.acquired { 0 } else { 3 })
}

fn cmd_release_session_lock(paths: &Paths, run_id: Option<&str>) -> ExitCode {
    let outcome = release_session_lock(paths, run_id);
    let mut envelope = ResultEnvelope::success();
    if let Some(lock) = &outcome.lock {
        envelope = envelope.with_run_id(lock.run_id.clone());
    }
    let envelope = envelope
        .with_field("released", json!(outcome.released))
        .with_field(
            "lock_path",
            json!(outcome.lock_path.display().to_string()),
        )
        .with_field(
            "lock",
            serde_json::to_value(&outcome.lock).unwrap_or(Value::Null),
        );
    emit(&envelope, 0)
}

fn cmd_show_session_lock(paths: &Paths) -> ExitCode {
    let (lock_path, lock) = show_session_lock(paths);
    let held = lock.is_some();
    let mut envelope = if held {
        ResultEnvelope::failure(ErrorCode::Locked, "session lock present".to_string())
    } else {
        ResultEnvelope::success()
    };
    if let Some(lock) = &lock {
        envelope = envelope.with_run_id(lock.run_id.clone());
    }
    let envelope = envelope
        .with_field("lock_path", json!(lock_path.display().to_string()))
        .with_field("lock", serde_json::to_value(&lock).unwrap_or(Value::Null));
    emit(&envelope, if held { 3 } else { 0 })
}

fn cmd_cleanup_locks(paths: &Paths, ttl: u64) -> ExitCode {
    let reclaimed: Vec<String> = cleanup_session_locks(paths, ttl)
        .into_iter()
        .map(|path| path.display().to_string())
        .collect();
    emit(
        &ResultEnvelope::success().with_field("reclaimed", json!(reclaimed)),
        0,
    )
}

fn cmd_cleanup_runs(
    paths: &Paths,
    days: Option<u64>,
    keep_per_task: Option<usize>,
    max_bytes: Option<u64>,
) -> ExitCode {
    let removed = cleanup_runs(paths, days, keep_per_task, max_bytes);
    emit(
        &ResultEnvelope::success()
            .with_field("removed", json!(removed))
            .with_field("days", json!(days))
            .with_field("keep_per_task", json!(keep_per_task))
            .with_field("max_bytes", json!(max_bytes)),
        0,
    )
}

fn cmd_nightly(paths: &Paths, tag: String, tasks: String, gate: bool, gate_hours: f64) -> ExitCode {
    let explicit: Vec<String> = tasks
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();
    let options = NightlyOptions {
        tag,
        tasks: explicit,
        gate,
        gate_hours,
        ..Default::default()
    };
    let (summary, exit_code) = run_nightly(paths, &options);
    let envelope = ResultEnvelope::from_document(json!({
        "ok": summary.ok,
        "error_code": if summary.ok { "none" } else { "error" },
        "error": summary.error,
        "run_id": null,
        "skipped": summary.skipped,
        "reason": summary.reason,
        "tag": summary.tag,
        "tasks": summary.tasks,
        "summary_path": options.summary_path.display().to_string(),
    }));
    emit(&envelope, exit_code as u8)
}

#[allow(clippy::too_many_arguments)]
fn cmd_scoreboard(
    paths: &Paths,
    results_dir: PathBuf,
    reports_dir: PathBuf,
    intel_dir: Option<PathBuf>,
    limit: usize,
    goal_specs_dir: Option<PathBuf>,
    pending_grace_sec: u64,
) -> ExitCode {
    let intel_dir = intel_dir.unwrap_or_else(|| reports_dir.join("intel"));
    let mut options = ScoreboardOptions::new(results_dir, reports_dir, intel_dir);
    options.limit = limit;
    options.pending_grace_sec = pending_grace_sec;
    options.repo_root = paths.tri_root.clone();
    if let Some(goal_specs_dir) = goal_specs_dir {
        options.goal_specs_dir = goal_specs_dir;
    }

    match build_scoreboard(&options) {
        Ok(output) => emit(
            &ResultEnvelope::success()
                .with_field(
                    "scoreboard_path",
                    json!(output.scoreboard_path.display().to_string()),
                )
                .with_field(
                    "triage_path",
                    json!(output.triage_path.display().to_string()),
                )
                .with_field(
                    "headline_path",
                    json!(output.headline_path.display().to_string()),
                )
                .with_field("summary", output.scoreboard["summary"].clone()),
            0,
        ),
        Err(err) => emit_failure(ErrorCode::Exception, err.to_string(), 2),
    }
}

fn cmd_intel(command: IntelCommand) -> ExitCode {
    let intel = IntelPaths::resolve();
    let embedder = default_embedder(intel.embed_model.as_deref());

    match command {
        IntelCommand::IngestLedger => match ingest_ledger(&intel, embedder.as_ref()) {
            Ok(count) => emit(
                &ResultEnvelope::success().with_field("entries", json!(count)),
                0,
            ),
            Err(err) => emit_failure(ErrorCode::Exception, err.to_string(), 2),
        },
        IntelCommand::IngestResultZip { result_zip } => {
            match ingest_result_bundle(&intel, embedder.as_ref(), &result_zip, None) {
                Ok(Some(explain_path)) => emit(
                    &ResultEnvelope::success()
                        .with_field("explain", json!(explain_path.display().to_string())),
                    0,
                ),
                Ok(None) => emit(
                    &ResultEnvelope::success().with_field("already_processed", json!(true)),
                    0,
                ),
                Err(err) => emit_failure(ErrorCode::Exception, err.to_string(), 2),
            }
        }
        IntelCommand::IngestDiagDir { diag_dir } => {
            match ingest_diag_dir(&intel, embedder.as_ref(), &diag_dir) {
                Ok(Some(explain_path)) => emit(
                    &ResultEnvelope::success()
                        .with_field("explain", json!(explain_path.display().to_string())),
                    0,
                ),
                Ok(None) => emit(
                    &ResultEnvelope::success().with_field("already_processed", json!(true)),
                    0,
                ),
                Err(err) => emit_failure(ErrorCode::Exception, err.to_string(), 2),
            }
        }
        IntelCommand::Daemon {
            results_dir,
            poll_sec,
            diag_root,
        } => {
            let options = DaemonOptions {
                results_dir,
                diag_root,
                poll_sec,
                max_cycles: None,
            };
            match run_daemon(&intel, embedder.as_ref(), &options) {
                Ok(()) => emit(&ResultEnvelope::success(), 0),
                Err(err) => emit_failure(ErrorCode::Exception, err.to_string(), 2),
            }
        }
        IntelCommand::ChooseGoal { plan, out } => match choose_goal(&intel, &plan, &out) {
            Ok(output) => emit(
                &ResultEnvelope::success()
                    .with_field("chosen_goal", output["chosen_goal"].clone())
                    .with_field("out", json!(out.display().to_string())),
                0,
            ),
            Err(err) => emit_failure(ErrorCode::Exception, err.to_string(), 2),
        },
        IntelCommand::LogReward { cycle_json } => match log_reward(&intel, &cycle_json) {
            Ok(reward) => emit(
                &ResultEnvelope::success().with_field("reward", json!(reward)),
                0,
            ),
            Err(err) => emit_failure(ErrorCode::Exception, err.to_string(), 2),
        },
    }
}
