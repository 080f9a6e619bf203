// Process logging for the control plane: daily-rolling JSONL files under
// the state dir, a compact stderr layer, and an mtime-based retention sweep.
// Stdout is never touched; it belongs to result envelopes.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file prefix shared by every component of the tool.
const LOG_PREFIX: &str = "tri";
/// Fallback filter when RUST_LOG is unset.
const DEFAULT_FILTER: &str = "info";

/// How one process wants its logging set up.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Component label baked into the file name (`tri.<component>.*.jsonl`).
    pub component: &'static str,
    /// State dir per the tool's layout; log files land in `<state>/logs`.
    pub state_dir: PathBuf,
    /// Files whose mtime is older than this many days are swept at init.
    pub retention_days: u64,
}

impl LogConfig {
    pub fn for_component(component: &'static str, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            component,
            state_dir: state_dir.into(),
            retention_days: 14,
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    fn file_prefix(&self) -> String {
        format!("{LOG_PREFIX}.{}", self.component)
    }
}

/// What init actually did, for the startup log line.
#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub component: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub removed_logs: usize,
    pub initialized_at: DateTime<Utc>,
}

/// Keeps the non-blocking writer alive; drop it last.
pub struct LoggingHandle {
    _guard: WorkerGuard,
    pub info: LoggingInitInfo,
}

/// Initialize logging for one process.
///
/// Safe to call when a subscriber is already installed (tests, embedded
/// callers): the second install attempt is ignored and the handle still
/// carries a valid guard.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingHandle> {
    let logs_dir = config.logs_dir();
    fs::create_dir_all(&logs_dir)?;
    let removed_logs = sweep_expired_logs(&logs_dir, config.retention_days);

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(config.file_prefix())
        .filename_suffix("jsonl")
        .build(&logs_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        component: config.component.to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix: config.file_prefix(),
        retention_days: config.retention_days,
        removed_logs,
        initialized_at: Utc::now(),
    };
    Ok(LoggingHandle {
        _guard: guard,
        info,
    })
}

/// Remove expired `tri.*.jsonl` files from the logs dir.
///
/// Expiry is judged by file mtime, not by the date encoded in the name:
/// every component's rotated files age out here, including ones left behind
/// by a renamed or retired component. Returns how many files were removed.
pub fn sweep_expired_logs(logs_dir: &Path, retention_days: u64) -> usize {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_rotated_log_name(&path) {
            continue;
        }
        let expired = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .map(|mtime| DateTime::<Utc>::from(mtime) < cutoff)
            .unwrap_or(false);
        if expired && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// `tri.<component>.<rotation>.jsonl` and nothing else.
fn is_rotated_log_name(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.strip_prefix(&format!("{LOG_PREFIX}."))
        .and_then(|rest| rest.strip_suffix(".jsonl"))
        // component and rotation stamp, dot-separated
        .map(|middle| middle.split('.').count() >= 2)
        .unwrap_or(false)
}
