// Intel Store
// NDJSON record/action/reward logs plus the processed-key state that makes
// ingestion at-most-once.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tri_types::utc_now;

/// Intel-side filesystem layout, resolved once from env.
#[derive(Debug, Clone)]
pub struct IntelPaths {
    pub root: PathBuf,
    pub ledger_path: PathBuf,
    pub reports_dir: PathBuf,
    pub embed_model: Option<String>,
}

impl IntelPaths {
    pub fn resolve() -> Self {
        let root = std::env::var("ANVILOOP_INTEL_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("anviloop_intel"));
        let ledger_path = std::env::var("ANVILOOP_INTEL_LEDGER_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("ANVILOOP_RECURRING_ERRORS.md"));
        let reports_dir = std::env::var("POLISH_QUEUE_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|queue| PathBuf::from(queue).join("reports").join("intel"))
            .unwrap_or_else(|| root.join("reports").join("intel"));
        let embed_model = std::env::var("ANVILOOP_EMBED_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self {
            root,
            ledger_path,
            reports_dir,
            embed_model,
        }
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self {
            ledger_path: root.join("ANVILOOP_RECURRING_ERRORS.md"),
            reports_dir: root.join("reports").join("intel"),
            embed_model: None,
            root,
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn records_path(&self) -> PathBuf {
        self.store_dir().join("records.jsonl")
    }

    pub fn actions_path(&self) -> PathBuf {
        self.store_dir().join("actions.jsonl")
    }

    pub fn rewards_path(&self) -> PathBuf {
        self.store_dir().join("rewards.jsonl")
    }

    pub fn processed_path(&self) -> PathBuf {
        self.state_dir().join("processed.json")
    }

    pub fn runs_index_path(&self) -> PathBuf {
        self.state_dir().join("runs.ann")
    }

    pub fn runs_meta_path(&self) -> PathBuf {
        self.state_dir().join("runs_meta.jsonl")
    }

    pub fn ledger_index_path(&self) -> PathBuf {
        self.state_dir().join("ledger.ann")
    }

    pub fn ledger_meta_path(&self) -> PathBuf {
        self.state_dir().join("ledger_meta.jsonl")
    }

    pub fn goal_cursor_path(&self) -> PathBuf {
        self.state_dir().join("goal_cursor.json")
    }

    /// Create the store/state/logs skeleton and touch the NDJSON logs.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [self.store_dir(), self.state_dir(), self.root.join("logs")] {
            fs::create_dir_all(dir)?;
        }
        for path in [self.records_path(), self.actions_path(), self.rewards_path()] {
            if !path.exists() {
                fs::write(&path, "")?;
            }
        }
        fs::create_dir_all(&self.reports_dir)?;
        Ok(())
    }
}

/// Ingestion identity for a file: `<name>|<size>|<mtime>`.
pub fn file_key(path: &Path) -> std::io::Result<String> {
    let meta = fs::metadata(path)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(format!("{}|{}|{}", name, meta.len(), mtime))
}

/// Processed-key state with atomic write-temp + rename flush.
#[derive(Debug, Default)]
pub struct ProcessedState {
    entries: BTreeMap<String, Value>,
}

impl ProcessedState {
    pub fn load(path: &Path) -> Self {
        let entries = fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<BTreeMap<String, Value>>(&text).ok())
            .unwrap_or_default();
        Self { entries }
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn put(&mut self, key: String, record: Value) {
        self.entries.insert(key, record);
    }

    pub fn flush(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(&self.entries)
            .unwrap_or_else(|_| "{}".to_string());
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Standard processed payload for a source path.
    pub fn stamp(source_key: &str, source: &Path) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("processed_utc".to_string(), Value::String(utc_now()));
        map.insert(
            source_key.to_string(),
            Value::String(source.display().to_string()),
        );
        Value::Object(map)
    }
}

/// Append one JSON document to an NDJSON log.
pub fn append_jsonl<T: Serialize>(path: &Path, payload: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut handle = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    writeln!(handle, "{line}")?;
    Ok(())
}

/// Read every parseable line of an NDJSON log.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
