// Run Directories
// Enumeration of <state>/runs and the retention cleanup policies.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tri_types::parse_utc;

use crate::paths::Paths;

/// One entry under `<state>/runs`, result.json parsed when readable.
#[derive(Debug, Clone)]
pub struct RunDirEntry {
    pub run_id: String,
    pub path: PathBuf,
    pub result: Option<Value>,
    pub ended_utc: Option<String>,
    pub task_id: Option<String>,
}

impl RunDirEntry {
    fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_utc.as_deref().and_then(parse_utc)
    }
}

/// Enumerate run directories, tolerating missing or corrupt result files.
pub fn iter_runs(paths: &Paths) -> Vec<RunDirEntry> {
    let runs_dir = paths.runs_dir();
    let Ok(read_dir) = fs::read_dir(&runs_dir) else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let run_id = entry.file_name().to_string_lossy().to_string();
        let result = fs::read_to_string(path.join("result.json"))
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok());
        let ended_utc = result.as_ref().and_then(|r| {
            r.get("ended_utc")
                .or_else(|| r.get("started_utc"))
                .and_then(|v| v.as_str())
                .map(String::from)
        });
        let task_id = result
            .as_ref()
            .and_then(|r| r.get("task_id").and_then(|v| v.as_str()).map(String::from));
        entries.push(RunDirEntry {
            run_id,
            path,
            result,
            ended_utc,
            task_id,
        });
    }
    entries
}

/// Most recent prior run of `task_id` by ended_utc, excluding one run id.
pub fn find_previous_run(paths: &Paths, task_id: &str, exclude_run_id: &str) -> Option<Value> {
    let mut candidates: Vec<(String, Value)> = iter_runs(paths)
        .into_iter()
        .filter(|entry| entry.task_id.as_deref() == Some(task_id))
        .filter(|entry| entry.run_id != exclude_run_id)
        .filter_map(|entry| {
            let ended = entry.ended_utc.clone()?;
            let result = entry.result?;
            Some((ended, result))
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));
    candidates.pop().map(|(_, result)| result)
}

/// Total on-disk size of a run directory.
pub fn run_dir_size(path: &PathBuf) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![path.clone()];
    while let Some(dir) = stack.pop() {
        let Ok(read_dir) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in read_dir.flatten() {
            let entry_path = entry.path();
            if entry_path.is_dir() {
                stack.push(entry_path);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

/// Apply the retention policies in order: age, per-task count, byte budget.
/// Returns the removed run ids.
pub fn cleanup_runs(
    paths: &Paths,
    days: Option<u64>,
    keep_per_task: Option<usize>,
    max_bytes: Option<u64>,
) -> Vec<String> {
    let mut entries = iter_runs(paths);
    let now = Utc::now();
    let mut removed = Vec::new();

    if let Some(days) = days {
        let cutoff = now - chrono::Duration::days(days as i64);
        let (expired, kept): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|entry| entry.ended_at().map(|t| t < cutoff).unwrap_or(false));
        for entry in expired {
            removed.push(entry.run_id.clone());
            let _ = fs::remove_dir_all(&entry.path);
        }
        entries = kept;
    }

    if let Some(keep) = keep_per_task {
        let mut by_task: std::collections::BTreeMap<String, Vec<RunDirEntry>> =
            std::collections::BTreeMap::new();
        for entry in entries {
            let task_id = entry.task_id.clone().unwrap_or_else(|| "unknown".to_string());
            by_task.entry(task_id).or_default().push(entry);
        }
        let mut kept = Vec::new();
        for (_, mut runs) in by_task {
            runs.sort_by_key(|entry| std::cmp::Reverse(entry.ended_at().unwrap_or(now)));
            for (index, entry) in runs.into_iter().enumerate() {
                if index < keep {
                    kept.push(entry);
                } else {
                    removed.push(entry.run_id.clone());
                    let _ = fs::remove_dir_all(&entry.path);
                }
            }
        }
        entries = kept;
    }

    if let Some(max_bytes) = max_bytes {
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.ended_at().unwrap_or(now)));
        let sizes: Vec<u64> = entries.iter().map(|e| run_dir_size(&e.path)).collect();
        let mut total: u64 = sizes.iter().sum();
        if total > max_bytes {
            for (entry, size) in entries.iter().zip(sizes.iter()).rev() {
                if total <= max_bytes {
                    break;
                }
                removed.push(entry.run_id.clone());
                total = total.saturating_sub(*size);
                let _ = fs::remove_dir_all(&entry.path);
            }
        }
    }

    removed
}
