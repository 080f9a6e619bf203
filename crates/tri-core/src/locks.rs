// Lock Manager
// Build lock (external writer), session lock (ours, exclusive), nightly lock.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tri_types::{parse_utc, utc_now};

use crate::paths::Paths;

/// Default TTL before a session lock is considered stale (90 minutes).
pub const DEFAULT_SESSION_LOCK_TTL_SEC: u64 = 90 * 60;

/// Payload written into the session lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLockPayload {
    pub run_id: String,
    pub pid: u32,
    pub host: String,
    pub started_utc: String,
    pub purpose: String,
}

/// Outcome of a session-lock claim attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimOutcome {
    pub acquired: bool,
    pub lock_path: PathBuf,
    pub lock: Option<SessionLockPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Outcome of a session-lock release.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    pub released: bool,
    pub lock_path: PathBuf,
    pub lock: Option<SessionLockPayload>,
}

/// Returns the blocking lock path when a build lock is active.
///
/// `build.state.json` wins over the bare `build.lock` file; an unreadable
/// state file or an unknown state counts as locked.
pub fn check_build_lock(paths: &Paths) -> Option<PathBuf> {
    if paths.ignore_build_lock {
        return None;
    }
    let state_path = paths.build_state_path();
    if state_path.exists() {
        let state = fs::read_to_string(&state_path)
            .ok()
            .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
            .and_then(|doc| doc.get("state").and_then(|v| v.as_str()).map(String::from));
        return match state.as_deref() {
            Some("unlocked") => None,
            _ => Some(state_path),
        };
    }
    let lock_path = paths.build_lock_path();
    if lock_path.exists() {
        return Some(lock_path);
    }
    None
}

fn read_session_lock(path: &Path) -> Option<SessionLockPayload> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn is_lock_stale(path: &Path, payload: Option<&SessionLockPayload>, ttl_sec: u64) -> bool {
    let now = Utc::now();
    if let Some(started) = payload.and_then(|p| parse_utc(&p.started_utc)) {
        if (now - started).num_seconds() > ttl_sec as i64 {
            return true;
        }
    }
    if let Ok(meta) = fs::metadata(path) {
        if let Ok(mtime) = meta.modified() {
            let mtime: chrono::DateTime<Utc> = mtime.into();
            if (now - mtime).num_seconds() > ttl_sec as i64 {
                return true;
            }
        }
    }
    false
}

fn stale_stamp() -> String {
    utc_now().replace(':', "").replace('Z', "")
}

/// Rename a stale lock aside; fall back to unlink when rename fails.
fn retire_lock(path: &Path) -> Option<PathBuf> {
    let stale_path = PathBuf::from(format!("{}.stale.{}", path.display(), stale_stamp()));
    match fs::rename(path, &stale_path) {
        Ok(()) => Some(stale_path),
        Err(_) => {
            let _ = fs::remove_file(path);
            None
        }
    }
}

/// Result of probing the legacy lock locations.
enum LegacyState {
    Clear,
    Reclaimed(PathBuf),
    Held {
        path: PathBuf,
        lock: Option<SessionLockPayload>,
    },
}

fn check_legacy_locks(paths: &Paths, ttl_sec: u64) -> LegacyState {
    for path in paths.legacy_session_lock_paths() {
        if !path.exists() {
            continue;
        }
        let payload = read_session_lock(&path);
        if is_lock_stale(&path, payload.as_ref(), ttl_sec) {
            retire_lock(&path);
            return LegacyState::Reclaimed(path);
        }
        return LegacyState::Held {
            path,
            lock: payload,
        };
    }
    LegacyState::Clear
}

/// Claim the session lock with create-exclusive semantics.
///
/// Loop: reclaim a stale holder by rename, retry; otherwise report the
/// current holder without acquiring.
pub fn claim_session_lock(
    paths: &Paths,
    ttl_sec: u64,
    purpose: &str,
    run_id: Option<&str>,
) -> ClaimOutcome {
    let lock_path = paths.session_lock_path();
    if let Some(parent) = lock_path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    if let LegacyState::Held { path, lock } = check_legacy_locks(paths, ttl_sec) {
        return ClaimOutcome {
            acquired: false,
            lock_path: path,
            lock,
            warning: Some("legacy_session_lock_present".to_string()),
        };
    }

    let payload = SessionLockPayload {
        run_id: run_id
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        pid: std::process::id(),
        host: hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        started_utc: utc_now(),
        purpose: purpose.to_string(),
    };

    loop {
        if lock_path.exists() {
            let current = read_session_lock(&lock_path);
            if is_lock_stale(&lock_path, current.as_ref(), ttl_sec) {
                retire_lock(&lock_path);
                continue;
            }
            return ClaimOutcome {
                acquired: false,
                lock_path,
                lock: current,
                warning: None,
            };
        }
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(mut handle) => {
                let text = serde_json::to_string_pretty(&payload)
                    .unwrap_or_else(|_| "{}".to_string());
                let _ = handle.write_all(text.as_bytes());
                tracing::info!(
                    lock_path = %lock_path.display(),
                    run_id = %payload.run_id,
                    "session lock acquired"
                );
                return ClaimOutcome {
                    acquired: true,
                    lock_path,
                    lock: Some(payload),
                    warning: None,
                };
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                tracing::warn!(
                    lock_path = %lock_path.display(),
                    error = %err,
                    "session lock create failed"
                );
                return ClaimOutcome {
                    acquired: false,
                    lock_path,
                    lock: None,
                    warning: Some("lock_create_failed".to_string()),
                };
            }
        }
    }
}

/// Release the session lock. Idempotent; refuses when a `run_id` is supplied
/// and does not match the holder.
pub fn release_session_lock(paths: &Paths, run_id: Option<&str>) -> ReleaseOutcome {
    let lock_path = paths.session_lock_path();
    if !lock_path.exists() {
        return ReleaseOutcome {
            released: false,
            lock_path,
            lock: None,
        };
    }
    let payload = read_session_lock(&lock_path);
    if let (Some(expected), Some(current)) = (run_id, payload.as_ref()) {
        if !current.run_id.is_empty() && current.run_id != expected {
            return ReleaseOutcome {
                released: false,
                lock_path,
                lock: payload,
            };
        }
    }
    let released = fs::remove_file(&lock_path).is_ok();
    ReleaseOutcome {
        released,
        lock_path,
        lock: payload,
    }
}

/// Read the current session lock without touching it.
pub fn show_session_lock(paths: &Paths) -> (PathBuf, Option<SessionLockPayload>) {
    let lock_path = paths.session_lock_path();
    let payload = if lock_path.exists() {
        read_session_lock(&lock_path)
    } else {
        None
    };
    (lock_path, payload)
}

/// Reclaim stale primary and legacy session locks; returns reclaimed paths.
pub fn cleanup_session_locks(paths: &Paths, ttl_sec: u64) -> Vec<PathBuf> {
    let mut reclaimed = Vec::new();
    if let LegacyState::Reclaimed(path) = check_legacy_locks(paths, ttl_sec) {
        reclaimed.push(path);
    }
    let lock_path = paths.session_lock_path();
    if lock_path.exists() {
        let payload = read_session_lock(&lock_path);
        if is_lock_stale(&lock_path, payload.as_ref(), ttl_sec) {
            retire_lock(&lock_path);
            reclaimed.push(lock_path);
        }
    }
    reclaimed
}

/// Coarse per-cycle nightly lock: presence check with TTL eviction by mtime.
pub fn check_nightly_lock(paths: &Paths, ttl_sec: u64) -> bool {
    let path = paths.nightly_lock_path();
    if !path.exists() {
        return false;
    }
    if is_lock_stale(&path, None, ttl_sec) {
        // Tolerates a concurrent delete.
        let _ = fs::remove_file(&path);
        return false;
    }
    true
}

/// Non-atomic nightly lock create.
pub fn claim_nightly_lock(paths: &Paths) {
    let path = paths.nightly_lock_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _ = fs::write(&path, utc_now());
}

pub fn clear_nightly_lock(paths: &Paths) {
    let _ = fs::remove_file(paths.nightly_lock_path());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths(temp: &tempfile::TempDir) -> Paths {
        Paths::with_roots(
            temp.path().join("tool"),
            temp.path().join("tri"),
            temp.path().join("state"),
        )
    }

    #[test]
    fn claim_then_contend_then_release() {
        let temp = tempfile::tempdir().unwrap();
        let paths = test_paths(&temp);

        let first = claim_session_lock(&paths, 3600, "nightly", None);
        assert!(first.acquired);
        let holder = first.lock.as_ref().unwrap().run_id.clone();

        let second = claim_session_lock(&paths, 3600, "nightly", None);
        assert!(!second.acquired);
        assert_eq!(second.lock.unwrap().run_id, holder);

        let released = release_session_lock(&paths, None);
        assert!(released.released);

        let third = claim_session_lock(&paths, 3600, "nightly", None);
        assert!(third.acquired);
    }

    #[test]
    fn release_refuses_on_run_id_mismatch() {
        let temp = tempfile::tempdir().unwrap();
        let paths = test_paths(&temp);
        let claim = claim_session_lock(&paths, 3600, "nightly", None);
        assert!(claim.acquired);

        let denied = release_session_lock(&paths, Some("not-the-holder"));
        assert!(!denied.released);
        assert!(paths.session_lock_path().exists());

        let holder = claim.lock.unwrap().run_id;
        let granted = release_session_lock(&paths, Some(&holder));
        assert!(granted.released);
    }

    #[test]
    fn release_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let paths = test_paths(&temp);
        let outcome = release_session_lock(&paths, None);
        assert!(!outcome.released);
        assert!(outcome.lock.is_none());
    }

    #[test]
    fn stale_lock_is_renamed_aside_and_reclaimed() {
        let temp = tempfile::tempdir().unwrap();
        let paths = test_paths(&temp);
        let lock_path = paths.session_lock_path();
        fs::create_dir_all(lock_path.parent().unwrap()).unwrap();

        let stale = SessionLockPayload {
            run_id: "old".into(),
            pid: 1,
            host: "h".into(),
            started_utc: "2000-01-01T00:00:00Z".into(),
            purpose: "nightly".into(),
        };
        fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let claim = claim_session_lock(&paths, 3600, "nightly", None);
        assert!(claim.acquired);

        let stale_files: Vec<_> = fs::read_dir(lock_path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".stale."))
            .collect();
        assert_eq!(stale_files.len(), 1);
    }

    #[test]
    fn build_lock_state_file_wins_over_lock_file() {
        let temp = tempfile::tempdir().unwrap();
        let paths = test_paths(&temp);
        fs::create_dir_all(paths.locks_dir()).unwrap();

        fs::write(paths.build_state_path(), r#"{"state":"unlocked"}"#).unwrap();
        fs::write(paths.build_lock_path(), "x").unwrap();
        assert!(check_build_lock(&paths).is_none());

        fs::write(paths.build_state_path(), r#"{"state":"locked"}"#).unwrap();
        assert_eq!(check_build_lock(&paths), Some(paths.build_state_path()));

        fs::write(paths.build_state_path(), "not json").unwrap();
        assert_eq!(check_build_lock(&paths), Some(paths.build_state_path()));
    }

    #[test]
    fn build_lock_fallback_file_blocks() {
        let temp = tempfile::tempdir().unwrap();
        let paths = test_paths(&temp);
        fs::create_dir_all(paths.locks_dir()).unwrap();
        assert!(check_build_lock(&paths).is_none());
        fs::write(paths.build_lock_path(), "x").unwrap();
        assert_eq!(check_build_lock(&paths), Some(paths.build_lock_path()));
    }

    #[test]
    fn ignore_lock_env_override() {
        let temp = tempfile::tempdir().unwrap();
        let mut paths = test_paths(&temp);
        fs::create_dir_all(paths.locks_dir()).unwrap();
        fs::write(paths.build_lock_path(), "x").unwrap();
        paths.ignore_build_lock = true;
        assert!(check_build_lock(&paths).is_none());
    }

    #[test]
    fn nightly_lock_lifecycle() {
        let temp = tempfile::tempdir().unwrap();
        let paths = test_paths(&temp);
        assert!(!check_nightly_lock(&paths, 3600));
        claim_nightly_lock(&paths);
        assert!(check_nightly_lock(&paths, 3600));
        clear_nightly_lock(&paths);
        assert!(!check_nightly_lock(&paths, 3600));
    }
}
