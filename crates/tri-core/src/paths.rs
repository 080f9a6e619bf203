// Path Resolution
// One Paths value per invocation; every env read happens here.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tri_types::Project;

/// Resolved filesystem layout for one invocation.
///
/// Built once from env + inferred roots and passed as a collaborator so the
/// rest of the system never touches `std::env`.
#[derive(Debug, Clone, Serialize)]
pub struct Paths {
    pub tool_root: PathBuf,
    pub tri_root: PathBuf,
    pub state_dir: PathBuf,
    pub ignore_build_lock: bool,
    pub legacy_queue_root: Option<PathBuf>,
}

impl Paths {
    /// Resolve from the process environment.
    pub fn resolve() -> Self {
        let tool_root = resolve_tool_root();
        let tri_root = resolve_tri_root(&tool_root);
        let state_dir = resolve_state_dir(&tri_root);
        let ignore_build_lock =
            std::env::var("HEADLESSCTL_IGNORE_LOCK").map(|v| v == "1").unwrap_or(false);
        let legacy_queue_root = std::env::var("POLISH_QUEUE_ROOT")
            .or_else(|_| std::env::var("POLISH_QUEUE"))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Self {
            tool_root,
            tri_root,
            state_dir,
            ignore_build_lock,
            legacy_queue_root,
        }
    }

    /// Fixed-root constructor for tests and embedded callers.
    pub fn with_roots(tool_root: PathBuf, tri_root: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            tool_root,
            tri_root,
            state_dir,
            ignore_build_lock: false,
            legacy_queue_root: None,
        }
    }

    pub fn is_tri_root_valid(&self) -> bool {
        is_tri_root(&self.tri_root)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("ops").join("locks")
    }

    pub fn build_lock_path(&self) -> PathBuf {
        self.locks_dir().join("build.lock")
    }

    pub fn build_state_path(&self) -> PathBuf {
        self.locks_dir().join("build.state.json")
    }

    pub fn session_lock_path(&self) -> PathBuf {
        self.locks_dir().join("nightly_session.lock")
    }

    pub fn nightly_lock_path(&self) -> PathBuf {
        self.locks_dir().join("nightly.lock")
    }

    /// Legacy session-lock locations reclaimed before the primary claim.
    pub fn legacy_session_lock_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(queue_root) = &self.legacy_queue_root {
            paths.push(queue_root.join("reports").join("nightly_session.lock"));
        }
        #[cfg(windows)]
        paths.push(PathBuf::from(r"C:\polish\queue\reports\nightly_session.lock"));
        #[cfg(not(windows))]
        paths.push(PathBuf::from("/mnt/c/polish/queue/reports/nightly_session.lock"));
        paths.dedup();
        paths
    }

    pub fn build_pointer_path(&self, project: Project) -> PathBuf {
        self.state_dir
            .join("builds")
            .join(format!("current_{}.json", project.as_str()))
    }

    /// Conventional binary location used when no build pointer exists.
    pub fn conventional_binary_path(&self, project: Project) -> PathBuf {
        let builds = self.tri_root.join("Tools").join("builds");
        match project {
            Project::Godgame => builds
                .join("godgame")
                .join("Linux_latest")
                .join("Godgame_Headless.x86_64"),
            Project::Space4x => builds
                .join("space4x")
                .join("Linux_latest")
                .join("Space4X_Headless.x86_64"),
            Project::Puredots => builds
                .join("puredots")
                .join("Linux_latest")
                .join("PureDots_Headless.x86_64"),
        }
    }

    pub fn tasks_registry_path(&self) -> PathBuf {
        self.tool_root.join("registry").join("tasks.json")
    }

    pub fn packs_registry_path(&self) -> PathBuf {
        self.tool_root.join("registry").join("packs.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Resolve a repo-relative scenario path against the tri root.
    pub fn scenario_abs(&self, scenario_path: &str) -> PathBuf {
        let path = Path::new(scenario_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.tri_root.join(path)
        }
    }
}

/// A tri root hosts the three simulator projects plus the Tools tree.
pub fn is_tri_root(path: &Path) -> bool {
    ["godgame", "space4x", "puredots", "Tools"]
        .iter()
        .all(|name| path.join(name).is_dir())
}

fn resolve_tool_root() -> PathBuf {
    for key in ["HEADLESS_REBUILD_TOOL_ROOT", "HEADLESS_TOOL_ROOT"] {
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                return PathBuf::from(value);
            }
        }
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .and_then(|dir| dir.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn resolve_tri_root(tool_root: &Path) -> PathBuf {
    for key in ["TRI_ROOT", "GITHUB_WORKSPACE"] {
        if let Ok(value) = std::env::var(key) {
            let candidate = PathBuf::from(value);
            if is_tri_root(&candidate) {
                return candidate;
            }
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        if is_tri_root(&cwd) {
            return cwd;
        }
        if let Some(parent) = cwd.parent() {
            if is_tri_root(parent) {
                return parent.to_path_buf();
            }
        }
    }

    if let Some(parent) = tool_root.parent() {
        let sibling = parent.join("Tri");
        if is_tri_root(&sibling) {
            return sibling;
        }
    }

    if let Some(root) = git_toplevel() {
        if is_tri_root(&root) {
            return root;
        }
    }

    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn git_toplevel() -> Option<PathBuf> {
    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(PathBuf::from(text))
    }
}

fn resolve_state_dir(tri_root: &Path) -> PathBuf {
    if let Ok(value) = std::env::var("TRI_STATE_DIR") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    if let Some(home) = dirs::home_dir() {
        if home_writable(&home) {
            let base = std::env::var("XDG_STATE_HOME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(".local").join("state"));
            return base.join("tri-headless");
        }
    }
    tri_root.join(".tri").join("state")
}

fn home_writable(home: &Path) -> bool {
    home.metadata()
        .map(|meta| !meta.permissions().readonly())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_tri_root(dir: &Path) {
        for name in ["godgame", "space4x", "puredots", "Tools"] {
            fs::create_dir_all(dir.join(name)).unwrap();
        }
    }

    #[test]
    fn tri_root_requires_all_project_dirs() {
        let temp = tempfile::tempdir().unwrap();
        assert!(!is_tri_root(temp.path()));
        make_tri_root(temp.path());
        assert!(is_tri_root(temp.path()));
    }

    #[test]
    fn scenario_abs_joins_relative_paths() {
        let temp = tempfile::tempdir().unwrap();
        let paths = Paths::with_roots(
            temp.path().join("tool"),
            temp.path().join("tri"),
            temp.path().join("state"),
        );
        assert_eq!(
            paths.scenario_abs("scenarios/x.json"),
            temp.path().join("tri").join("scenarios/x.json")
        );
        assert_eq!(
            paths.scenario_abs("/abs/x.json"),
            PathBuf::from("/abs/x.json")
        );
    }

    #[test]
    fn build_pointer_path_is_per_project() {
        let temp = tempfile::tempdir().unwrap();
        let paths = Paths::with_roots(
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            temp.path().join("state"),
        );
        assert!(paths
            .build_pointer_path(Project::Space4x)
            .ends_with("builds/current_space4x.json"));
    }
}
