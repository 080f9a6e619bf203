// Registry Loader
// Typed loading of the tasks and packs tables.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tri_types::{PackRegistry, TaskRegistry};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry not found: {0}")]
    Missing(String),
    #[error("registry unreadable at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("registry malformed at {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn read_registry_text(path: &Path) -> Result<String, RegistryError> {
    if !path.exists() {
        return Err(RegistryError::Missing(path.display().to_string()));
    }
    fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.display().to_string(),
        source,
    })
}

pub fn load_task_registry(path: &Path) -> Result<TaskRegistry, RegistryError> {
    let text = read_registry_text(path)?;
    serde_json::from_str(&text).map_err(|source| RegistryError::Malformed {
        path: path.display().to_string(),
        source,
    })
}

pub fn load_pack_registry(path: &Path) -> Result<PackRegistry, RegistryError> {
    let text = read_registry_text(path)?;
    serde_json::from_str(&text).map_err(|source| RegistryError::Malformed {
        path: path.display().to_string(),
        source,
    })
}

/// Load the raw registry documents for schema policing. The contract check
/// works over untyped JSON so it can enumerate malformed fields instead of
/// failing at the first one.
pub fn load_registry_value(path: &Path) -> Result<serde_json::Value, RegistryError> {
    let text = read_registry_text(path)?;
    serde_json::from_str(&text).map_err(|source| RegistryError::Malformed {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_registry_reports_path() {
        let err = load_task_registry(Path::new("/nonexistent/tasks.json")).unwrap_err();
        assert!(matches!(err, RegistryError::Missing(_)));
    }

    #[test]
    fn typed_load_round_trips() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("tasks.json");
        fs::write(
            &path,
            serde_json::json!({
                "tasks": {
                    "P0.TIME_REWIND_MICRO": {
                        "project": "puredots",
                        "runner": "scenario_runner",
                        "scenario_path": "scenarios/p0.json",
                        "tick_budget": 500,
                        "default_pack": "nightly-default",
                        "metric_keys": ["timing.total_ms", "telemetry.truncated"]
                    }
                }
            })
            .to_string(),
        )
        .unwrap();

        let registry = load_task_registry(&path).unwrap();
        assert!(registry.tasks.contains_key("P0.TIME_REWIND_MICRO"));
    }
}
