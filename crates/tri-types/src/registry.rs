// Registry Entities
// Declarative task and pack tables consumed by the orchestrator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Simulator project a task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Project {
    Godgame,
    Space4x,
    Puredots,
}

impl Project {
    pub fn as_str(&self) -> &'static str {
        match self {
            Project::Godgame => "godgame",
            Project::Space4x => "space4x",
            Project::Puredots => "puredots",
        }
    }
}

impl std::fmt::Display for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution harness the simulator binary is driven through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Runner {
    ScenarioRunner,
    GodgameLoader,
    Space4xLoader,
}

impl Runner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Runner::ScenarioRunner => "scenario_runner",
            Runner::GodgameLoader => "godgame_loader",
            Runner::Space4xLoader => "space4x_loader",
        }
    }

    /// Runners whose scenario JSON accepts a seed override copy.
    pub fn supports_seed_override(&self) -> bool {
        matches!(self, Runner::ScenarioRunner | Runner::Space4xLoader)
    }
}

impl std::fmt::Display for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multi-seed evaluation policy attached to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    None,
    AiPolish,
}

impl Default for SeedPolicy {
    fn default() -> Self {
        SeedPolicy::None
    }
}

/// Min/max bounds applied to a single metric key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Resource caps a pack applies to a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackCaps {
    /// Telemetry byte budget; exceeding it marks `telemetry.truncated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
}

/// Named environment + artifact policy overlay applied at run time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pack {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caps: Option<PackCaps>,
    /// Artifact names to keep; `None` keeps every produced artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_include: Option<Vec<String>>,
    #[serde(default)]
    pub artifacts_exclude: Vec<String>,
    #[serde(default)]
    pub compress_jsonl: bool,
}

fn default_timeout_s() -> u64 {
    600
}

fn default_bank_strict() -> bool {
    true
}

/// Immutable declarative unit of work: binary + scenario + evaluation contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub project: Project,
    pub runner: Runner,
    pub scenario_path: String,
    pub tick_budget: u64,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    pub default_pack: String,
    #[serde(default)]
    pub metric_keys: Vec<String>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Threshold>,
    #[serde(default)]
    pub variance_band: BTreeMap<String, f64>,
    #[serde(default)]
    pub default_seeds: Vec<u64>,
    #[serde(default)]
    pub seed_policy: SeedPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_bank: Option<String>,
    #[serde(default = "default_bank_strict")]
    pub bank_strict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_exit_codes: Option<Vec<i32>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nightly_order: Option<i64>,
    #[serde(default)]
    pub allow_fail: bool,
    #[serde(default)]
    pub validate_allow_error_codes: Vec<String>,
    #[serde(default)]
    pub validate_allow_invariant_failures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_metric_keys: Option<Vec<String>>,
}

impl Task {
    /// Exit codes the run outcome accepts. Zero is always included.
    pub fn effective_allow_exit_codes(&self) -> Vec<i32> {
        let mut codes = self.allow_exit_codes.clone().unwrap_or_default();
        if !codes.contains(&0) {
            codes.push(0);
        }
        codes
    }

    /// Wall-clock budget, falling back to the default when unset or zero.
    pub fn effective_timeout_s(&self) -> u64 {
        if self.timeout_s == 0 {
            default_timeout_s()
        } else {
            self.timeout_s
        }
    }
}

/// Top-level `tasks.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRegistry {
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
}

/// Top-level `packs.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackRegistry {
    #[serde(default)]
    pub packs: BTreeMap<String, Pack>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_task_json() -> serde_json::Value {
        serde_json::json!({
            "project": "godgame",
            "runner": "scenario_runner",
            "scenario_path": "scenarios/p0_time_rewind.json",
            "tick_budget": 1000,
            "default_pack": "nightly-default",
            "metric_keys": ["timing.total_ms", "telemetry.truncated"]
        })
    }

    #[test]
    fn task_defaults_apply() {
        let task: Task = serde_json::from_value(minimal_task_json()).unwrap();
        assert_eq!(task.timeout_s, 600);
        assert!(task.bank_strict);
        assert_eq!(task.seed_policy, SeedPolicy::None);
        assert!(task.allow_exit_codes.is_none());
    }

    #[test]
    fn allow_exit_codes_always_include_zero() {
        let mut task: Task = serde_json::from_value(minimal_task_json()).unwrap();
        task.allow_exit_codes = Some(vec![2, 3]);
        assert_eq!(task.effective_allow_exit_codes(), vec![2, 3, 0]);
        task.allow_exit_codes = None;
        assert_eq!(task.effective_allow_exit_codes(), vec![0]);
    }

    #[test]
    fn runner_seed_override_support() {
        assert!(Runner::ScenarioRunner.supports_seed_override());
        assert!(Runner::Space4xLoader.supports_seed_override());
        assert!(!Runner::GodgameLoader.supports_seed_override());
    }

    #[test]
    fn project_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Project::Space4x).unwrap(),
            "\"space4x\""
        );
    }
}
