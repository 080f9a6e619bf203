// Run Results
// The result.json shapes written by the orchestrator, single- and multi-seed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;
use crate::registry::{Project, Runner};

/// One simulator-emitted PASS/FAIL assertion keyed by test id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankResult {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub raw: String,
}

impl BankResult {
    pub fn passed(&self) -> bool {
        self.status == "PASS"
    }
}

/// Data-quality invariant evaluated over a telemetry stream.
///
/// Extras differ per invariant, so every non-core field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvariantCheck {
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_tick: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_bytes: Option<u64>,
}

/// Per-key running statistics from the telemetry scan or seed aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdev: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
}

/// Variance evaluation for one metric key across seed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceGrade {
    pub band: f64,
    pub spread: f64,
    pub count: u64,
    pub pass: bool,
}

/// Single-seed `result.json`. Written exactly once per run directory and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub ok: bool,
    pub error_code: ErrorCode,
    #[serde(default)]
    pub error: Option<String>,
    pub run_id: String,
    pub task_id: String,
    pub project: Project,
    pub runner: Runner,
    pub scenario_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    pub tick_budget: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_requested: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_effective: Option<u64>,
    pub pack: String,
    pub started_utc: String,
    pub ended_utc: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub timeout_s: u64,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_required: Option<String>,
    #[serde(default)]
    pub bank_results: Vec<BankResult>,
    #[serde(default)]
    pub bank_status: Option<BankResult>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub telemetry_path: Option<String>,
    #[serde(default)]
    pub metrics_summary: BTreeMap<String, Value>,
    #[serde(default)]
    pub metrics_stats: BTreeMap<String, MetricStats>,
    #[serde(default)]
    pub invariants: Vec<InvariantCheck>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    pub tool_version: String,
    pub schema_version: u32,
}

/// Trimmed per-seed view embedded inside an aggregate result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRunView {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_requested: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_effective: Option<u64>,
    pub ok: bool,
    pub error_code: ErrorCode,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics_summary: BTreeMap<String, Value>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

/// Multi-seed `result.json` for a seed-aggregate run. References child run
/// directories but owns none of their artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResult {
    pub ok: bool,
    pub error_code: ErrorCode,
    #[serde(default)]
    pub error: Option<String>,
    pub run_id: String,
    pub task_id: String,
    pub project: Project,
    pub runner: Runner,
    pub scenario_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    pub tick_budget: u64,
    pub seeds_requested: Vec<u64>,
    pub pack: String,
    pub started_utc: String,
    pub ended_utc: String,
    pub exit_code: i32,
    #[serde(default)]
    pub metrics_summary: BTreeMap<String, Value>,
    #[serde(default)]
    pub metrics_stats: BTreeMap<String, MetricStats>,
    #[serde(default)]
    pub variance_grades: BTreeMap<String, VarianceGrade>,
    pub variance_pass: bool,
    pub eval_metrics: EvalMetrics,
    #[serde(default)]
    pub seed_runs: Vec<SeedRunView>,
    #[serde(default)]
    pub seed_run_ids: Vec<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    pub tool_version: String,
    pub schema_version: u32,
}

/// Aggregate-only evaluation counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub variance_failed_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_result_pass_check() {
        let bank = BankResult {
            id: "B1".into(),
            status: "PASS".into(),
            reason: None,
            raw: "BANK:B1:PASS".into(),
        };
        assert!(bank.passed());
        let bank = BankResult {
            status: "FAIL".into(),
            ..bank
        };
        assert!(!bank.passed());
    }

    #[test]
    fn invariant_check_omits_absent_extras() {
        let inv = InvariantCheck {
            name: "telemetry.parse_errors".into(),
            ok: true,
            value: Some(0),
            ..Default::default()
        };
        let json = serde_json::to_string(&inv).unwrap();
        assert!(json.contains("\"value\":0"));
        assert!(!json.contains("first_tick"));
        assert!(!json.contains("cap_bytes"));
    }
}
