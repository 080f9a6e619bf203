// Contract Check
// Side-effect-free schema policing over the raw registry documents.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// One structured contract finding.
#[derive(Debug, Clone, Serialize)]
pub struct ContractIssue {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ContractIssue {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            task_id: None,
            pack: None,
            key: None,
            fields: None,
            value: None,
            message: None,
        }
    }

    fn for_task(id: &str, task_id: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            ..Self::new(id)
        }
    }

    fn for_pack(id: &str, pack: &str) -> Self {
        Self {
            pack: Some(pack.to_string()),
            ..Self::new(id)
        }
    }

    fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }

    fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }
}

/// Full structured contract report.
#[derive(Debug, Clone, Serialize)]
pub struct ContractReport {
    pub ok: bool,
    pub errors: Vec<ContractIssue>,
    pub warnings: Vec<ContractIssue>,
}

const ALLOWED_PROJECTS: [&str; 3] = ["godgame", "space4x", "puredots"];
const ALLOWED_RUNNERS: [&str; 3] = ["scenario_runner", "godgame_loader", "space4x_loader"];
const SEED_OVERRIDE_RUNNERS: [&str; 2] = ["scenario_runner", "space4x_loader"];

fn as_object<'a>(value: &'a Value, key: &str) -> Option<&'a serde_json::Map<String, Value>> {
    value.get(key).and_then(|v| v.as_object())
}

/// Check both registries against the declarative contract.
///
/// Pure over its inputs: no filesystem access, no state mutation. The caller
/// maps a non-empty error list to exit 3.
pub fn contract_check(tasks_doc: &Value, packs_doc: &Value) -> ContractReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let tasks = as_object(tasks_doc, "tasks");
    let packs = as_object(packs_doc, "packs");

    if tasks.map(|t| t.is_empty()).unwrap_or(true) {
        errors.push(ContractIssue::new("tasks_empty").with_message("tasks registry is empty"));
    }
    if packs.map(|p| p.is_empty()).unwrap_or(true) {
        errors.push(ContractIssue::new("packs_empty").with_message("packs registry is empty"));
    }

    let empty = serde_json::Map::new();
    let packs = packs.unwrap_or(&empty);
    for (pack_name, pack) in packs {
        check_pack(pack_name, pack, &mut errors, &mut warnings);
    }

    if let Some(tasks) = tasks {
        for (task_id, task) in tasks {
            check_task(task_id, task, packs, &mut errors);
        }
    }

    ContractReport {
        ok: errors.is_empty(),
        errors,
        warnings,
    }
}

fn check_pack(
    pack_name: &str,
    pack: &Value,
    errors: &mut Vec<ContractIssue>,
    warnings: &mut Vec<ContractIssue>,
) {
    let Some(pack) = pack.as_object() else {
        errors.push(
            ContractIssue::for_pack("pack_invalid", pack_name)
                .with_message("pack must be an object"),
        );
        return;
    };
    if !pack.get("env").map(|v| v.is_object()).unwrap_or(false) {
        errors.push(
            ContractIssue::for_pack("pack_env_missing", pack_name)
                .with_message("pack.env must be an object"),
        );
    }
    match pack.get("caps") {
        None | Some(Value::Null) => warnings.push(
            ContractIssue::for_pack("pack_caps_missing", pack_name)
                .with_message("pack.caps missing"),
        ),
        Some(caps) if !caps.is_object() => errors.push(
            ContractIssue::for_pack("pack_caps_invalid", pack_name)
                .with_message("pack.caps must be an object"),
        ),
        Some(_) => {}
    }
}

fn check_task(
    task_id: &str,
    task: &Value,
    packs: &serde_json::Map<String, Value>,
    errors: &mut Vec<ContractIssue>,
) {
    let Some(task) = task.as_object() else {
        errors.push(
            ContractIssue::for_task("task_invalid", task_id).with_message("task must be an object"),
        );
        return;
    };

    let str_field = |name: &str| task.get(name).and_then(|v| v.as_str()).map(String::from);

    let project = str_field("project");
    let runner = str_field("runner");
    let scenario_path = str_field("scenario_path");
    let tick_budget = task.get("tick_budget").filter(|v| !v.is_null());
    let default_pack = str_field("default_pack");
    let metric_keys_value = task.get("metric_keys").filter(|v| !v.is_null());

    let mut missing = Vec::new();
    if project.as_deref().unwrap_or("").is_empty() {
        missing.push("project".to_string());
    }
    if runner.as_deref().unwrap_or("").is_empty() {
        missing.push("runner".to_string());
    }
    if scenario_path.as_deref().unwrap_or("").is_empty() {
        missing.push("scenario_path".to_string());
    }
    if tick_budget.is_none() {
        missing.push("tick_budget".to_string());
    }
    if default_pack.as_deref().unwrap_or("").is_empty() {
        missing.push("default_pack".to_string());
    }
    if metric_keys_value.is_none() {
        missing.push("metric_keys".to_string());
    }
    if !missing.is_empty() {
        let mut issue = ContractIssue::for_task("task_missing_fields", task_id);
        issue.fields = Some(missing);
        errors.push(issue);
    }

    if let Some(project) = &project {
        if !ALLOWED_PROJECTS.contains(&project.as_str()) {
            errors.push(
                ContractIssue::for_task("task_project_invalid", task_id)
                    .with_value(Value::String(project.clone())),
            );
        }
    }
    if let Some(runner) = &runner {
        if !ALLOWED_RUNNERS.contains(&runner.as_str()) {
            errors.push(
                ContractIssue::for_task("task_runner_invalid", task_id)
                    .with_value(Value::String(runner.clone())),
            );
        }
    }
    if let Some(default_pack) = &default_pack {
        if !default_pack.is_empty() && !packs.contains_key(default_pack) {
            let mut issue = ContractIssue::for_task("task_pack_missing", task_id);
            issue.pack = Some(default_pack.clone());
            errors.push(issue);
        }
    }

    let metric_keys: Vec<String> = match metric_keys_value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(_) => {
            errors.push(
                ContractIssue::for_task("task_metric_keys_invalid", task_id)
                    .with_message("metric_keys must be a list"),
            );
            Vec::new()
        }
        None => Vec::new(),
    };

    if metric_keys_value.map(|v| v.is_array()).unwrap_or(false) {
        if metric_keys.len() < 2 {
            errors.push(ContractIssue::for_task("task_metric_keys_too_few", task_id));
        }
        if !metric_keys.iter().any(|k| k == "telemetry.truncated") {
            errors.push(ContractIssue::for_task(
                "task_missing_telemetry_truncated",
                task_id,
            ));
        }
    }

    check_thresholds(task_id, task, &metric_keys, errors);
    check_variance_band(task_id, task, &metric_keys, errors);
    check_seeds(task_id, task, runner.as_deref(), errors);
}

fn check_thresholds(
    task_id: &str,
    task: &serde_json::Map<String, Value>,
    metric_keys: &[String],
    errors: &mut Vec<ContractIssue>,
) {
    let thresholds: BTreeMap<String, Value> = match task.get("thresholds") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Some(_) => {
            errors.push(ContractIssue::for_task("task_thresholds_invalid", task_id));
            BTreeMap::new()
        }
    };

    for key in thresholds.keys() {
        if !metric_keys.iter().any(|k| k == key) {
            errors.push(ContractIssue::for_task("task_thresholds_extra", task_id).with_key(key));
        }
    }

    if metric_keys.iter().any(|k| k == "telemetry.truncated") {
        match thresholds.get("telemetry.truncated") {
            Some(Value::Object(threshold)) => {
                let max = threshold.get("max");
                let max_is_zero = max.and_then(|v| v.as_f64()).map(|v| v == 0.0).unwrap_or(false);
                if !max_is_zero {
                    errors.push(
                        ContractIssue::for_task(
                            "task_telemetry_truncated_threshold_invalid",
                            task_id,
                        )
                        .with_value(max.cloned().unwrap_or(Value::Null)),
                    );
                }
            }
            _ => errors.push(ContractIssue::for_task(
                "task_telemetry_truncated_threshold_missing",
                task_id,
            )),
        }
    }
}

fn check_variance_band(
    task_id: &str,
    task: &serde_json::Map<String, Value>,
    metric_keys: &[String],
    errors: &mut Vec<ContractIssue>,
) {
    match task.get("variance_band") {
        None | Some(Value::Null) => {}
        Some(Value::Object(band)) => {
            for key in band.keys() {
                if !metric_keys.iter().any(|k| k == key) {
                    errors.push(
                        ContractIssue::for_task("task_variance_band_extra", task_id).with_key(key),
                    );
                }
            }
        }
        Some(_) => errors.push(ContractIssue::for_task("task_variance_band_invalid", task_id)),
    }
}

fn check_seeds(
    task_id: &str,
    task: &serde_json::Map<String, Value>,
    runner: Option<&str>,
    errors: &mut Vec<ContractIssue>,
) {
    let default_seeds = task.get("default_seeds");
    let seeds_as_ints: Option<Vec<i64>> = match default_seeds {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) if !items.is_empty() => {
            let parsed: Vec<Option<i64>> = items.iter().map(|v| v.as_i64()).collect();
            if parsed.iter().any(|v| v.is_none()) {
                errors.push(ContractIssue::for_task("task_default_seeds_invalid", task_id));
                None
            } else {
                Some(parsed.into_iter().flatten().collect())
            }
        }
        Some(_) => {
            errors.push(ContractIssue::for_task("task_default_seeds_invalid", task_id));
            None
        }
    };

    let seed_policy = task.get("seed_policy").and_then(|v| v.as_str());
    if let Some(policy) = seed_policy {
        if policy != "ai_polish" && policy != "none" {
            errors.push(
                ContractIssue::for_task("task_seed_policy_invalid", task_id)
                    .with_value(Value::String(policy.to_string())),
            );
        }
    }

    if seed_policy == Some("ai_polish") {
        if !runner
            .map(|r| SEED_OVERRIDE_RUNNERS.contains(&r))
            .unwrap_or(false)
        {
            let mut issue = ContractIssue::for_task("task_seed_policy_runner_invalid", task_id);
            issue.value = runner.map(|r| Value::String(r.to_string()));
            errors.push(issue);
        }
        match &seeds_as_ints {
            None => errors.push(ContractIssue::for_task(
                "task_seed_policy_seeds_missing",
                task_id,
            )),
            Some(seeds) if seeds.len() < 3 => errors.push(ContractIssue::for_task(
                "task_seed_policy_seeds_missing",
                task_id,
            )),
            Some(seeds) => {
                let mut counts: BTreeMap<i64, u32> = BTreeMap::new();
                for seed in seeds {
                    *counts.entry(*seed).or_insert(0) += 1;
                }
                let distinct = counts.len();
                let max_repeat = counts.values().copied().max().unwrap_or(0);
                if distinct < 2 || max_repeat < 2 {
                    errors.push(ContractIssue::for_task(
                        "task_seed_policy_seeds_pattern_invalid",
                        task_id,
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_pack() -> Value {
        json!({"env": {}, "caps": {"max_bytes": 1048576}})
    }

    fn valid_task() -> Value {
        json!({
            "project": "puredots",
            "runner": "scenario_runner",
            "scenario_path": "scenarios/p0.json",
            "tick_budget": 500,
            "default_pack": "nightly-default",
            "metric_keys": ["timing.total_ms", "telemetry.truncated"],
            "thresholds": {"telemetry.truncated": {"max": 0}}
        })
    }

    fn check(tasks: Value, packs: Value) -> ContractReport {
        contract_check(&json!({"tasks": tasks}), &json!({"packs": packs}))
    }

    fn error_ids(report: &ContractReport) -> Vec<&str> {
        report.errors.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn valid_registries_pass() {
        let report = check(
            json!({"T1": valid_task()}),
            json!({"nightly-default": valid_pack()}),
        );
        assert!(report.ok, "errors: {:?}", error_ids(&report));
    }

    #[test]
    fn empty_tables_fail() {
        let report = check(json!({}), json!({}));
        assert!(error_ids(&report).contains(&"tasks_empty"));
        assert!(error_ids(&report).contains(&"packs_empty"));
    }

    #[test]
    fn pack_env_and_caps_are_policed() {
        let report = check(
            json!({"T1": valid_task()}),
            json!({"nightly-default": {"caps": "nope"}}),
        );
        let ids = error_ids(&report);
        assert!(ids.contains(&"pack_env_missing"));
        assert!(ids.contains(&"pack_caps_invalid"));
    }

    #[test]
    fn pack_missing_caps_is_a_warning() {
        let report = check(
            json!({"T1": valid_task()}),
            json!({"nightly-default": {"env": {}}}),
        );
        assert!(report.ok);
        assert!(report.warnings.iter().any(|w| w.id == "pack_caps_missing"));
    }

    #[test]
    fn missing_fields_are_enumerated() {
        let report = check(
            json!({"T1": {"project": "puredots"}}),
            json!({"nightly-default": valid_pack()}),
        );
        let issue = report
            .errors
            .iter()
            .find(|e| e.id == "task_missing_fields")
            .expect("missing fields issue");
        let fields = issue.fields.as_ref().unwrap();
        assert!(fields.contains(&"runner".to_string()));
        assert!(fields.contains(&"tick_budget".to_string()));
        assert!(fields.contains(&"metric_keys".to_string()));
    }

    #[test]
    fn invalid_project_runner_and_pack_reference() {
        let mut task = valid_task();
        task["project"] = json!("minecraft");
        task["runner"] = json!("warp_drive");
        task["default_pack"] = json!("nope");
        let report = check(json!({"T1": task}), json!({"nightly-default": valid_pack()}));
        let ids = error_ids(&report);
        assert!(ids.contains(&"task_project_invalid"));
        assert!(ids.contains(&"task_runner_invalid"));
        assert!(ids.contains(&"task_pack_missing"));
    }

    #[test]
    fn metric_key_rules() {
        let mut task = valid_task();
        task["metric_keys"] = json!(["only_one"]);
        task["thresholds"] = json!({});
        let report = check(json!({"T1": task}), json!({"nightly-default": valid_pack()}));
        let ids = error_ids(&report);
        assert!(ids.contains(&"task_metric_keys_too_few"));
        assert!(ids.contains(&"task_missing_telemetry_truncated"));
    }

    #[test]
    fn truncated_threshold_must_cap_at_zero() {
        let mut task = valid_task();
        task["thresholds"] = json!({"telemetry.truncated": {"max": 1}});
        let report = check(json!({"T1": task}), json!({"nightly-default": valid_pack()}));
        assert!(error_ids(&report).contains(&"task_telemetry_truncated_threshold_invalid"));

        let mut task = valid_task();
        task["thresholds"] = json!({});
        let report = check(json!({"T1": task}), json!({"nightly-default": valid_pack()}));
        assert!(error_ids(&report).contains(&"task_telemetry_truncated_threshold_missing"));
    }

    #[test]
    fn threshold_and_band_keys_must_be_declared() {
        let mut task = valid_task();
        task["thresholds"] = json!({
            "telemetry.truncated": {"max": 0},
            "not_a_metric": {"min": 1}
        });
        task["variance_band"] = json!({"also_not_a_metric": 2.0});
        let report = check(json!({"T1": task}), json!({"nightly-default": valid_pack()}));
        let ids = error_ids(&report);
        assert!(ids.contains(&"task_thresholds_extra"));
        assert!(ids.contains(&"task_variance_band_extra"));
    }

    #[test]
    fn ai_polish_seed_pattern_is_enforced() {
        let mut task = valid_task();
        task["seed_policy"] = json!("ai_polish");
        task["default_seeds"] = json!([1, 2, 3]);
        let report = check(json!({"T1": task}), json!({"nightly-default": valid_pack()}));
        assert!(error_ids(&report).contains(&"task_seed_policy_seeds_pattern_invalid"));

        let mut task = valid_task();
        task["seed_policy"] = json!("ai_polish");
        task["default_seeds"] = json!([1, 1, 2]);
        let report = check(json!({"T1": task}), json!({"nightly-default": valid_pack()}));
        assert!(report.ok, "errors: {:?}", error_ids(&report));
    }

    #[test]
    fn ai_polish_requires_override_runner_and_seeds() {
        let mut task = valid_task();
        task["runner"] = json!("godgame_loader");
        task["seed_policy"] = json!("ai_polish");
        let report = check(json!({"T1": task}), json!({"nightly-default": valid_pack()}));
        let ids = error_ids(&report);
        assert!(ids.contains(&"task_seed_policy_runner_invalid"));
        assert!(ids.contains(&"task_seed_policy_seeds_missing"));
    }
}
