// Metric Diffing
// Compare two runs of a task over its declared metric keys.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tri_types::Task;

/// Per-key value and distribution deltas.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricDiff {
    pub a: Option<Value>,
    pub b: Option<Value>,
    pub delta: Option<f64>,
    pub mean_a: Option<f64>,
    pub mean_b: Option<f64>,
    pub delta_mean: Option<f64>,
    pub stdev_a: Option<f64>,
    pub stdev_b: Option<f64>,
}

/// Per-key grading against thresholds and the variance band.
#[derive(Debug, Clone, Serialize)]
pub struct MetricGrade {
    pub pass_threshold: bool,
    pub within_band: bool,
    pub threshold: Value,
    pub variance_band: Option<f64>,
}

/// diff_metrics output.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsDiff {
    pub task_id: Option<String>,
    pub diffs: BTreeMap<String, MetricDiff>,
    pub grades: BTreeMap<String, MetricGrade>,
    pub pass: bool,
}

fn stat_field(result: &Value, key: &str, field: &str) -> Option<f64> {
    result
        .get("metrics_stats")?
        .get(key)?
        .get(field)?
        .as_f64()
}

/// Diff run B against run A over the task's metric keys.
///
/// `diff_metrics(r, r)` yields zero deltas everywhere and `pass = true`.
pub fn diff_metrics(run_a: &Value, run_b: &Value, task: Option<&Task>) -> MetricsDiff {
    let task_id = run_b
        .get("task_id")
        .or_else(|| run_a.get("task_id"))
        .and_then(|v| v.as_str())
        .map(String::from);

    let metric_keys: Vec<String> = task.map(|t| t.metric_keys.clone()).unwrap_or_default();
    let empty = serde_json::Map::new();
    let summary_a = run_a
        .get("metrics_summary")
        .and_then(|v| v.as_object())
        .unwrap_or(&empty);
    let summary_b = run_b
        .get("metrics_summary")
        .and_then(|v| v.as_object())
        .unwrap_or(&empty);

    let mut diffs = BTreeMap::new();
    let mut grades = BTreeMap::new();

    for key in &metric_keys {
        let value_a = summary_a.get(key).cloned();
        let value_b = summary_b.get(key).cloned();
        let delta = match (
            value_a.as_ref().and_then(|v| v.as_f64()),
            value_b.as_ref().and_then(|v| v.as_f64()),
        ) {
            (Some(a), Some(b)) => Some(b - a),
            _ => None,
        };
        let mean_a = stat_field(run_a, key, "mean");
        let mean_b = stat_field(run_b, key, "mean");
        let delta_mean = match (mean_a, mean_b) {
            (Some(a), Some(b)) => Some(b - a),
            _ => None,
        };

        diffs.insert(
            key.clone(),
            MetricDiff {
                a: value_a,
                b: value_b.clone(),
                delta,
                mean_a,
                mean_b,
                delta_mean,
                stdev_a: stat_field(run_a, key, "stdev"),
                stdev_b: stat_field(run_b, key, "stdev"),
            },
        );

        let threshold = task
            .and_then(|t| t.thresholds.get(key))
            .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let value_b_num = value_b.as_ref().and_then(|v| v.as_f64());
        let mut pass_threshold = true;
        if let Some(threshold_spec) = task.and_then(|t| t.thresholds.get(key)) {
            if let (Some(min), Some(value)) = (threshold_spec.min, value_b_num) {
                pass_threshold = pass_threshold && value >= min;
            }
            if let (Some(max), Some(value)) = (threshold_spec.max, value_b_num) {
                pass_threshold = pass_threshold && value <= max;
            }
        }
        let band = task.and_then(|t| t.variance_band.get(key)).copied();
        let within_band = match (band, delta) {
            (Some(band), Some(delta)) => delta.abs() <= band,
            _ => true,
        };

        grades.insert(
            key.clone(),
            MetricGrade {
                pass_threshold,
                within_band,
                threshold,
                variance_band: band,
            },
        );
    }

    let pass = grades
        .values()
        .all(|grade| grade.pass_threshold && grade.within_band);

    MetricsDiff {
        task_id,
        diffs,
        grades,
        pass,
    }
}
