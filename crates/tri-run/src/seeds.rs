// Seed Handling
// Seed-list parsing, the ai_polish policy, and cross-seed statistics.

use std::collections::BTreeMap;

use serde_json::Value;
use tri_types::{ErrorCode, MetricStats, RunResult, SeedPolicy, SeedRunView, Task, VarianceGrade};

/// Parse a `--seeds N,N,...` argument.
pub fn parse_seed_list(raw: &str) -> Result<Vec<u64>, ErrorCode> {
    let parts: Vec<&str> = raw
        .split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        return Err(ErrorCode::InvalidSeeds);
    }
    let mut seeds = Vec::with_capacity(parts.len());
    for part in parts {
        match part.parse::<u64>() {
            Ok(seed) => seeds.push(seed),
            Err(_) => return Err(ErrorCode::InvalidSeeds),
        }
    }
    Ok(seeds)
}

/// Resolve the effective seed list: explicit list, explicit single, or the
/// first default seed.
pub fn resolve_seed_list(task: &Task, seed: Option<u64>, seeds: Option<&[u64]>) -> Vec<u64> {
    if let Some(seeds) = seeds {
        return seeds.to_vec();
    }
    if let Some(seed) = seed {
        return vec![seed];
    }
    task.default_seeds.first().map(|s| vec![*s]).unwrap_or_default()
}

/// Validate the ai_polish seed pattern: at least three runs, two distinct
/// seeds, and one seed repeated.
pub fn check_seed_policy(task: &Task, seeds: &[u64]) -> Result<(), (ErrorCode, String)> {
    if task.seed_policy != SeedPolicy::AiPolish {
        return Ok(());
    }
    if seeds.len() < 3 {
        return Err((
            ErrorCode::SeedPolicyViolation,
            "ai_polish policy requires at least 3 runs".to_string(),
        ));
    }
    let mut counts: BTreeMap<u64, u32> = BTreeMap::new();
    for seed in seeds {
        *counts.entry(*seed).or_insert(0) += 1;
    }
    if counts.len() < 2 || counts.values().copied().max().unwrap_or(0) < 2 {
        return Err((
            ErrorCode::SeedPolicyViolation,
            "ai_polish policy requires two runs on the same seed and one run on a different seed"
                .to_string(),
        ));
    }
    Ok(())
}

/// Linear-interpolation percentile over an unsorted sample.
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.len() == 1 || pct <= 0.0 {
        return Some(sorted[0]);
    }
    if pct >= 100.0 {
        return Some(sorted[sorted.len() - 1]);
    }
    let rank = (sorted.len() - 1) as f64 * (pct / 100.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower]);
    }
    let weight = rank - lower as f64;
    Some(sorted[lower] * (1.0 - weight) + sorted[upper] * weight)
}

fn seed_stats(values: &[f64]) -> Option<MetricStats> {
    if values.is_empty() {
        return None;
    }
    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count;
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    Some(MetricStats {
        count: values.len() as u64,
        min: Some(min),
        max: Some(max),
        mean: Some(mean),
        stdev: Some(variance.max(0.0).sqrt()),
        last: None,
        last_tick: None,
        p95: percentile(values, 95.0),
    })
}

/// Cross-seed aggregation output.
#[derive(Debug, Default)]
pub struct SeedAggregation {
    pub seed_runs: Vec<SeedRunView>,
    pub summary: BTreeMap<String, Value>,
    pub stats: BTreeMap<String, MetricStats>,
    pub variance_grades: BTreeMap<String, VarianceGrade>,
    pub variance_pass: bool,
    pub variance_failed_count: u64,
}

/// Collect per-key values across child runs and grade variance bands.
pub fn collect_seed_metrics(
    seed_results: &[RunResult],
    metric_keys: &[String],
    variance_band: &BTreeMap<String, f64>,
) -> SeedAggregation {
    let mut values_by_key: BTreeMap<String, Vec<f64>> = metric_keys
        .iter()
        .map(|key| (key.clone(), Vec::new()))
        .collect();
    let mut seed_runs = Vec::with_capacity(seed_results.len());

    for run in seed_results {
        let mut selected = BTreeMap::new();
        for key in metric_keys {
            if let Some(value) = run.metrics_summary.get(key) {
                if let Some(numeric) = value.as_f64() {
                    selected.insert(key.clone(), value.clone());
                    if let Some(bucket) = values_by_key.get_mut(key) {
                        bucket.push(numeric);
                    }
                }
            }
        }
        seed_runs.push(SeedRunView {
            run_id: Some(run.run_id.clone()),
            seed_requested: run.seed_requested,
            seed_used: run.seed_used,
            seed_effective: run.seed_effective,
            ok: run.ok,
            error_code: run.error_code,
            error: run.error.clone(),
            metrics_summary: selected,
            artifacts: run.artifacts.clone(),
        });
    }

    let mut summary = BTreeMap::new();
    let mut stats = BTreeMap::new();
    let mut variance_grades = BTreeMap::new();
    let mut variance_pass = true;
    let mut variance_failed_count = 0u64;

    for (key, values) in &values_by_key {
        let Some(key_stats) = seed_stats(values) else {
            continue;
        };
        if let Some(mean) = key_stats.mean {
            summary.insert(key.clone(), serde_json::json!(mean));
        }
        if let Some(band) = variance_band.get(key) {
            let spread = key_stats.max.unwrap_or(0.0) - key_stats.min.unwrap_or(0.0);
            let pass = spread <= *band;
            variance_grades.insert(
                key.clone(),
                VarianceGrade {
                    band: *band,
                    spread,
                    count: key_stats.count,
                    pass,
                },
            );
            if !pass {
                variance_pass = false;
                variance_failed_count += 1;
            }
        }
        stats.insert(key.clone(), key_stats);
    }

    SeedAggregation {
        seed_runs,
        summary,
        stats,
        variance_grades,
        variance_pass,
        variance_failed_count,
    }
}
