// Running Statistics
// Sum/sum-of-squares accumulation per metric key.

use serde_json::Value;
use tri_types::MetricStats;

/// Streaming accumulator for one metric key.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last: Option<Value>,
    pub last_tick: Option<i64>,
}

impl RunningStats {
    pub fn update(&mut self, value: f64, raw: Value, tick: Option<i64>) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        self.last = Some(raw);
        self.last_tick = tick;
    }

    /// Finalize into the serializable stats record.
    ///
    /// `stdev = sqrt(max(0, E[x^2] - E[x]^2))`; the clamp absorbs negative
    /// epsilon from floating-point accumulation.
    pub fn finalize(&self) -> MetricStats {
        let mean = if self.count > 0 {
            Some(self.sum / self.count as f64)
        } else {
            None
        };
        let stdev = mean.map(|m| {
            let variance = (self.sum_sq / self.count as f64) - (m * m);
            variance.max(0.0).sqrt()
        });
        MetricStats {
            count: self.count,
            min: self.min,
            max: self.max,
            mean,
            stdev,
            last: self.last.clone(),
            last_tick: self.last_tick,
            p95: None,
        }
    }
}
