// Shared Data Model
// Registry entities, run results, and the closed error-code taxonomy.

pub mod error;
pub mod registry;
pub mod run;

pub use error::{ErrorCode, ResultEnvelope};
pub use registry::{
    Pack, PackCaps, PackRegistry, Project, Runner, SeedPolicy, Task, TaskRegistry, Threshold,
};
pub use run::{
    AggregateResult, BankResult, EvalMetrics, InvariantCheck, MetricStats, RunResult, SeedRunView,
    VarianceGrade,
};

/// Version stamped into every emitted result envelope.
pub const TOOL_VERSION: &str = "0.1.0";

/// Schema version stamped into every emitted result envelope.
pub const SCHEMA_VERSION: u32 = 1;

/// Current UTC timestamp in RFC3339 with seconds precision and a `Z` suffix.
pub fn utc_now() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

/// Parse a UTC timestamp as written by `utc_now` (or any RFC3339 value).
pub fn parse_utc(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    chrono::DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}
