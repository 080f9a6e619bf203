// Run Orchestration
// Per-task executor, multi-seed variance aggregation, metric diffing,
// artifact bundling, and the nightly batch driver.

pub mod bundle;
pub mod diff;
pub mod nightly;
pub mod orchestrator;
pub mod seeds;
pub mod supervise;

pub use bundle::bundle_artifacts;
pub use diff::diff_metrics;
pub use nightly::{run_nightly, NightlyOptions, NightlySummary};
pub use orchestrator::{run_task, RunTaskOutcome, RunTaskRequest};
pub use seeds::{check_seed_policy, parse_seed_list, percentile, resolve_seed_list};
