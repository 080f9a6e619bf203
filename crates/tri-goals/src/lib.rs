// Scoreboards & Goal Scorer
// 0-5 evidence ladder per goal spec, scoreboard aggregation over recent
// result bundles, triage list and the nightly headline.

pub mod score;
pub mod scoreboard;

pub use score::{build_goal_report, score_goal};
pub use scoreboard::{build_scoreboard, next_action, ScoreboardOptions, ScoreboardOutput};
