// Error Taxonomy
// Closed machine-readable error codes and the stdout result envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed error-code vocabulary emitted in result envelopes.
///
/// Per-run failures become an `ErrorCode` inside `result.json`; they are
/// never raised as process errors. Pre-check failures exit 2, run failures
/// exit 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    None,
    TasksMissing,
    PacksMissing,
    TaskNotFound,
    PackNotFound,
    RunNotFound,
    BinaryMissing,
    ScenarioMissing,
    TriRootInvalid,
    BuildLocked,
    Locked,
    InvalidSeed,
    InvalidSeeds,
    InvalidArg,
    ConflictingSeedArgs,
    SeedPolicyViolation,
    Timeout,
    RunFailed,
    TelemetryMissing,
    BankFailed,
    InvariantFailed,
    VarianceFailed,
    SeedRunFailed,
    ContractFailed,
    ValidationFailed,
    NoStdout,
    MissingCommand,
    MissingArgs,
    UnknownCommand,
    Exception,
    Error,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::None => "none",
            ErrorCode::TasksMissing => "tasks_missing",
            ErrorCode::PacksMissing => "packs_missing",
            ErrorCode::TaskNotFound => "task_not_found",
            ErrorCode::PackNotFound => "pack_not_found",
            ErrorCode::RunNotFound => "run_not_found",
            ErrorCode::BinaryMissing => "binary_missing",
            ErrorCode::ScenarioMissing => "scenario_missing",
            ErrorCode::TriRootInvalid => "tri_root_invalid",
            ErrorCode::BuildLocked => "build_locked",
            ErrorCode::Locked => "locked",
            ErrorCode::InvalidSeed => "invalid_seed",
            ErrorCode::InvalidSeeds => "invalid_seeds",
            ErrorCode::InvalidArg => "invalid_arg",
            ErrorCode::ConflictingSeedArgs => "conflicting_seed_args",
            ErrorCode::SeedPolicyViolation => "seed_policy_violation",
            ErrorCode::Timeout => "timeout",
            ErrorCode::RunFailed => "run_failed",
            ErrorCode::TelemetryMissing => "telemetry_missing",
            ErrorCode::BankFailed => "bank_failed",
            ErrorCode::InvariantFailed => "invariant_failed",
            ErrorCode::VarianceFailed => "variance_failed",
            ErrorCode::SeedRunFailed => "seed_run_failed",
            ErrorCode::ContractFailed => "contract_failed",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::NoStdout => "no_stdout",
            ErrorCode::MissingCommand => "missing_command",
            ErrorCode::MissingArgs => "missing_args",
            ErrorCode::UnknownCommand => "unknown_command",
            ErrorCode::Exception => "exception",
            ErrorCode::Error => "error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for every JSON document a command prints on stdout.
///
/// Invariant: exactly one line, containing at least `ok`, `error_code`,
/// `error`, `run_id`, `tool_version`, `schema_version` at top level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub ok: bool,
    pub error_code: ErrorCode,
    pub error: Option<String>,
    pub run_id: Option<String>,
    pub tool_version: String,
    pub schema_version: u32,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ResultEnvelope {
    pub fn success() -> Self {
        Self {
            ok: true,
            error_code: ErrorCode::None,
            error: None,
            run_id: None,
            tool_version: crate::TOOL_VERSION.to_string(),
            schema_version: crate::SCHEMA_VERSION,
            payload: Map::new(),
        }
    }

    pub fn failure(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_code: code,
            error: Some(error.into()),
            run_id: None,
            tool_version: crate::TOOL_VERSION.to_string(),
            schema_version: crate::SCHEMA_VERSION,
            payload: Map::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Attach an extra top-level payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Wrap an already-complete result document (e.g. a `RunResult`),
    /// stamping the envelope keys it may lack.
    pub fn from_document(value: Value) -> Self {
        let mut payload = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        let ok = payload
            .remove("ok")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let error_code = payload
            .remove("error_code")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(if ok { ErrorCode::None } else { ErrorCode::Error });
        let error = payload
            .remove("error")
            .and_then(|v| v.as_str().map(String::from));
        let run_id = payload
            .remove("run_id")
            .and_then(|v| v.as_str().map(String::from));
        payload.remove("tool_version");
        payload.remove("schema_version");
        Self {
            ok,
            error_code,
            error,
            run_id,
            tool_version: crate::TOOL_VERSION.to_string(),
            schema_version: crate::SCHEMA_VERSION,
            payload,
        }
    }

    /// Single-line JSON rendering for stdout.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            // Serialization of an envelope can only fail on non-string map
            // keys, which the type forbids; keep a sane fallback anyway.
            format!(
                "{{\"ok\":false,\"error_code\":\"exception\",\"error\":\"envelope serialization failed\",\"run_id\":null,\"tool_version\":\"{}\",\"schema_version\":{}}}",
                crate::TOOL_VERSION,
                crate::SCHEMA_VERSION
            )
        })
    }
}
