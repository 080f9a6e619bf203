// Core Infrastructure
// Path resolution, the three lock kinds, registry loading, run retention.

pub mod contract;
pub mod locks;
pub mod paths;
pub mod registry;
pub mod runs;

pub use contract::{contract_check, ContractIssue, ContractReport};
pub use locks::{
    check_build_lock, check_nightly_lock, claim_nightly_lock, claim_session_lock, clear_nightly_lock,
    cleanup_session_locks, release_session_lock, show_session_lock, ClaimOutcome, ReleaseOutcome,
    SessionLockPayload, DEFAULT_SESSION_LOCK_TTL_SEC,
};
pub use paths::Paths;
pub use registry::{load_pack_registry, load_registry_value, load_task_registry, RegistryError};
pub use runs::{cleanup_runs, find_previous_run, iter_runs, run_dir_size, RunDirEntry};
