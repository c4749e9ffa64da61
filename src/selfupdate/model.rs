use serde::{Deserialize, Serialize};

/// Response from the control plane's update-check endpoint.
///
/// Invariant: when `update_available` is true, `target_version`, `agent_url`,
/// and `agent_sha256` are non-empty. `agent_size` may be zero (unknown),
/// in which case callers substitute [`crate::selfupdate::DEFAULT_AGENT_SIZE_FALLBACK`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub update_available: bool,
    #[serde(default)]
    pub target_version: String,
    #[serde(default)]
    pub agent_url: String,
    #[serde(default)]
    pub agent_sha256: String,
    #[serde(default)]
    pub agent_size: i64,
}

/// Persisted lock payload.
///
/// A lock is valid iff the file exists, `expire_at >= now`, `pid` is alive,
/// and the live process's observed start time equals `owner_start_time`.
/// Any other state makes the lock stale and reclaimable by a contender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockData {
    pub pid: i32,
    pub expire_at: i64,
    pub owner_start_time: i64,
}

/// Progression of a single update/upgrade attempt, persisted for
/// observability only. Never branch correctness on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum UpdateState {
    NotStarted,
    Initialized,
    Staged,
    Installed,
    Completed,
    Rollback,
    RolledBack,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self::NotStarted
    }
}

/// Durable, observable state file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateData {
    #[serde(default)]
    pub update_id: String,
    #[serde(default)]
    pub state: UpdateState,
    #[serde(default)]
    pub source_version: String,
    #[serde(default)]
    pub target_version: String,
    #[serde(default)]
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a successful, verified download.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub file_path: std::path::PathBuf,
    pub sha256: String,
}

/// Aggregated preflight result. Every failing check is collected rather than
/// short-circuiting on the first one, so an operator sees every problem at
/// once.
#[derive(Debug, Clone, Default)]
pub struct PreflightResult {
    pub passed: bool,
    pub errors: Vec<String>,
}

impl PreflightResult {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
        }
    }

    pub fn push_error(&mut self, err: impl Into<String>) {
        self.passed = false;
        self.errors.push(err.into());
    }
}
