use thiserror::Error;

/// Sentinel error kinds the self-update pipeline needs to match on.
///
/// Everything else (OS errors, HTTP transport failures, JSON decode
/// failures) is wrapped in [`UpdateError::Other`] and composed with
/// `anyhow::Context` at the call site, the way the rest of this crate
/// handles errors.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("control plane reports this platform is unsupported")]
    UnsupportedPlatform,

    #[error("preflight checks failed: {0:?}")]
    PreflightFailed(Vec<String>),

    #[error("lock is held by another process")]
    LockBusy,

    #[error("failed to acquire lock after retries: {0}")]
    LockAcquireFailed(Box<UpdateError>),

    #[error("lock is owned by a different process, refusing to release")]
    LockNotOwned,

    #[error("lock file is invalid: {0}")]
    LockInvalid(String),

    #[error("download failed after retries: {0}")]
    DownloadFailed(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("archive entry escapes destination directory: {0}")]
    PathTraversal(String),

    #[error("file not found in archive: {0}")]
    FileNotFound(String),

    #[error("binary exceeds maximum allowed size of {max} bytes (declared {declared})")]
    BinaryTooLarge { declared: u64, max: u64 },

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UpdateError {
    /// True iff this error represents a deliberate cancellation rather than
    /// a real failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdateError::Cancelled)
    }
}

pub type UpdateResult<T> = Result<T, UpdateError>;
