//! Error types for the diskswap provisioning pipeline.

use thiserror::Error;

/// Result alias used throughout diskswap.
pub type DiskswapResult<T> = Result<T, DiskswapError>;

/// Errors produced by the provisioning pipeline and its collaborators.
///
/// `Cancelled` is a distinguished condition: it is never recorded as a
/// stage failure and always routes through the same cleanup paths as a
/// success-path teardown.
#[derive(Error, Debug)]
pub enum DiskswapError {
    /// Block-device discovery or manipulation failed.
    #[error("device error: {0}")]
    Device(String),

    /// Image download, checksum, or cache handling failed.
    #[error("image error: {0}")]
    Image(String),

    /// The flash pipeline failed.
    #[error("flash error: {0}")]
    Flash(String),

    /// Backup injection failed.
    #[error("inject error: {0}")]
    Inject(String),

    /// The sandbox stage failed.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// The platform Supervisor API returned an error.
    #[error("supervisor error: {0}")]
    Supervisor(String),

    /// A provisioning job is already in progress.
    #[error("a provisioning job is already in progress")]
    JobLocked,

    /// A pre-flight check rejected the request before any state was created.
    #[error("preflight failed: {0}")]
    Preflight(String),

    /// The job was cancelled by the user.
    #[error("job cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DiskswapError {
    /// Whether this error is the cancellation signal rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DiskswapError::Cancelled)
    }
}
