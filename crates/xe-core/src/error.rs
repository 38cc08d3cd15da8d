use std::path::PathBuf;

/// Failure taxonomy surfaced by the install engine. Individual kinds are
/// created at the failure site and travel inside `anyhow::Error`; callers
/// that need to branch on the kind use `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("invalid project configuration at {path}")]
    ConfigInvalid { path: PathBuf },

    #[error("failed to resolve requirement `{requirement}`")]
    ResolveFailed { requirement: String },

    #[error("download failed for {url}: {status}")]
    Network { url: String, status: String },

    #[error("checksum mismatch: expected={expected} actual={actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("filesystem operation failed at {path}")]
    Io { path: PathBuf },

    #[error("wheel archive is corrupt: {path}")]
    ArchiveCorrupt { path: PathBuf },

    #[error("wheel entry escapes the target directory: {entry}")]
    PathEscape { entry: String },

    #[error("python runtime failed its health probe")]
    RuntimeUnhealthy,

    #[error("operation cancelled")]
    Cancelled,
}

impl InstallError {
    /// True when the error represents cooperative cancellation rather than a
    /// real failure; cancellation is never elevated to an error report.
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Self>(), Some(Self::Cancelled))
    }
}
