/// Error types for duorec
///
/// Errors raised inside periodic or file-system callbacks never reach these
/// types: they are turned into state transitions at the callback boundary.
/// What remains here belongs to request-shaped operations.
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Persisted session record failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not determine data directory")]
    NoDataDir,
}

/// Daemon settings failures
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Failures inside a single timer step
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimerError {
    #[error("no timer run is active")]
    NoActiveRun,

    #[error("elapsed counter overflowed")]
    Overflow,
}

#[derive(Error, Debug)]
pub enum RenameError {
    #[error("failed to rename {from} to {to}: {source}")]
    Io {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-request worker failures. None of these poison the client itself,
/// except `Disposed`, which is permanent.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker request timed out after {after:?} for action={action}")]
    Timeout { action: String, after: Duration },

    #[error("worker client has been disposed")]
    Disposed,

    #[error("worker exited unexpectedly ({0})")]
    Exited(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("failed to write to worker: {0}")]
    Write(String),

    #[error("worker connection is closed")]
    Closed,

    /// The worker answered with `status: "error"`.
    #[error("{0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
