//! Custom error types for the snapkeep agent.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapkeepError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Watched file not found: {0}")]
    NotFound(PathBuf),

    #[error("A monitor session is already running for {0}")]
    AlreadyRunning(PathBuf),

    #[error("No monitor session is running")]
    NotRunning,

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup source missing: {0}")]
    SourceMissing(PathBuf),

    #[error("Failed to copy {from} to {to}: {source}")]
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write ledger {path}: {reason}")]
    LedgerWriteFailed { path: PathBuf, reason: String },

    #[error("Ledger {path} was unreadable and has been reset: {reason}")]
    LedgerCorrupt { path: PathBuf, reason: String },

    #[error("Backup record not found: {0}")]
    RecordNotFound(String),

    #[error("Archive file missing for backup {id}: {path}")]
    ArchiveMissing { id: String, path: PathBuf },

    #[error("Restore of {target} failed, original content was put back: {reason}")]
    RestoreFailed { target: PathBuf, reason: String },

    #[error("Restore of {target} failed and rollback failed, file state is unknown: {reason}")]
    RollbackFailed { target: PathBuf, reason: String },

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error categories reported to collaborators through `monitor:error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    IoFailure,
    /// Informational: content unchanged since the last capture.
    Duplicate,
    LedgerCorrupt,
    RestoreFailure,
    Watch,
    Config,
}

impl SnapkeepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapkeepError::Config(_)
            | SnapkeepError::AlreadyRunning(_)
            | SnapkeepError::NotRunning => ErrorKind::Config,
            SnapkeepError::NotFound(_)
            | SnapkeepError::SourceMissing(_)
            | SnapkeepError::RecordNotFound(_)
            | SnapkeepError::ArchiveMissing { .. } => ErrorKind::NotFound,
            SnapkeepError::RollbackFailed { .. } => ErrorKind::RestoreFailure,
            SnapkeepError::Watch(_) => ErrorKind::Watch,
            SnapkeepError::LedgerCorrupt { .. } => ErrorKind::LedgerCorrupt,
            SnapkeepError::Read { .. }
            | SnapkeepError::CopyFailed { .. }
            | SnapkeepError::LedgerWriteFailed { .. }
            | SnapkeepError::RestoreFailed { .. }
            | SnapkeepError::Io(_) => ErrorKind::IoFailure,
        }
    }
}

impl From<notify::Error> for SnapkeepError {
    fn from(err: notify::Error) -> Self {
        SnapkeepError::Watch(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SnapkeepError>;
