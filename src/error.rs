use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by the message source boundary.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("source call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("not available: {0}")]
    NotAvailable(String),
    #[error("source unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
    #[error("source protocol error: {0}")]
    Protocol(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("storage failure at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("path component exceeds filesystem limit: {component}")]
    PathTooLong { component: String },
    #[error("another archiver holds the lock at {}", path.display())]
    Locked { path: PathBuf },
    #[error("state file {} invalid: {message}", path.display())]
    State { path: PathBuf, message: String },
    #[error(transparent)]
    Source(#[from] SourceError),
}

impl ArchiveError {
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Storage and path errors are systemic; everything else is scoped to one item or chat.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::PathTooLong { .. })
    }

    pub fn code(&self) -> ArchiveErrorCode {
        match self {
            Self::Locked { .. } => ArchiveErrorCode::E001Locked,
            Self::Source(_) => ArchiveErrorCode::E002SourceUnavailable,
            Self::Storage { .. } | Self::PathTooLong { .. } => ArchiveErrorCode::E003StorageFailure,
            Self::State { .. } => ArchiveErrorCode::E005StateCorrupt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveErrorCode {
    E001Locked,
    E002SourceUnavailable,
    E003StorageFailure,
    E004ConfigInvalid,
    E005StateCorrupt,
}

impl ArchiveErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001Locked => "E001_LOCKED",
            Self::E002SourceUnavailable => "E002_SOURCE_UNAVAILABLE",
            Self::E003StorageFailure => "E003_STORAGE_FAILURE",
            Self::E004ConfigInvalid => "E004_CONFIG_INVALID",
            Self::E005StateCorrupt => "E005_STATE_CORRUPT",
        }
    }
}
