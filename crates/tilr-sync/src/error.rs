use std::fmt;

use thiserror::Error;
use tilr_adapters::SourceError;
use tilr_core::RowError;
use tilr_storage::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("data integrity: {0}")]
    Integrity(String),
    #[error("trigger registry: {0}")]
    Trigger(String),
}

impl From<RowError> for SyncError {
    fn from(err: RowError) -> Self {
        Self::Integrity(err.to_string())
    }
}

/// Coarse failure class reported when a tick stalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    MissingResource,
    DataIntegrity,
    Scheduler,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::MissingResource => "missing_resource",
            Self::DataIntegrity => "data_integrity",
            Self::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Source(SourceError::Malformed { .. }) => ErrorKind::DataIntegrity,
            Self::Source(_) => ErrorKind::Transport,
            Self::Store(StoreError::MissingTable(_)) => ErrorKind::MissingResource,
            Self::Store(StoreError::Io { .. }) => ErrorKind::Transport,
            Self::Store(_) => ErrorKind::DataIntegrity,
            Self::Integrity(_) => ErrorKind::DataIntegrity,
            Self::Trigger(_) => ErrorKind::Scheduler,
        }
    }
}

pub(crate) fn integrity(message: impl Into<String>) -> SyncError {
    SyncError::Integrity(message.into())
}
