use crate::job::JobId;
use kiln_abstraction::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

/// Coarse classification recorded on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NoCheckpoint,
    Storage,
    Device,
    Runner,
    Timeout,
    Interrupted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NoCheckpoint => "no_checkpoint",
            Self::Storage => "storage",
            Self::Device => "device",
            Self::Runner => "runner",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid job params: {0}")]
    Validation(String),

    #[error("no checkpoint available for job {0}")]
    NoCheckpoint(JobId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("workload error: {0}")]
    Workload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunnerError {
    /// Maps this error to the kind recorded on the job.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NoCheckpoint(_) => ErrorKind::NoCheckpoint,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Workload(_) | Self::Io(_) | Self::Json(_) | Self::Other(_) => ErrorKind::Runner,
        }
    }
}
