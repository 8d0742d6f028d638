use crate::job::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pointer to a saved partial training state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    /// Job that wrote the checkpoint.
    pub job_id: JobId,
    /// Number of completed iterations captured by the checkpoint.
    pub step: u64,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl CheckpointRef {
    #[must_use]
    pub fn new(job_id: JobId, step: u64, path: PathBuf) -> Self {
        Self { job_id, step, path, created_at: Utc::now() }
    }

    /// Whether the checkpoint file is still on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}
