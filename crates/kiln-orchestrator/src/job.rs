use crate::lifecycle::JobState;
use chrono::{DateTime, Utc};
use kiln_training::{
    CheckpointRef, DeviceId, ErrorKind, JobArtifact, JobId, JobKind, ProgressEvent, RunnerError,
};
use serde::{Deserialize, Serialize};

/// Error attached to a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl From<&RunnerError> for JobError {
    fn from(err: &RunnerError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Monotonic submission order.
    pub seq: u64,
    pub user_id: String,
    pub kind: JobKind,
    pub state: JobState,
    /// Raw params as submitted.
    pub params: serde_json::Value,
    /// Set iff `state == Running`.
    #[serde(default)]
    pub assigned_device: Option<DeviceId>,
    #[serde(default)]
    pub checkpoint_ref: Option<CheckpointRef>,
    /// Source job of a Resume.
    #[serde(default)]
    pub resumed_from: Option<JobId>,
    #[serde(default)]
    pub latest_progress: Option<ProgressEvent>,
    #[serde(default)]
    pub result: Option<JobArtifact>,
    #[serde(default)]
    pub last_error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    #[must_use]
    pub fn new(
        seq: u64,
        user_id: &str,
        kind: JobKind,
        params: serde_json::Value,
        resumed_from: Option<JobId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            seq,
            user_id: user_id.to_string(),
            kind,
            state: JobState::Pending,
            params,
            assigned_device: None,
            checkpoint_ref: None,
            resumed_from,
            latest_progress: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Last reported step, if any progress was seen.
    #[must_use]
    pub fn current_step(&self) -> Option<u64> {
        self.latest_progress.as_ref().map(|p| p.step)
    }
}
