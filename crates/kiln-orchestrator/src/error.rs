// Error types for job scheduling

use crate::lifecycle::JobState;
use kiln_abstraction::StorageError;
use kiln_training::{DeviceId, ErrorKind, JobId, RunnerError};
use thiserror::Error;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Job registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No job with this id
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Compare-and-swap lost: the stored state differs from the expected one
    #[error("Conflict on job {job_id}: expected {expected:?}, found {actual:?}")]
    Conflict {
        /// Job id
        job_id: JobId,
        /// State the caller expected
        expected: JobState,
        /// State actually stored
        actual: JobState,
    },

    /// The state machine does not allow this transition
    #[error("Invalid transition for job {job_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Job id
        job_id: JobId,
        /// Current state
        from: JobState,
        /// Requested state
        to: JobState,
    },

    /// Terminal jobs only accept checkpoint updates
    #[error("Job {0} is terminal and cannot be modified")]
    Immutable(JobId),

    /// A restored job id already exists
    #[error("Job {0} already exists")]
    Duplicate(JobId),
}

/// Device pool contract violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The job already holds a device
    #[error("Job {job_id} is already bound to device {device_id}")]
    AlreadyBound {
        /// Job id
        job_id: JobId,
        /// Device it holds
        device_id: DeviceId,
    },

    /// Releasing a device nobody holds
    #[error("Device {0} is not bound to any job")]
    NotBound(DeviceId),

    /// Device id is not part of the pool
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),
}

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad submission params
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resume without a usable checkpoint
    #[error("No checkpoint available for job {0}")]
    NoCheckpoint(JobId),

    /// Unknown job
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Destination model already leased by another active job
    #[error("Model '{model_name}' of user '{user_id}' is in use by job {holder}")]
    ModelBusy {
        /// Owner of the model
        user_id: String,
        /// Leased model name
        model_name: String,
        /// Job holding the lease
        holder: JobId,
    },

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid scheduler configuration
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// The scheduler no longer accepts work
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl From<RunnerError> for SchedulerError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::NoCheckpoint(id) => Self::NoCheckpoint(id),
            RunnerError::Storage(e) => Self::Storage(e),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl SchedulerError {
    /// Kind recorded on a job that fails with this error.
    #[must_use]
    pub fn job_error_kind(&self) -> ErrorKind {
        match self {
            Self::NoCheckpoint(_) => ErrorKind::NoCheckpoint,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Device(_) => ErrorKind::Device,
            Self::Validation(_)
            | Self::NotFound(_)
            | Self::ModelBusy { .. }
            | Self::Registry(_)
            | Self::InvalidConfig(_)
            | Self::ShuttingDown => ErrorKind::Validation,
        }
    }
}
