//! Error types for the Kiln service layer.

use crate::config::ConfigError;
use kiln_abstraction::StorageError;
use kiln_orchestrator::SchedulerError;
use thiserror::Error;

/// Service layer errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Scheduler error
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Journal or metrics file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Journal entry (de)serialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Logging could not be initialized
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, CoreError>;
