//! Storage abstraction layer for Kiln.
//!
//! This module defines the capability interface the scheduler core consumes for
//! persisting and resolving model artifacts. Any conforming implementation is
//! substitutable without touching the core.

pub mod memory;

pub use memory::InMemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Represents an error raised by a storage backend.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageError {
    /// The requested model does not exist for this user.
    #[error("Model '{model_name}' not found for user '{user_id}'")]
    NotFound {
        /// Owner of the model.
        user_id: String,
        /// Name of the missing model.
        model_name: String,
    },

    /// The artifact handed to the backend could not be read.
    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    /// An I/O failure inside the backend.
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// Other backend-specific failures.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Convenience constructor for [`StorageError::NotFound`].
    #[must_use]
    pub fn not_found(user_id: &str, model_name: &str) -> Self {
        Self::NotFound { user_id: user_id.to_string(), model_name: model_name.to_string() }
    }

    /// Returns `true` if this is a [`StorageError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Metadata describing a stored model.
///
/// Models are addressed by `(user_id, model_name)`; the core treats everything
/// else as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    /// The model name chosen at submission.
    pub model_name: String,
    /// Owner of the model.
    pub user_id: String,
    /// Where the backend keeps the artifact.
    pub path: PathBuf,
    /// Class labels stored alongside the model.
    #[serde(default)]
    pub labels: Vec<String>,
    /// When the model was saved.
    pub created_at: DateTime<Utc>,
}

/// Capability interface for persisting model artifacts.
///
/// All backends must be `Send + Sync`; runners call into them concurrently
/// from independent tasks.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Short identifier used in logs.
    fn id(&self) -> &str;

    /// Persists a local artifact under `model_name`.
    ///
    /// # Arguments
    /// * `user_id` - Owner of the model
    /// * `local_artifact` - Path to the artifact produced by a runner
    /// * `model_name` - Destination model name
    /// * `labels` - Class labels to keep with the model (may be empty)
    ///
    /// # Errors
    /// Returns a `StorageError` if the artifact cannot be stored.
    async fn save_model(
        &self,
        user_id: &str,
        local_artifact: &Path,
        model_name: &str,
        labels: &[String],
    ) -> StorageResult<ModelMeta>;

    /// Lists every model owned by `user_id`.
    async fn list_models(&self, user_id: &str) -> StorageResult<Vec<ModelMeta>>;

    /// Deletes a model. Returns `true` if anything was removed.
    async fn delete_model(&self, user_id: &str, model_name: &str) -> StorageResult<bool>;

    /// Resolves the artifact path of a stored model.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] if no such model exists.
    async fn get_model_path(&self, user_id: &str, model_name: &str) -> StorageResult<PathBuf>;
}
