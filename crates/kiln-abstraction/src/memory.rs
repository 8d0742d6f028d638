//! In-memory storage gateway for tests and embedded use.
//!
//! Models are recorded by reference: the gateway keeps the path it was handed
//! and never copies artifact bytes.

use crate::{ModelMeta, StorageError, StorageGateway, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Storage gateway backed by a map keyed by `(user_id, model_name)`.
#[derive(Default)]
pub struct InMemoryStorage {
    models: RwLock<HashMap<(String, String), ModelMeta>>,
}

impl fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStorage")
            .field("model_count", &self.models.try_read().map(|m| m.len()).unwrap_or(0))
            .finish()
    }
}

impl InMemoryStorage {
    /// Creates an empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model directly, replacing any model of the same name.
    pub fn insert(&self, meta: ModelMeta) {
        let key = (meta.user_id.clone(), meta.model_name.clone());
        self.models.write().unwrap_or_else(PoisonError::into_inner).insert(key, meta);
    }

    /// Number of stored models across all users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageGateway for InMemoryStorage {
    fn id(&self) -> &str {
        "memory"
    }

    async fn save_model(
        &self,
        user_id: &str,
        local_artifact: &Path,
        model_name: &str,
        labels: &[String],
    ) -> StorageResult<ModelMeta> {
        if !local_artifact.is_file() {
            return Err(StorageError::InvalidArtifact(format!(
                "not a file: {}",
                local_artifact.display()
            )));
        }
        let meta = ModelMeta {
            model_name: model_name.to_string(),
            user_id: user_id.to_string(),
            path: local_artifact.to_path_buf(),
            labels: labels.to_vec(),
            created_at: Utc::now(),
        };
        self.insert(meta.clone());
        Ok(meta)
    }

    async fn list_models(&self, user_id: &str) -> StorageResult<Vec<ModelMeta>> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<ModelMeta> =
            models.values().filter(|m| m.user_id == user_id).cloned().collect();
        out.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        Ok(out)
    }

    async fn delete_model(&self, user_id: &str, model_name: &str) -> StorageResult<bool> {
        let key = (user_id.to_string(), model_name.to_string());
        Ok(self.models.write().unwrap_or_else(PoisonError::into_inner).remove(&key).is_some())
    }

    async fn get_model_path(&self, user_id: &str, model_name: &str) -> StorageResult<PathBuf> {
        let key = (user_id.to_string(), model_name.to_string());
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(|m| m.path.clone())
            .ok_or_else(|| StorageError::not_found(user_id, model_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_list_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let artifact = dir.path().join("weights.bin");
        std::fs::write(&artifact, b"w").unwrap();

        let storage = InMemoryStorage::new();
        let meta = storage
            .save_model("alice", &artifact, "veh_v1", &["car".to_string()])
            .await
            .unwrap();
        assert_eq!(meta.labels, vec!["car".to_string()]);
        assert_eq!(storage.get_model_path("alice", "veh_v1").await.unwrap(), artifact);
        assert!(storage.list_models("bob").await.unwrap().is_empty());

        assert!(storage.delete_model("alice", "veh_v1").await.unwrap());
        assert!(!storage.delete_model("alice", "veh_v1").await.unwrap());
        assert!(storage.get_model_path("alice", "veh_v1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_save_rejects_missing_artifact() {
        let storage = InMemoryStorage::new();
        let err = storage
            .save_model("alice", Path::new("/nonexistent/w.bin"), "m", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidArtifact(_)));
        assert!(storage.is_empty());
    }
}
