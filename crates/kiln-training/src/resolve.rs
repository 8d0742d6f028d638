use crate::error::{RunnerError, RunnerResult};
use kiln_abstraction::StorageGateway;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolves `base_model` references to local weight files.
///
/// Lookup order:
/// 1. An existing local path
/// 2. `<pretrained_dir>/<name>`
/// 3. A model of the same user already in storage
#[derive(Clone)]
pub struct BaseModelResolver {
    pretrained_dir: Option<PathBuf>,
    storage: Arc<dyn StorageGateway>,
}

impl BaseModelResolver {
    #[must_use]
    pub fn new(pretrained_dir: Option<PathBuf>, storage: Arc<dyn StorageGateway>) -> Self {
        Self { pretrained_dir, storage }
    }

    /// # Errors
    /// `RunnerError::Validation` when no source knows the reference; storage
    /// failures other than not-found surface as `RunnerError::Storage`.
    pub async fn resolve(&self, user_id: &str, base_model: &str) -> RunnerResult<PathBuf> {
        let direct = Path::new(base_model);
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }

        if let Some(dir) = &self.pretrained_dir {
            let candidate = dir.join(base_model);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        match self.storage.get_model_path(user_id, base_model).await {
            Ok(path) => Ok(path),
            Err(e) if e.is_not_found() => Err(RunnerError::Validation(format!(
                "base model '{base_model}' not found locally, in pretrained weights, or among models of user '{user_id}'"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Looks up a stored model of `user_id` (used by Infer and Export).
    pub async fn stored_model(&self, user_id: &str, model_name: &str) -> RunnerResult<PathBuf> {
        Ok(self.storage.get_model_path(user_id, model_name).await?)
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageGateway> {
        &self.storage
    }
}

impl std::fmt::Debug for BaseModelResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseModelResolver")
            .field("pretrained_dir", &self.pretrained_dir)
            .field("storage", &self.storage.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use kiln_abstraction::{ModelMeta, StorageError, StorageResult};
    use tempfile::TempDir;

    struct OneModel {
        path: PathBuf,
    }

    #[async_trait]
    impl StorageGateway for OneModel {
        fn id(&self) -> &str {
            "one"
        }

        async fn save_model(
            &self,
            user_id: &str,
            _local_artifact: &Path,
            model_name: &str,
            labels: &[String],
        ) -> StorageResult<ModelMeta> {
            Ok(ModelMeta {
                model_name: model_name.to_string(),
                user_id: user_id.to_string(),
                path: self.path.clone(),
                labels: labels.to_vec(),
                created_at: Utc::now(),
            })
        }

        async fn list_models(&self, _user_id: &str) -> StorageResult<Vec<ModelMeta>> {
            Ok(Vec::new())
        }

        async fn delete_model(&self, _user_id: &str, _model_name: &str) -> StorageResult<bool> {
            Ok(false)
        }

        async fn get_model_path(&self, user_id: &str, model_name: &str) -> StorageResult<PathBuf> {
            if user_id == "alice" && model_name == "veh_v1" {
                Ok(self.path.clone())
            } else if model_name == "broken" {
                Err(StorageError::Backend("offline".to_string()))
            } else {
                Err(StorageError::not_found(user_id, model_name))
            }
        }
    }

    fn resolver(temp: &TempDir) -> BaseModelResolver {
        let pretrained = temp.path().join("pretrained");
        std::fs::create_dir_all(&pretrained).unwrap();
        std::fs::write(pretrained.join("yolov8n.pt"), b"w").unwrap();
        let storage = Arc::new(OneModel { path: temp.path().join("stored.pt") });
        BaseModelResolver::new(Some(pretrained), storage)
    }

    #[tokio::test]
    async fn test_resolution_order() {
        let temp = TempDir::new().unwrap();
        let resolver = resolver(&temp);

        let local = temp.path().join("local.pt");
        std::fs::write(&local, b"w").unwrap();
        let local_str = local.to_string_lossy().to_string();
        assert_eq!(resolver.resolve("alice", &local_str).await.unwrap(), local);

        let pretrained = resolver.resolve("alice", "yolov8n.pt").await.unwrap();
        assert!(pretrained.ends_with("pretrained/yolov8n.pt"));

        let stored = resolver.resolve("alice", "veh_v1").await.unwrap();
        assert!(stored.ends_with("stored.pt"));
    }

    #[tokio::test]
    async fn test_unknown_base_model_is_validation_error() {
        let temp = TempDir::new().unwrap();
        let err = resolver(&temp).resolve("bob", "veh_v1").await.unwrap_err();
        assert!(matches!(err, RunnerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_backend_failure_is_storage_error() {
        let temp = TempDir::new().unwrap();
        let err = resolver(&temp).resolve("alice", "broken").await.unwrap_err();
        assert!(matches!(err, RunnerError::Storage(_)));
    }
}
