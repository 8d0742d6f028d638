//! Local filesystem model store.
//!
//! Layout: `<root>/<user_id>/models/<model_name>_<timestamp><ext>`, with the
//! class labels of each file kept one per line in a sibling `<file>.labels`.
//! A model name may have several stored versions; lookups resolve to the most
//! recently modified one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_abstraction::{ModelMeta, StorageError, StorageGateway, StorageResult};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LABELS_SUFFIX: &str = ".labels";
const DEFAULT_EXTENSION: &str = ".pt";

/// Model store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalFsStorage {
    root: PathBuf,
}

/// One stored model file.
struct StoredFile {
    model_name: String,
    path: PathBuf,
    modified: DateTime<Utc>,
}

/// Splits `veh_v1_20240101120000123456789.pt` into `veh_v1`.
fn model_name_of(file_name: &str) -> Option<&str> {
    let (name, rest) = file_name.rsplit_once('_')?;
    let stamp = rest.split_once('.').map_or(rest, |(stamp, _)| stamp);
    if name.is_empty() || stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(name)
}

fn labels_path(model_path: &Path) -> PathBuf {
    let mut name = model_path.as_os_str().to_os_string();
    name.push(LABELS_SUFFIX);
    PathBuf::from(name)
}

impl LocalFsStorage {
    /// Creates the store, creating `root` if needed.
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn models_dir(&self, user_id: &str) -> StorageResult<PathBuf> {
        if user_id.is_empty() || user_id.contains(['/', '\\']) || user_id == "." || user_id == ".." {
            return Err(StorageError::Backend(format!("invalid user id '{user_id}'")));
        }
        Ok(self.root.join(user_id).join("models"))
    }

    /// Model files of a user, skipping label files and foreign names.
    async fn stored_files(&self, user_id: &str) -> StorageResult<Vec<StoredFile>> {
        let dir = self.models_dir(user_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.ends_with(LABELS_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Some(model_name) = model_name_of(&file_name) else {
                debug!(file = %file_name, "Skipping unrecognized file in model store");
                continue;
            };
            let modified = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
            files.push(StoredFile { model_name: model_name.to_string(), path: entry.path(), modified });
        }
        files.sort_by(|a, b| a.model_name.cmp(&b.model_name).then(a.path.cmp(&b.path)));
        Ok(files)
    }

    async fn read_labels(model_path: &Path) -> StorageResult<Vec<String>> {
        match tokio::fs::read_to_string(labels_path(model_path)).await {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageGateway for LocalFsStorage {
    fn id(&self) -> &str {
        "local-fs"
    }

    async fn save_model(
        &self,
        user_id: &str,
        local_artifact: &Path,
        model_name: &str,
        labels: &[String],
    ) -> StorageResult<ModelMeta> {
        kiln_training::validate_model_name(model_name)
            .map_err(|e| StorageError::InvalidArtifact(e.to_string()))?;
        let metadata = tokio::fs::metadata(local_artifact).await.map_err(|e| {
            StorageError::InvalidArtifact(format!("{}: {}", local_artifact.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(StorageError::InvalidArtifact(format!(
                "{} is not a file",
                local_artifact.display()
            )));
        }

        let dir = self.models_dir(user_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let extension = local_artifact
            .extension()
            .map_or_else(|| DEFAULT_EXTENSION.to_string(), |ext| format!(".{}", ext.to_string_lossy()));
        let created_at = Utc::now();
        let dest = dir.join(format!("{}_{}{}", model_name, created_at.format("%Y%m%d%H%M%S%f"), extension));
        tokio::fs::copy(local_artifact, &dest).await?;
        if !labels.is_empty() {
            tokio::fs::write(labels_path(&dest), labels.join("\n")).await?;
        }

        debug!(user_id = %user_id, model = %model_name, path = %dest.display(), "Model stored");
        Ok(ModelMeta {
            model_name: model_name.to_string(),
            user_id: user_id.to_string(),
            path: dest,
            labels: labels.to_vec(),
            created_at,
        })
    }

    async fn list_models(&self, user_id: &str) -> StorageResult<Vec<ModelMeta>> {
        let mut models = Vec::new();
        for file in self.stored_files(user_id).await? {
            let labels = Self::read_labels(&file.path).await?;
            models.push(ModelMeta {
                model_name: file.model_name,
                user_id: user_id.to_string(),
                path: file.path,
                labels,
                created_at: file.modified,
            });
        }
        Ok(models)
    }

    async fn delete_model(&self, user_id: &str, model_name: &str) -> StorageResult<bool> {
        let mut deleted = false;
        for file in self.stored_files(user_id).await? {
            if file.model_name != model_name {
                continue;
            }
            tokio::fs::remove_file(&file.path).await?;
            match tokio::fs::remove_file(labels_path(&file.path)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.path.display(), error = %e, "Failed to remove labels"),
            }
            deleted = true;
        }
        if deleted {
            debug!(user_id = %user_id, model = %model_name, "Model deleted");
        }
        Ok(deleted)
    }

    async fn get_model_path(&self, user_id: &str, model_name: &str) -> StorageResult<PathBuf> {
        self.stored_files(user_id)
            .await?
            .into_iter()
            .filter(|file| file.model_name == model_name)
            .max_by(|a, b| a.modified.cmp(&b.modified).then(a.path.cmp(&b.path)))
            .map(|file| file.path)
            .ok_or_else(|| StorageError::not_found(user_id, model_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_model_name_of() {
        assert_eq!(model_name_of("veh_v1_20240101120000123456789.pt"), Some("veh_v1"));
        assert_eq!(model_name_of("veh_1.json"), Some("veh"));
        assert_eq!(model_name_of("veh.v2_1700000000.pt"), Some("veh.v2"));
        assert_eq!(model_name_of("notes.txt"), None);
        assert_eq!(model_name_of("veh_v1.pt"), None);
    }

    #[tokio::test]
    async fn test_save_list_and_resolve() {
        let temp = TempDir::new().unwrap();
        let storage = LocalFsStorage::new(temp.path().join("store")).unwrap();
        let src = artifact(temp.path(), "weights.json", b"{}");
        let labels = vec!["car".to_string(), "bus".to_string()];

        let meta = storage.save_model("alice", &src, "veh_v1", &labels).await.unwrap();
        assert!(meta.path.starts_with(temp.path().join("store").join("alice").join("models")));
        assert!(meta.path.to_string_lossy().ends_with(".json"));
        assert!(labels_path(&meta.path).exists());

        let models = storage.list_models("alice").await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].model_name, "veh_v1");
        assert_eq!(models[0].labels, labels);

        assert_eq!(storage.get_model_path("alice", "veh_v1").await.unwrap(), meta.path);
        assert!(storage.list_models("bob").await.unwrap().is_empty());
        let err = storage.get_model_path("bob", "veh_v1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_newest_version_wins() {
        let temp = TempDir::new().unwrap();
        let storage = LocalFsStorage::new(temp.path().join("store")).unwrap();
        let src = artifact(temp.path(), "best.pt", b"v1");

        let first = storage.save_model("alice", &src, "veh", &[]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        std::fs::write(&src, b"v2").unwrap();
        let second = storage.save_model("alice", &src, "veh", &[]).await.unwrap();
        assert_ne!(first.path, second.path);

        let resolved = storage.get_model_path("alice", "veh").await.unwrap();
        assert_eq!(std::fs::read(resolved).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_delete_matches_exact_name() {
        let temp = TempDir::new().unwrap();
        let storage = LocalFsStorage::new(temp.path().join("store")).unwrap();
        let src = artifact(temp.path(), "best.pt", b"w");
        let labels = vec!["car".to_string()];

        let veh = storage.save_model("alice", &src, "veh", &labels).await.unwrap();
        storage.save_model("alice", &src, "veh_v2", &labels).await.unwrap();

        assert!(storage.delete_model("alice", "veh").await.unwrap());
        assert!(!veh.path.exists());
        assert!(!labels_path(&veh.path).exists());
        assert!(!storage.delete_model("alice", "veh").await.unwrap());

        let remaining = storage.list_models("alice").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].model_name, "veh_v2");
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let temp = TempDir::new().unwrap();
        let storage = LocalFsStorage::new(temp.path()).unwrap();

        let err = storage.save_model("alice", &temp.path().join("missing.pt"), "m", &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArtifact(_)));

        let src = artifact(temp.path(), "best.pt", b"w");
        let err = storage.save_model("../etc", &src, "m", &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        let err = storage.save_model("alice", &src, "../m", &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArtifact(_)));
    }
}
