use crate::error::{RunnerError, RunnerResult};
use crate::job::ExportFormat;
use kiln_abstraction::ModelMeta;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// One detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x1, y1, x2, y2]` in pixels.
    pub bbox: [f32; 4],
    pub score: f32,
    pub label: String,
}

/// Predictions for one inference input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub input: String,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub path: PathBuf,
    pub format: ExportFormat,
    pub sha256: String,
}

/// What a successful job produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobArtifact {
    Model { model: ModelMeta },
    Predictions { results: Vec<InferenceResult> },
    Export { export: ExportArtifact },
}

impl JobArtifact {
    /// Short description for summaries and logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Model { model } => {
                format!("model '{}' at {}", model.model_name, model.path.display())
            }
            Self::Predictions { results } => {
                let total: usize = results.iter().map(|r| r.detections.len()).sum();
                format!("{} input(s), {} detection(s)", results.len(), total)
            }
            Self::Export { export } => {
                format!("{:?} export at {}", export.format, export.path.display())
            }
        }
    }
}

pub fn sha256_file(path: &Path) -> RunnerResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_export(path: PathBuf, format: ExportFormat) -> RunnerResult<ExportArtifact> {
    if !path.exists() {
        return Err(RunnerError::Workload(format!(
            "export path does not exist: {}",
            path.display()
        )));
    }
    let sha256 = sha256_file(&path)?;
    Ok(ExportArtifact { path, format, sha256 })
}
