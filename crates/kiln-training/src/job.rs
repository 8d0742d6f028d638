use crate::checkpoint::CheckpointRef;
use crate::error::{RunnerError, RunnerResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Train,
    Resume,
    Infer,
    Export,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Train => "train",
            Self::Resume => "resume",
            Self::Infer => "infer",
            Self::Export => "export",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobKind {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "resume" => Ok(Self::Resume),
            "infer" => Ok(Self::Infer),
            "export" => Ok(Self::Export),
            other => Err(RunnerError::Validation(format!("unknown job kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainParams {
    /// Local path, pretrained-weights name, or a stored model of the same user.
    pub base_model: String,
    pub dataset: PathBuf,
    pub epochs: u64,
    /// Destination model name; the job leases it while active.
    pub model_name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub checkpoint_every: Option<u64>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeParams {
    /// The Stopped or Failed train job to continue from.
    pub source_job: JobId,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InferParams {
    pub model_name: String,
    pub inputs: Vec<String>,
    #[serde(default = "default_conf")]
    pub conf: f32,
    #[serde(default = "default_iou")]
    pub iou: f32,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

const fn default_conf() -> f32 {
    0.25
}

const fn default_iou() -> f32 {
    0.45
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Onnx,
    Torchscript,
    Openvino,
    Tflite,
    Coreml,
}

impl ExportFormat {
    /// File extension of the exported artifact.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Onnx => "onnx",
            Self::Torchscript => "torchscript",
            Self::Openvino => "xml",
            Self::Tflite => "tflite",
            Self::Coreml => "mlpackage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportParams {
    pub model_name: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

/// Params of a submission, parsed according to its [`JobKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobParams {
    Train(TrainParams),
    Resume(ResumeParams),
    Infer(InferParams),
    Export(ExportParams),
}

impl JobParams {
    /// Parses and validates the opaque params blob of a submission.
    ///
    /// # Arguments
    /// * `kind` - Kind the params are interpreted as
    /// * `value` - Raw JSON params
    ///
    /// # Returns
    /// Validated params, or `RunnerError::Validation` describing the first problem found.
    pub fn parse(kind: JobKind, value: &serde_json::Value) -> RunnerResult<Self> {
        let params = match kind {
            JobKind::Train => Self::Train(from_value(kind, value)?),
            JobKind::Resume => Self::Resume(from_value(kind, value)?),
            JobKind::Infer => Self::Infer(from_value(kind, value)?),
            JobKind::Export => Self::Export(from_value(kind, value)?),
        };
        params.validate()?;
        Ok(params)
    }

    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Train(_) => JobKind::Train,
            Self::Resume(_) => JobKind::Resume,
            Self::Infer(_) => JobKind::Infer,
            Self::Export(_) => JobKind::Export,
        }
    }

    /// Structural checks that need no I/O.
    pub fn validate(&self) -> RunnerResult<()> {
        match self {
            Self::Train(p) => {
                if p.base_model.trim().is_empty() {
                    return Err(RunnerError::Validation("base_model must not be empty".into()));
                }
                if p.dataset.as_os_str().is_empty() {
                    return Err(RunnerError::Validation("dataset must not be empty".into()));
                }
                if p.epochs == 0 {
                    return Err(RunnerError::Validation("epochs must be >= 1".into()));
                }
                if p.checkpoint_every == Some(0) {
                    return Err(RunnerError::Validation("checkpoint_every must be >= 1".into()));
                }
                validate_model_name(&p.model_name)
            }
            Self::Resume(p) => {
                if p.source_job.as_str().trim().is_empty() {
                    return Err(RunnerError::Validation("source_job must not be empty".into()));
                }
                Ok(())
            }
            Self::Infer(p) => {
                validate_model_name(&p.model_name)?;
                if p.inputs.is_empty() {
                    return Err(RunnerError::Validation("inputs must not be empty".into()));
                }
                for (name, v) in [("conf", p.conf), ("iou", p.iou)] {
                    if !(0.0..=1.0).contains(&v) {
                        return Err(RunnerError::Validation(format!(
                            "{name} must be within [0, 1], got {v}"
                        )));
                    }
                }
                Ok(())
            }
            Self::Export(p) => validate_model_name(&p.model_name),
        }
    }

    /// Destination model leased while the job is active (Train only; Resume
    /// inherits it from its source).
    #[must_use]
    pub fn destination_model(&self) -> Option<&str> {
        match self {
            Self::Train(p) => Some(&p.model_name),
            _ => None,
        }
    }

    #[must_use]
    pub fn max_duration(&self) -> Option<Duration> {
        let secs = match self {
            Self::Train(p) => p.max_duration_secs,
            Self::Resume(p) => p.max_duration_secs,
            Self::Infer(p) => p.max_duration_secs,
            Self::Export(p) => p.max_duration_secs,
        };
        secs.map(Duration::from_secs)
    }
}

fn from_value<T: serde::de::DeserializeOwned>(
    kind: JobKind,
    value: &serde_json::Value,
) -> RunnerResult<T> {
    T::deserialize(value)
        .map_err(|e| RunnerError::Validation(format!("invalid {kind} params: {e}")))
}

/// Model names end up in file names, so path syntax is refused.
pub fn validate_model_name(name: &str) -> RunnerResult<()> {
    if name.trim().is_empty() {
        return Err(RunnerError::Validation("model_name must not be empty".into()));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(RunnerError::Validation(format!("invalid model_name '{name}'")));
    }
    Ok(())
}

/// Fully resolved workload handed to a runner.
///
/// Unlike [`JobParams`], a `TaskSpec` carries everything looked up at
/// admission time: a Resume knows its source train params and checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskSpec {
    Train(TrainParams),
    Resume { source_job: JobId, train: TrainParams, checkpoint: CheckpointRef },
    Infer(InferParams),
    Export(ExportParams),
}

impl TaskSpec {
    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Train(_) => JobKind::Train,
            Self::Resume { .. } => JobKind::Resume,
            Self::Infer(_) => JobKind::Infer,
            Self::Export(_) => JobKind::Export,
        }
    }

    /// Train params for Train and Resume tasks.
    #[must_use]
    pub fn train_params(&self) -> Option<&TrainParams> {
        match self {
            Self::Train(p) | Self::Resume { train: p, .. } => Some(p),
            _ => None,
        }
    }

    /// Destination model name of Train and Resume tasks.
    #[must_use]
    pub fn destination_model(&self) -> Option<&str> {
        self.train_params().map(|p| p.model_name.as_str())
    }
}
