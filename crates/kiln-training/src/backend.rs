use crate::artifacts::InferenceResult;
use crate::checkpoint::CheckpointRef;
use crate::device::{Device, DevicePolicy};
use crate::error::RunnerResult;
use crate::job::{ExportFormat, InferParams, TaskSpec, TrainParams};
use crate::progress::Metrics;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Everything a backend needs to open a training session.
#[derive(Debug, Clone)]
pub struct TrainingInit {
    /// Resolved pretrained weights.
    pub base_model: PathBuf,
    pub params: TrainParams,
    pub device: Device,
}

/// Result of one training iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// The iteration ran to completion.
    Completed(Metrics),
    /// The backend observed cancellation and abandoned the iteration.
    Interrupted,
}

/// An open, step-wise training run.
///
/// The step counter only moves on [`IterationOutcome::Completed`].
#[async_trait]
pub trait TrainingSession: Send + Sync {
    /// Iterations completed so far (including those restored from a checkpoint).
    fn completed_steps(&self) -> u64;

    /// Total iterations of the run.
    fn total_steps(&self) -> u64;

    /// Runs a single iteration. Implementations should return
    /// [`IterationOutcome::Interrupted`] promptly once `cancel` fires.
    async fn run_iteration(&mut self, cancel: &CancellationToken) -> RunnerResult<IterationOutcome>;

    /// Writes the current partial state to `path`.
    async fn save_checkpoint(&self, path: &Path) -> RunnerResult<()>;

    /// Writes the final model into `out_dir` and returns its path.
    async fn finalize(self: Box<Self>, out_dir: &Path) -> RunnerResult<PathBuf>;
}

/// The black-box model engine.
///
/// A backend is shared by every runner, so it must be `Send + Sync`.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn id(&self) -> &'static str;

    /// Devices acceptable for `task`.
    fn device_policy(&self, task: &TaskSpec) -> DevicePolicy;

    async fn start_training(&self, init: TrainingInit) -> RunnerResult<Box<dyn TrainingSession>>;

    /// Reopens a session from `checkpoint`.
    ///
    /// # Errors
    /// Returns `RunnerError::NoCheckpoint` if the checkpoint cannot be found.
    async fn restore_training(
        &self,
        init: TrainingInit,
        checkpoint: &CheckpointRef,
    ) -> RunnerResult<Box<dyn TrainingSession>>;

    async fn infer(
        &self,
        model_path: &Path,
        labels: &[String],
        params: &InferParams,
        device: &Device,
    ) -> RunnerResult<Vec<InferenceResult>>;

    /// Converts the model at `model_path` and returns the exported file.
    async fn export(
        &self,
        model_path: &Path,
        format: ExportFormat,
        out_dir: &Path,
        device: &Device,
    ) -> RunnerResult<PathBuf>;
}
