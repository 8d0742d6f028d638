//! Task runner harness.
//!
//! Drives one job's workload against a [`ModelBackend`]: step loop, periodic
//! checkpoints, cancellation at iteration boundaries and persisting the final
//! model. The harness knows nothing about scheduling; it reports through
//! [`RunHooks`] and returns a [`RunOutcome`].

use kiln_training::{
    BaseModelResolver, CheckpointRef, Device, ExportParams, InferParams, IterationOutcome,
    JobArtifact, JobId, ModelBackend, ProgressEvent, RunLayout, RunnerError, RunnerResult,
    TaskSpec, TrainParams, TrainingInit, TrainingSession, make_export,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal result of a run.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(JobArtifact),
    Failed(RunnerError),
    Stopped,
}

/// Callbacks invoked by the runner while a job is in flight.
///
/// Both are called from the runner's task and must not block.
pub trait RunHooks: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
    fn on_checkpoint(&self, checkpoint: CheckpointRef);
}

/// Durable sink for per-iteration metrics.
///
/// Failures are the sink's concern; they never fail the job.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &ProgressEvent);
}

/// Everything one run needs.
pub struct RunContext {
    pub job_id: JobId,
    pub user_id: String,
    pub task: TaskSpec,
    pub device: Device,
    pub cancel: CancellationToken,
    pub hooks: Arc<dyn RunHooks>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("job_id", &self.job_id)
            .field("user_id", &self.user_id)
            .field("kind", &self.task.kind())
            .field("device", &self.device.id)
            .finish_non_exhaustive()
    }
}

/// Executes workloads of any kind.
pub struct TaskRunner {
    backend: Arc<dyn ModelBackend>,
    resolver: BaseModelResolver,
    layout: RunLayout,
    checkpoint_every: u64,
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("backend", &self.backend.id())
            .field("layout", &self.layout)
            .field("checkpoint_every", &self.checkpoint_every)
            .finish_non_exhaustive()
    }
}

impl TaskRunner {
    /// Creates a runner.
    ///
    /// # Arguments
    /// * `backend` - Model engine
    /// * `resolver` - Base model and stored model lookup
    /// * `layout` - Per-job working directories
    /// * `checkpoint_every` - Default checkpoint interval in iterations
    #[must_use]
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        resolver: BaseModelResolver,
        layout: RunLayout,
        checkpoint_every: u64,
    ) -> Self {
        Self { backend, resolver, layout, checkpoint_every: checkpoint_every.max(1) }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    #[must_use]
    pub fn resolver(&self) -> &BaseModelResolver {
        &self.resolver
    }

    /// Runs a job to a terminal outcome.
    pub async fn run(&self, ctx: RunContext) -> RunOutcome {
        if ctx.cancel.is_cancelled() {
            return RunOutcome::Stopped;
        }
        debug!(job_id = %ctx.job_id, kind = %ctx.task.kind(), device = %ctx.device.id, "Runner started");

        let result = match &ctx.task {
            TaskSpec::Train(params) => self.train(&ctx, params, None).await,
            TaskSpec::Resume { train, checkpoint, .. } => {
                self.train(&ctx, train, Some(checkpoint)).await
            }
            TaskSpec::Infer(params) => self.infer(&ctx, params).await,
            TaskSpec::Export(params) => self.export(&ctx, params).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job_id = %ctx.job_id, error = %e, "Runner failed");
                RunOutcome::Failed(e)
            }
        }
    }

    async fn train(
        &self,
        ctx: &RunContext,
        params: &TrainParams,
        resume_from: Option<&CheckpointRef>,
    ) -> RunnerResult<RunOutcome> {
        self.layout.ensure_job_dirs(&ctx.job_id)?;
        let base_model = self.resolver.resolve(&ctx.user_id, &params.base_model).await?;
        let init = TrainingInit { base_model, params: params.clone(), device: ctx.device.clone() };

        let mut session = match resume_from {
            Some(checkpoint) => {
                if !checkpoint.exists() {
                    return Err(RunnerError::NoCheckpoint(checkpoint.job_id.clone()));
                }
                self.backend.restore_training(init, checkpoint).await?
            }
            None => self.backend.start_training(init).await?,
        };

        let every = params.checkpoint_every.unwrap_or(self.checkpoint_every).max(1);
        let total = session.total_steps();
        let mut last_checkpoint = session.completed_steps();
        let mut interrupted = false;

        while session.completed_steps() < total {
            if ctx.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            match session.run_iteration(&ctx.cancel).await? {
                IterationOutcome::Interrupted => {
                    interrupted = true;
                    break;
                }
                IterationOutcome::Completed(metrics) => {
                    let step = session.completed_steps();
                    if step % every == 0 {
                        self.checkpoint(ctx, session.as_ref(), step).await?;
                        last_checkpoint = step;
                    }
                    ctx.hooks.on_progress(ProgressEvent::new(
                        ctx.job_id.clone(),
                        step,
                        Some(total),
                        metrics,
                    ));
                }
            }
        }

        if interrupted {
            let step = session.completed_steps();
            if step > last_checkpoint {
                self.checkpoint(ctx, session.as_ref(), step).await?;
            }
            info!(job_id = %ctx.job_id, step, "Training stopped at iteration boundary");
            return Ok(RunOutcome::Stopped);
        }

        let weights = session.finalize(&self.layout.output_dir(&ctx.job_id)).await?;
        let model = self
            .resolver
            .storage()
            .save_model(&ctx.user_id, &weights, &params.model_name, &params.labels)
            .await?;
        info!(job_id = %ctx.job_id, model = %model.model_name, steps = total, "Model saved");
        Ok(RunOutcome::Completed(JobArtifact::Model { model }))
    }

    async fn checkpoint(
        &self,
        ctx: &RunContext,
        session: &dyn TrainingSession,
        step: u64,
    ) -> RunnerResult<()> {
        let path = self.layout.checkpoint_path(&ctx.job_id, step);
        session.save_checkpoint(&path).await?;
        debug!(job_id = %ctx.job_id, step, path = %path.display(), "Checkpoint saved");
        ctx.hooks.on_checkpoint(CheckpointRef::new(ctx.job_id.clone(), step, path));
        Ok(())
    }

    async fn infer(&self, ctx: &RunContext, params: &InferParams) -> RunnerResult<RunOutcome> {
        let model_path = self.resolver.stored_model(&ctx.user_id, &params.model_name).await?;
        let labels = self.labels_of(&ctx.user_id, &params.model_name).await?;
        let results = self.backend.infer(&model_path, &labels, params, &ctx.device).await?;
        debug!(job_id = %ctx.job_id, inputs = results.len(), "Inference finished");
        Ok(RunOutcome::Completed(JobArtifact::Predictions { results }))
    }

    async fn export(&self, ctx: &RunContext, params: &ExportParams) -> RunnerResult<RunOutcome> {
        self.layout.ensure_job_dirs(&ctx.job_id)?;
        let model_path = self.resolver.stored_model(&ctx.user_id, &params.model_name).await?;
        let out_dir: PathBuf = self.layout.output_dir(&ctx.job_id);
        let path = self.backend.export(&model_path, params.format, &out_dir, &ctx.device).await?;
        let export = make_export(path, params.format)?;
        debug!(job_id = %ctx.job_id, path = %export.path.display(), "Export finished");
        Ok(RunOutcome::Completed(JobArtifact::Export { export }))
    }

    async fn labels_of(&self, user_id: &str, model_name: &str) -> RunnerResult<Vec<String>> {
        let models = self.resolver.storage().list_models(user_id).await?;
        Ok(models
            .into_iter()
            .filter(|m| m.model_name == model_name)
            .max_by_key(|m| m.created_at)
            .map(|m| m.labels)
            .unwrap_or_default())
    }
}
