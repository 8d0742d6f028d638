//! A deterministic in-process backend.
//!
//! Produces JSON checkpoints and weights whose loss curve depends only on the
//! step counter, which makes it suitable for local batches and for tests that
//! need to control exactly how many iterations run.

use crate::artifacts::{Detection, InferenceResult};
use crate::backend::{IterationOutcome, ModelBackend, TrainingInit, TrainingSession};
use crate::checkpoint::CheckpointRef;
use crate::device::{Device, DeviceKind, DevicePolicy};
use crate::error::{RunnerError, RunnerResult};
use crate::job::{ExportFormat, InferParams, TaskSpec};
use crate::progress::Metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How fast simulated iterations complete.
#[derive(Debug, Clone, Default)]
pub enum Pacing {
    /// Yield to the scheduler and continue.
    #[default]
    Immediate,
    /// Sleep for a fixed time per iteration.
    Delay(Duration),
    /// Consume one permit per iteration; tests release permits to advance runs.
    Gated(Arc<Semaphore>),
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    pacing: Pacing,
    requires_accelerator: bool,
    fail_at_step: Option<u64>,
}

impl SimulatedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Train/Resume only run on accelerators.
    #[must_use]
    pub fn requiring_accelerator(mut self, required: bool) -> Self {
        self.requires_accelerator = required;
        self
    }

    /// Fail with a workload error when iteration `step` would complete.
    #[must_use]
    pub fn failing_at(mut self, step: u64) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    fn session(&self, init: &TrainingInit, step: u64) -> SimulatedSession {
        SimulatedSession {
            base_model: init.base_model.clone(),
            epochs: init.params.epochs,
            labels: init.params.labels.clone(),
            step,
            pacing: self.pacing.clone(),
            fail_at_step: self.fail_at_step,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimulatedCheckpoint {
    base_model: PathBuf,
    epochs: u64,
    step: u64,
    loss: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimulatedWeights {
    base_model: PathBuf,
    steps: u64,
    loss: f64,
    #[serde(default)]
    labels: Vec<String>,
}

fn loss_at(step: u64) -> f64 {
    1.0 / (step as f64 + 1.0)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> RunnerResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

#[derive(Debug)]
struct SimulatedSession {
    base_model: PathBuf,
    epochs: u64,
    labels: Vec<String>,
    step: u64,
    pacing: Pacing,
    fail_at_step: Option<u64>,
}

impl SimulatedSession {
    /// Returns `false` if cancellation won the race.
    async fn pace(&self, cancel: &CancellationToken) -> RunnerResult<bool> {
        match &self.pacing {
            Pacing::Immediate => {
                tokio::task::yield_now().await;
                Ok(!cancel.is_cancelled())
            }
            Pacing::Delay(d) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Ok(false),
                    () = tokio::time::sleep(*d) => Ok(true),
                }
            }
            Pacing::Gated(gate) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Ok(false),
                    permit = gate.acquire() => {
                        permit
                            .map_err(|_| RunnerError::Workload("iteration gate closed".to_string()))?
                            .forget();
                        Ok(true)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TrainingSession for SimulatedSession {
    fn completed_steps(&self) -> u64 {
        self.step
    }

    fn total_steps(&self) -> u64 {
        self.epochs
    }

    async fn run_iteration(&mut self, cancel: &CancellationToken) -> RunnerResult<IterationOutcome> {
        if !self.pace(cancel).await? {
            return Ok(IterationOutcome::Interrupted);
        }

        let next = self.step + 1;
        if self.fail_at_step == Some(next) {
            return Err(RunnerError::Workload(format!("malformed batch at step {next}")));
        }
        self.step = next;

        let mut metrics = Metrics::new();
        metrics.insert("loss".to_string(), loss_at(next));
        metrics.insert("map50".to_string(), next as f64 / self.epochs as f64);
        Ok(IterationOutcome::Completed(metrics))
    }

    async fn save_checkpoint(&self, path: &Path) -> RunnerResult<()> {
        let ckpt = SimulatedCheckpoint {
            base_model: self.base_model.clone(),
            epochs: self.epochs,
            step: self.step,
            loss: loss_at(self.step),
        };
        write_json(path, &ckpt)
    }

    async fn finalize(self: Box<Self>, out_dir: &Path) -> RunnerResult<PathBuf> {
        let path = out_dir.join("weights.json");
        let weights = SimulatedWeights {
            base_model: self.base_model.clone(),
            steps: self.step,
            loss: loss_at(self.step),
            labels: self.labels.clone(),
        };
        write_json(&path, &weights)?;
        Ok(path)
    }
}

#[async_trait]
impl ModelBackend for SimulatedBackend {
    fn id(&self) -> &'static str {
        "simulated"
    }

    fn device_policy(&self, task: &TaskSpec) -> DevicePolicy {
        match task {
            TaskSpec::Train(_) | TaskSpec::Resume { .. } if self.requires_accelerator => {
                DevicePolicy::Require(DeviceKind::Accelerator)
            }
            _ => DevicePolicy::Prefer(DeviceKind::Accelerator),
        }
    }

    async fn start_training(&self, init: TrainingInit) -> RunnerResult<Box<dyn TrainingSession>> {
        debug!(base_model = %init.base_model.display(), device = %init.device.id, "Starting simulated session");
        Ok(Box::new(self.session(&init, 0)))
    }

    async fn restore_training(
        &self,
        init: TrainingInit,
        checkpoint: &CheckpointRef,
    ) -> RunnerResult<Box<dyn TrainingSession>> {
        let bytes = match std::fs::read(&checkpoint.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RunnerError::NoCheckpoint(checkpoint.job_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let ckpt: SimulatedCheckpoint = serde_json::from_slice(&bytes)?;
        if ckpt.step > init.params.epochs {
            return Err(RunnerError::Workload(format!(
                "checkpoint step {} exceeds epochs {}",
                ckpt.step, init.params.epochs
            )));
        }
        debug!(step = ckpt.step, device = %init.device.id, "Restoring simulated session");
        Ok(Box::new(self.session(&init, ckpt.step)))
    }

    async fn infer(
        &self,
        model_path: &Path,
        labels: &[String],
        params: &InferParams,
        _device: &Device,
    ) -> RunnerResult<Vec<InferenceResult>> {
        if !model_path.exists() {
            return Err(RunnerError::Workload(format!(
                "model file missing: {}",
                model_path.display()
            )));
        }

        let results = params
            .inputs
            .iter()
            .map(|input| {
                // Two candidates per input; the confidence threshold decides which survive.
                let width = 32.0 + (input.len() % 16) as f32 * 8.0;
                let candidates = [
                    Detection {
                        bbox: [0.0, 0.0, width, width],
                        score: 0.9,
                        label: labels.first().cloned().unwrap_or_else(|| "0".to_string()),
                    },
                    Detection {
                        bbox: [width, width, width * 2.0, width * 2.0],
                        score: 0.2,
                        label: labels.get(1).cloned().unwrap_or_else(|| "1".to_string()),
                    },
                ];
                InferenceResult {
                    input: input.clone(),
                    detections: candidates.into_iter().filter(|d| d.score >= params.conf).collect(),
                }
            })
            .collect();
        Ok(results)
    }

    async fn export(
        &self,
        model_path: &Path,
        format: ExportFormat,
        out_dir: &Path,
        _device: &Device,
    ) -> RunnerResult<PathBuf> {
        let weights = std::fs::read(model_path).map_err(|e| {
            RunnerError::Workload(format!("cannot read model {}: {e}", model_path.display()))
        })?;
        std::fs::create_dir_all(out_dir)?;

        let stem = model_path.file_stem().and_then(|s| s.to_str()).unwrap_or("model");
        let path = out_dir.join(format!("{stem}.{}", format.extension()));
        let mut bytes = format!("kiln-export:{format:?}\n").into_bytes();
        bytes.extend_from_slice(&weights);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}
