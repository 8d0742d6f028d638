//! Kiln Training
//!
//! Backend-agnostic workload primitives for:
//! - Describing jobs (`JobId`, `JobKind`, `JobParams`, `TaskSpec`)
//! - Talking to the black-box model backend (`ModelBackend`, `TrainingSession`)
//! - Progress, checkpoints and artifacts produced by a run
//! - Resolving pretrained weights and laying out per-job working directories

pub mod artifacts;
pub mod backend;
pub mod checkpoint;
pub mod device;
pub mod error;
pub mod job;
pub mod layout;
pub mod progress;
pub mod resolve;
pub mod simulated;

pub use artifacts::{Detection, ExportArtifact, InferenceResult, JobArtifact, make_export, sha256_file};
pub use backend::{IterationOutcome, ModelBackend, TrainingInit, TrainingSession};
pub use checkpoint::CheckpointRef;
pub use device::{Device, DeviceId, DeviceKind, DevicePolicy};
pub use error::{ErrorKind, RunnerError, RunnerResult};
pub use job::{
    ExportFormat, ExportParams, InferParams, JobId, JobKind, JobParams, ResumeParams, TaskSpec,
    TrainParams, validate_model_name,
};
pub use layout::RunLayout;
pub use progress::{Metrics, ProgressEvent};
pub use resolve::BaseModelResolver;
pub use simulated::{Pacing, SimulatedBackend};
