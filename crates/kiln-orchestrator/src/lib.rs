//! Job scheduling core for Kiln.
//!
//! This crate owns the job state machine and the components that move jobs
//! through it: the registry, the device pool, progress fan-out, the task
//! runner harness and the scheduler that ties them together.

pub mod devices;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod scheduler;

pub use devices::{DeviceManager, DeviceStatus};
pub use dispatcher::{CallbackDispatcher, DEFAULT_BUFFER_CAPACITY, Subscription, SubscriptionId};
pub use error::{DeviceError, RegistryError, SchedulerError};
pub use job::{Job, JobError};
pub use lifecycle::JobState;
pub use queue::{JobQueue, QueuedJob};
pub use registry::{JobObserver, JobRegistry};
pub use runner::{MetricsSink, RunContext, RunHooks, RunOutcome, TaskRunner};
pub use scheduler::{RecoveryReport, Scheduler, SchedulerBuilder, SchedulerConfig, SchedulerStats};
