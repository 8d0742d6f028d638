//! Scheduler.
//!
//! The single authority deciding whether, when and where a job runs. All
//! shared scheduling state (queue, concurrency counters, model leases, active
//! runs and the device pool) lives in one [`SchedulerState`] behind one async
//! mutex. `submit`, `stop` and completion handling each take that lock once,
//! do in-memory work only, and release it; runners execute on their own tasks
//! outside of it.

use crate::devices::{DeviceManager, DeviceStatus};
use crate::dispatcher::{CallbackDispatcher, DEFAULT_BUFFER_CAPACITY, Subscription};
use crate::error::{RegistryError, Result, SchedulerError};
use crate::job::{Job, JobError};
use crate::lifecycle::JobState;
use crate::queue::{JobQueue, QueuedJob};
use crate::registry::{JobObserver, JobRegistry};
use crate::runner::{MetricsSink, RunContext, RunHooks, RunOutcome, TaskRunner};
use kiln_abstraction::StorageGateway;
use kiln_training::{
    BaseModelResolver, CheckpointRef, Device, DeviceId, DevicePolicy, ErrorKind, JobId, JobKind,
    JobParams, ModelBackend, ProgressEvent, RunLayout, TaskSpec, TrainParams,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of running jobs.
    pub global_limit: usize,
    /// Maximum number of running jobs per user.
    pub per_user_limit: usize,
    /// Default max run time, overridable per job.
    pub max_duration: Option<Duration>,
    /// Per-subscription progress buffer.
    pub buffer_capacity: usize,
    /// Default checkpoint interval in iterations.
    pub checkpoint_every: u64,
    /// Root of per-job working directories.
    pub work_dir: PathBuf,
    /// Directory searched for pretrained weights.
    pub pretrained_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_limit: 1,
            per_user_limit: 1,
            max_duration: None,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            checkpoint_every: 1,
            work_dir: PathBuf::from(".kiln/work"),
            pretrained_dir: None,
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub running_total: usize,
    pub running_by_user: BTreeMap<String, usize>,
    pub queued: usize,
    pub free_devices: usize,
    pub total_devices: usize,
}

/// What `recover` did with persisted jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Jobs loaded into the registry.
    pub restored: usize,
    /// Pending/Queued jobs put back in the queue.
    pub requeued: usize,
    /// Jobs found Running and marked Failed.
    pub interrupted: usize,
    /// Waiting jobs that could no longer be prepared (bad params, lost checkpoint).
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum StopReason {
    User,
    Timeout(Duration),
    Shutdown,
}

#[derive(Debug)]
struct ActiveRun {
    user_id: String,
    device: DeviceId,
    cancel: CancellationToken,
    stop_reason: Option<StopReason>,
}

#[derive(Debug)]
struct SchedulerState {
    queue: JobQueue,
    running_total: usize,
    running_by_user: HashMap<String, usize>,
    active: HashMap<JobId, ActiveRun>,
    /// Destination models held by waiting or running jobs.
    leases: HashMap<(String, String), JobId>,
    devices: DeviceManager,
    shutting_down: bool,
}

impl SchedulerState {
    fn release_lease(&mut self, job_id: &JobId) {
        self.leases.retain(|_, holder| holder != job_id);
    }
}

/// Submission params resolved outside the critical section.
struct Prepared {
    task: TaskSpec,
    policy: DevicePolicy,
    max_duration: Option<Duration>,
    resumed_from: Option<JobId>,
    checkpoint: Option<CheckpointRef>,
}

enum Admission {
    Started,
    Denied(&'static str),
    Dropped,
}

struct JobHooks {
    job_id: JobId,
    registry: Arc<JobRegistry>,
    dispatcher: Arc<CallbackDispatcher>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl RunHooks for JobHooks {
    fn on_progress(&self, event: ProgressEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.record(&event);
        }
        self.dispatcher.publish(&event);
        if let Err(e) = self.registry.record_progress(&self.job_id, event) {
            warn!(job_id = %self.job_id, error = %e, "Failed to cache progress");
        }
    }

    fn on_checkpoint(&self, checkpoint: CheckpointRef) {
        if let Err(e) = self.registry.update_checkpoint(&self.job_id, checkpoint) {
            warn!(job_id = %self.job_id, error = %e, "Failed to record checkpoint");
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    dispatcher: Arc<CallbackDispatcher>,
    runner: TaskRunner,
    metrics: Option<Arc<dyn MetricsSink>>,
    state: Mutex<SchedulerState>,
    tracker: TaskTracker,
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    devices: Vec<Device>,
    backend: Option<Arc<dyn ModelBackend>>,
    storage: Option<Arc<dyn StorageGateway>>,
    observer: Option<Arc<dyn JobObserver>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl SchedulerBuilder {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config, devices: Vec::new(), backend: None, storage: None, observer: None, metrics: None }
    }

    #[must_use]
    pub fn devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = devices;
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageGateway>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Receives a snapshot of every job mutation (e.g. a journal).
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn metrics_sink(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the configuration and creates the scheduler.
    pub fn build(self) -> Result<Scheduler> {
        let invalid = |msg: &str| SchedulerError::InvalidConfig(msg.to_string());
        if self.config.global_limit == 0 {
            return Err(invalid("global_limit must be >= 1"));
        }
        if self.config.per_user_limit == 0 {
            return Err(invalid("per_user_limit must be >= 1"));
        }
        if self.devices.is_empty() {
            return Err(invalid("at least one device is required"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.devices.iter().find(|d| !seen.insert(&d.id)) {
            return Err(SchedulerError::InvalidConfig(format!("duplicate device id '{}'", dup.id)));
        }
        let backend = self.backend.ok_or_else(|| invalid("a model backend is required"))?;
        let storage = self.storage.ok_or_else(|| invalid("a storage gateway is required"))?;

        let registry = match self.observer {
            Some(observer) => JobRegistry::with_observer(observer),
            None => JobRegistry::new(),
        };
        let resolver = BaseModelResolver::new(self.config.pretrained_dir.clone(), storage);
        let runner = TaskRunner::new(
            backend,
            resolver,
            RunLayout::new(&self.config.work_dir),
            self.config.checkpoint_every,
        );
        let dispatcher = CallbackDispatcher::new(self.config.buffer_capacity);
        let devices = DeviceManager::new(self.devices);

        info!(
            global_limit = self.config.global_limit,
            per_user_limit = self.config.per_user_limit,
            devices = devices.len(),
            backend = runner.backend().id(),
            "Scheduler ready"
        );

        Ok(Scheduler {
            inner: Arc::new(Inner {
                config: self.config,
                registry: Arc::new(registry),
                dispatcher: Arc::new(dispatcher),
                runner,
                metrics: self.metrics,
                state: Mutex::new(SchedulerState {
                    queue: JobQueue::new(),
                    running_total: 0,
                    running_by_user: HashMap::new(),
                    active: HashMap::new(),
                    leases: HashMap::new(),
                    devices,
                    shutting_down: false,
                }),
                tracker: TaskTracker::new(),
            }),
        })
    }
}

/// Multi-user job scheduler.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Starts building a scheduler.
    #[must_use]
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    /// Submits a job and attempts immediate admission.
    ///
    /// # Arguments
    /// * `user_id` - Submitting user
    /// * `kind` - Job kind
    /// * `params` - Kind-specific params
    ///
    /// # Returns
    /// The new job id. The job is Running if admitted, otherwise Queued.
    ///
    /// # Errors
    /// `Validation`, `NoCheckpoint`, `NotFound` and `ModelBusy` reject the
    /// submission without creating a job.
    pub async fn submit(
        &self,
        user_id: &str,
        kind: JobKind,
        params: serde_json::Value,
    ) -> Result<JobId> {
        if user_id.trim().is_empty() {
            return Err(SchedulerError::Validation("user_id must not be empty".to_string()));
        }
        let parsed = JobParams::parse(kind, &params)?;
        let prepared = self.inner.prepare(user_id, &parsed).await?;

        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return Err(SchedulerError::ShuttingDown);
        }
        if let Some(model) = prepared.task.destination_model() {
            let key = (user_id.to_string(), model.to_string());
            if let Some(holder) = state.leases.get(&key) {
                warn!(user_id = %user_id, model = %model, holder = %holder, "Destination model busy");
                return Err(SchedulerError::ModelBusy {
                    user_id: user_id.to_string(),
                    model_name: model.to_string(),
                    holder: holder.clone(),
                });
            }
        }

        let job = self.inner.registry.create(user_id, kind, params, prepared.resumed_from.clone());
        if let Some(checkpoint) = prepared.checkpoint.clone() {
            self.inner.registry.update_checkpoint(&job.id, checkpoint)?;
        }
        info!(job_id = %job.id, user_id = %user_id, kind = %kind, "Job submitted");
        Inner::enqueue(&mut state, &job, prepared);
        self.inner.schedule_pass(&mut state);
        Ok(job.id)
    }

    /// Requests cancellation of a job.
    ///
    /// Running jobs are signalled and stop at their next iteration boundary;
    /// waiting jobs are removed from the queue and marked Stopped at once.
    ///
    /// # Returns
    /// `false` if the job is unknown, owned by someone else, already being
    /// stopped, or not in a cancellable state.
    pub async fn stop(&self, user_id: &str, job_id: &JobId) -> bool {
        let mut state = self.inner.state.lock().await;
        let Ok(job) = self.inner.registry.get(job_id) else {
            return false;
        };
        if job.user_id != user_id {
            debug!(job_id = %job_id, user_id = %user_id, "Stop refused: not the owner");
            return false;
        }

        match job.state {
            JobState::Running => match state.active.get_mut(job_id) {
                Some(run) if run.stop_reason.is_none() => {
                    run.stop_reason = Some(StopReason::User);
                    run.cancel.cancel();
                    info!(job_id = %job_id, user_id = %user_id, "Stop requested");
                    true
                }
                _ => false,
            },
            JobState::Pending | JobState::Queued => {
                state.queue.remove(job_id);
                match self.inner.registry.transition(job_id, job.state, JobState::Stopped) {
                    Ok(_) => {
                        state.release_lease(job_id);
                        self.inner.dispatcher.close_job(job_id);
                        info!(job_id = %job_id, user_id = %user_id, "Stopped before start");
                        true
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Stop lost a race");
                        false
                    }
                }
            }
            JobState::Completed | JobState::Failed | JobState::Stopped => false,
        }
    }

    /// Snapshot of a job.
    pub fn get_job(&self, job_id: &JobId) -> Result<Job> {
        self.inner.registry.get(job_id).map_err(|e| match e {
            RegistryError::NotFound(id) => SchedulerError::NotFound(id),
            other => other.into(),
        })
    }

    /// Jobs of `user_id` in submission order.
    pub fn list_jobs(&self, user_id: &str) -> Vec<Job> {
        self.inner.registry.list_by_user(user_id)
    }

    /// Every job in submission order.
    pub fn list_all_jobs(&self) -> Vec<Job> {
        self.inner.registry.list_all()
    }

    /// Subscribes to a job's progress with the configured buffer size.
    ///
    /// The stream of a terminal job is already closed.
    pub async fn subscribe(&self, job_id: &JobId) -> Result<Subscription> {
        self.subscribe_with_capacity(job_id, self.inner.config.buffer_capacity).await
    }

    pub async fn subscribe_with_capacity(
        &self,
        job_id: &JobId,
        capacity: usize,
    ) -> Result<Subscription> {
        // Taken so a completion cannot close the stream between the state check and subscribing.
        let _state = self.inner.state.lock().await;
        let job = self.get_job(job_id)?;
        let subscription = self.inner.dispatcher.subscribe_with_capacity(job_id, capacity);
        if job.is_terminal() {
            self.inner.dispatcher.close_job(job_id);
        }
        Ok(subscription)
    }

    /// Waits until the job's progress stream closes and returns its final snapshot.
    ///
    /// Jobs left waiting by [`Scheduler::shutdown`] never close their stream.
    pub async fn wait(&self, job_id: &JobId) -> Result<Job> {
        let mut subscription = self.subscribe(job_id).await?;
        while subscription.recv().await.is_some() {}
        self.get_job(job_id)
    }

    pub async fn list_devices(&self) -> Vec<DeviceStatus> {
        self.inner.state.lock().await.devices.list_devices()
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock().await;
        SchedulerStats {
            running_total: state.running_total,
            running_by_user: state.running_by_user.iter().map(|(u, n)| (u.clone(), *n)).collect(),
            queued: state.queue.len(),
            free_devices: state.devices.free_count(),
            total_devices: state.devices.len(),
        }
    }

    /// Progress events dropped across all subscriptions.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dispatcher.dropped_total()
    }

    /// Reloads persisted jobs.
    ///
    /// Jobs found Running did not survive the restart: they become Failed with
    /// kind `Interrupted`, keeping their checkpoint for a later Resume.
    /// Pending and Queued jobs are queued again in submission order.
    pub async fn recover(&self, jobs: Vec<Job>) -> Result<RecoveryReport> {
        let mut ids: Vec<(u64, JobId)> = jobs.iter().map(|job| (job.seq, job.id.clone())).collect();
        ids.sort();
        let mut report = RecoveryReport { restored: self.inner.registry.restore(jobs)?, ..Default::default() };
        let mut requeue = Vec::new();

        for (_, id) in ids {
            let job = self.get_job(&id)?;
            match job.state {
                JobState::Running => {
                    let err = JobError::new(
                        ErrorKind::Interrupted,
                        "scheduler restarted while the job was running",
                    );
                    self.inner.fail(&job, err);
                    report.interrupted += 1;
                }
                JobState::Pending | JobState::Queued => {
                    let prepared = match JobParams::parse(job.kind, &job.params) {
                        Ok(parsed) => self.inner.prepare(&job.user_id, &parsed).await,
                        Err(e) => Err(e.into()),
                    };
                    match prepared {
                        Ok(prepared) => requeue.push((job, prepared)),
                        Err(e) => {
                            self.inner.fail(&job, JobError::new(e.job_error_kind(), e.to_string()));
                            report.failed += 1;
                        }
                    }
                }
                JobState::Completed | JobState::Failed | JobState::Stopped => {}
            }
        }

        let mut state = self.inner.state.lock().await;
        for (job, prepared) in requeue {
            Inner::enqueue(&mut state, &job, prepared);
            report.requeued += 1;
        }
        info!(
            restored = report.restored,
            requeued = report.requeued,
            interrupted = report.interrupted,
            failed = report.failed,
            "Recovered persisted jobs"
        );
        self.inner.schedule_pass(&mut state);
        Ok(report)
    }

    /// Stops admitting work, cancels running jobs and waits for their runners.
    ///
    /// Cancelled runs end as Failed with kind `Interrupted`; waiting jobs stay
    /// Pending/Queued so a later `recover` picks them up.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;
            for (job_id, run) in &mut state.active {
                if run.stop_reason.is_none() {
                    run.stop_reason = Some(StopReason::Shutdown);
                }
                run.cancel.cancel();
                debug!(job_id = %job_id, "Cancelling for shutdown");
            }
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Scheduler shut down");
    }
}

impl Inner {
    /// Validation and lookups that may touch the filesystem or storage.
    async fn prepare(&self, user_id: &str, parsed: &JobParams) -> Result<Prepared> {
        let mut resumed_from = None;
        let mut checkpoint = None;

        let task = match parsed {
            JobParams::Train(params) => {
                self.check_train(user_id, params).await?;
                TaskSpec::Train(params.clone())
            }
            JobParams::Resume(params) => {
                let source = self.registry.get(&params.source_job).map_err(|_| {
                    SchedulerError::NotFound(params.source_job.clone())
                })?;
                if source.user_id != user_id {
                    return Err(SchedulerError::Validation(format!(
                        "job {} belongs to another user",
                        source.id
                    )));
                }
                let ckpt = source
                    .checkpoint_ref
                    .clone()
                    .filter(CheckpointRef::exists)
                    .ok_or_else(|| SchedulerError::NoCheckpoint(source.id.clone()))?;
                if !matches!(source.state, JobState::Stopped | JobState::Failed) {
                    return Err(SchedulerError::Validation(format!(
                        "job {} is {}; only stopped or failed jobs can be resumed",
                        source.id, source.state
                    )));
                }
                let train = self.origin_train_params(&source)?;
                self.check_train(user_id, &train).await?;
                resumed_from = Some(source.id.clone());
                checkpoint = Some(ckpt.clone());
                TaskSpec::Resume { source_job: source.id, train, checkpoint: ckpt }
            }
            JobParams::Infer(params) => {
                self.check_stored_model(user_id, &params.model_name).await?;
                TaskSpec::Infer(params.clone())
            }
            JobParams::Export(params) => {
                self.check_stored_model(user_id, &params.model_name).await?;
                TaskSpec::Export(params.clone())
            }
        };

        Ok(Prepared {
            policy: self.runner.backend().device_policy(&task),
            max_duration: parsed.max_duration().or(self.config.max_duration),
            task,
            resumed_from,
            checkpoint,
        })
    }

    async fn check_train(&self, user_id: &str, params: &TrainParams) -> Result<()> {
        if !params.dataset.exists() {
            return Err(SchedulerError::Validation(format!(
                "dataset not found: {}",
                params.dataset.display()
            )));
        }
        self.runner.resolver().resolve(user_id, &params.base_model).await?;
        Ok(())
    }

    async fn check_stored_model(&self, user_id: &str, model_name: &str) -> Result<()> {
        match self.runner.resolver().storage().get_model_path(user_id, model_name).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(SchedulerError::Validation(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Train params of the job at the root of a Resume chain.
    fn origin_train_params(&self, source: &Job) -> Result<TrainParams> {
        let mut current = source.clone();
        let mut visited = HashSet::new();
        loop {
            match current.kind {
                JobKind::Train => {
                    return match JobParams::parse(JobKind::Train, &current.params)? {
                        JobParams::Train(params) => Ok(params),
                        _ => Err(SchedulerError::Validation(format!(
                            "job {} has no train params",
                            current.id
                        ))),
                    };
                }
                JobKind::Resume => {
                    let next = current.resumed_from.clone().ok_or_else(|| {
                        SchedulerError::Validation(format!("job {} has no resume source", current.id))
                    })?;
                    if !visited.insert(next.clone()) {
                        return Err(SchedulerError::Validation(format!(
                            "resume chain of job {} loops",
                            source.id
                        )));
                    }
                    current = self.get_job(&next)?;
                }
                JobKind::Infer | JobKind::Export => {
                    return Err(SchedulerError::Validation(format!(
                        "job {} is a {} job and cannot be resumed",
                        current.id, current.kind
                    )));
                }
            }
        }
    }

    fn get_job(&self, job_id: &JobId) -> Result<Job> {
        self.registry.get(job_id).map_err(|_| SchedulerError::NotFound(job_id.clone()))
    }

    fn enqueue(state: &mut SchedulerState, job: &Job, prepared: Prepared) {
        if let Some(model) = prepared.task.destination_model() {
            state.leases.insert((job.user_id.clone(), model.to_string()), job.id.clone());
        }
        state.queue.push(QueuedJob {
            job_id: job.id.clone(),
            user_id: job.user_id.clone(),
            task: prepared.task,
            policy: prepared.policy,
            max_duration: prepared.max_duration,
        });
    }

    /// Marks a job that never ran (or no longer runs) as Failed.
    fn fail(&self, job: &Job, err: JobError) {
        error!(job_id = %job.id, user_id = %job.user_id, error = %err, "Job failed");
        if let Err(e) = self.registry.record_error(&job.id, err) {
            warn!(job_id = %job.id, error = %e, "Failed to record error");
        }
        if let Err(e) = self.registry.transition(&job.id, job.state, JobState::Failed) {
            warn!(job_id = %job.id, error = %e, "Failed to mark job failed");
        }
        self.dispatcher.close_job(&job.id);
    }

    /// One admission pass over the queue in submission order.
    ///
    /// A job that cannot start stays queued without blocking the jobs behind it.
    fn schedule_pass(self: &Arc<Self>, state: &mut SchedulerState) {
        if state.shutting_down {
            return;
        }
        let mut waiting = Vec::new();
        for queued in state.queue.drain() {
            match self.try_admit(state, &queued) {
                Admission::Started | Admission::Dropped => {}
                Admission::Denied(reason) => {
                    self.mark_queued(&queued.job_id, reason);
                    waiting.push(queued);
                }
            }
        }
        state.queue.restore_front(waiting);
    }

    fn mark_queued(&self, job_id: &JobId, reason: &'static str) {
        match self.registry.get(job_id) {
            Ok(job) if job.state == JobState::Pending => {
                match self.registry.transition(job_id, JobState::Pending, JobState::Queued) {
                    Ok(_) => debug!(job_id = %job_id, reason, "Admission denied, job queued"),
                    Err(e) => warn!(job_id = %job_id, error = %e, "Failed to mark job queued"),
                }
            }
            Ok(_) => debug!(job_id = %job_id, reason, "Admission denied"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Queued job missing from registry"),
        }
    }

    fn try_admit(self: &Arc<Self>, state: &mut SchedulerState, queued: &QueuedJob) -> Admission {
        let job = match self.registry.get(&queued.job_id) {
            Ok(job) if job.state.is_waiting() => job,
            Ok(job) => {
                debug!(job_id = %job.id, state = %job.state, "Dropping non-waiting job from queue");
                return Admission::Dropped;
            }
            Err(e) => {
                warn!(job_id = %queued.job_id, error = %e, "Dropping unknown job from queue");
                return Admission::Dropped;
            }
        };

        if state.running_total >= self.config.global_limit {
            return Admission::Denied("global limit reached");
        }
        let user_running = state.running_by_user.get(&queued.user_id).copied().unwrap_or(0);
        if user_running >= self.config.per_user_limit {
            return Admission::Denied("per-user limit reached");
        }

        let device = match state.devices.try_acquire(&queued.job_id, queued.policy) {
            Ok(Some(device)) => device,
            Ok(None) => return Admission::Denied("no suitable device free"),
            Err(e) => {
                state.release_lease(&job.id);
                self.fail(&job, JobError::new(ErrorKind::Device, e.to_string()));
                return Admission::Dropped;
            }
        };

        // One re-fetch on conflict: the job may have moved Pending -> Queued.
        let assigned = match self.registry.assign(&job.id, job.state, device.id.clone()) {
            Err(RegistryError::Conflict { actual, .. }) if actual.is_waiting() => {
                self.registry.assign(&job.id, actual, device.id.clone())
            }
            other => other,
        };
        if let Err(e) = assigned {
            warn!(job_id = %job.id, error = %e, "Admission lost a race");
            if let Err(e) = state.devices.release(&device.id) {
                error!(device = %device.id, error = %e, "Failed to return device");
            }
            return Admission::Dropped;
        }

        self.start(state, queued, device);
        Admission::Started
    }

    fn start(self: &Arc<Self>, state: &mut SchedulerState, queued: &QueuedJob, device: Device) {
        let cancel = CancellationToken::new();
        state.running_total += 1;
        *state.running_by_user.entry(queued.user_id.clone()).or_insert(0) += 1;
        state.active.insert(
            queued.job_id.clone(),
            ActiveRun {
                user_id: queued.user_id.clone(),
                device: device.id.clone(),
                cancel: cancel.clone(),
                stop_reason: None,
            },
        );
        info!(
            job_id = %queued.job_id,
            user_id = %queued.user_id,
            device = %device.id,
            running_total = state.running_total,
            "Job admitted"
        );

        let hooks = Arc::new(JobHooks {
            job_id: queued.job_id.clone(),
            registry: Arc::clone(&self.registry),
            dispatcher: Arc::clone(&self.dispatcher),
            metrics: self.metrics.clone(),
        });
        let ctx = RunContext {
            job_id: queued.job_id.clone(),
            user_id: queued.user_id.clone(),
            task: queued.task.clone(),
            device,
            cancel: cancel.clone(),
            hooks,
        };

        let inner = Arc::clone(self);
        let job_id = queued.job_id.clone();
        self.tracker.spawn(async move {
            let outcome = inner.runner.run(ctx).await;
            inner.finish(&job_id, outcome).await;
        });

        if let Some(limit) = queued.max_duration {
            let inner = Arc::clone(self);
            let job_id = queued.job_id.clone();
            self.tracker.spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(limit) => inner.expire(&job_id, limit).await,
                }
            });
        }
    }

    async fn expire(&self, job_id: &JobId, limit: Duration) {
        let mut state = self.state.lock().await;
        if let Some(run) = state.active.get_mut(job_id) {
            if run.stop_reason.is_none() {
                warn!(job_id = %job_id, limit_secs = limit.as_secs(), "Max duration exceeded, cancelling");
                run.stop_reason = Some(StopReason::Timeout(limit));
                run.cancel.cancel();
            }
        }
    }

    /// Completion handling: record the terminal state, free resources, re-run admission.
    async fn finish(self: &Arc<Self>, job_id: &JobId, outcome: RunOutcome) {
        let mut state = self.state.lock().await;
        let Some(run) = state.active.remove(job_id) else {
            warn!(job_id = %job_id, "Completion for a job that is not active");
            return;
        };

        let (target, err) = match outcome {
            RunOutcome::Completed(artifact) => {
                if let Err(e) = self.registry.record_result(job_id, artifact) {
                    warn!(job_id = %job_id, error = %e, "Failed to record result");
                }
                (JobState::Completed, None)
            }
            RunOutcome::Failed(e) => (JobState::Failed, Some(JobError::from(&e))),
            RunOutcome::Stopped => match run.stop_reason {
                Some(StopReason::Timeout(limit)) => (
                    JobState::Failed,
                    Some(JobError::new(
                        ErrorKind::Timeout,
                        format!("exceeded max duration of {}s", limit.as_secs()),
                    )),
                ),
                Some(StopReason::Shutdown) => (
                    JobState::Failed,
                    Some(JobError::new(ErrorKind::Interrupted, "scheduler shut down during the run")),
                ),
                Some(StopReason::User) | None => (JobState::Stopped, None),
            },
        };

        if let Some(err) = &err {
            if let Err(e) = self.registry.record_error(job_id, err.clone()) {
                warn!(job_id = %job_id, error = %e, "Failed to record error");
            }
        }
        if let Err(e) = self.registry.transition(job_id, JobState::Running, target) {
            error!(job_id = %job_id, error = %e, "Failed to record terminal state");
        }

        match state.devices.release(&run.device) {
            Ok(holder) if &holder == job_id => {}
            Ok(holder) => {
                error!(job_id = %job_id, holder = %holder, device = %run.device, "Device was bound to another job");
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to release device"),
        }
        state.running_total = state.running_total.saturating_sub(1);
        if let Some(count) = state.running_by_user.get_mut(&run.user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.running_by_user.remove(&run.user_id);
            }
        }
        state.release_lease(job_id);
        run.cancel.cancel();

        match &err {
            Some(err) => error!(job_id = %job_id, user_id = %run.user_id, state = %target, error = %err, "Job finished"),
            None => info!(job_id = %job_id, user_id = %run.user_id, state = %target, "Job finished"),
        }

        self.schedule_pass(&mut state);
        // Closed after the pass so a waiter observes the jobs admitted in its place.
        self.dispatcher.close_job(job_id);
    }
}
