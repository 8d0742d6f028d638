//! Job registry.
//!
//! The registry is the source of truth for every [`Job`]. All state changes go
//! through compare-and-swap style calls so that two callers racing on the same
//! job cannot both win.
//!
//! Operations are in-memory and never await, so they are safe to call from
//! synchronous runner hooks as well as from inside the scheduler's critical
//! section.

use crate::error::RegistryError;
use crate::job::{Job, JobError};
use crate::lifecycle::JobState;
use chrono::Utc;
use kiln_training::{CheckpointRef, DeviceId, JobArtifact, JobId, JobKind, ProgressEvent};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, RegistryError>;

/// Receives a snapshot after every registry mutation.
///
/// Called while the registry write lock is held; implementations must not block.
pub trait JobObserver: Send + Sync {
    fn job_changed(&self, job: &Job);
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<JobId, Job>,
    /// Ids in creation order.
    order: Vec<JobId>,
    next_seq: u64,
}

/// Registry of all jobs known to the scheduler.
pub struct JobRegistry {
    inner: RwLock<RegistryInner>,
    observer: Option<Arc<dyn JobObserver>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_count", &self.inner.try_read().map(|i| i.jobs.len()).unwrap_or(0))
            .field("observed", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: RwLock::new(RegistryInner { next_seq: 1, ..Default::default() }), observer: None }
    }

    /// Creates an empty registry reporting every mutation to `observer`.
    #[must_use]
    pub fn with_observer(observer: Arc<dyn JobObserver>) -> Self {
        Self { observer: Some(observer), ..Self::new() }
    }

    // A panic while holding the lock leaves the map structurally intact, so a
    // poisoned lock is recovered rather than propagated.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, job: &Job) {
        if let Some(observer) = &self.observer {
            observer.job_changed(job);
        }
    }

    /// Applies `f` to a job and stamps `updated_at`.
    fn mutate<F>(&self, job_id: &JobId, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let mut inner = self.write();
        let job = inner.jobs.get_mut(job_id).ok_or_else(|| RegistryError::NotFound(job_id.clone()))?;
        f(job)?;
        job.updated_at = Utc::now();
        let snapshot = job.clone();
        self.notify(&snapshot);
        Ok(snapshot)
    }

    /// Creates a new job in `Pending`.
    ///
    /// # Arguments
    /// * `user_id` - Owner
    /// * `kind` - Job kind
    /// * `params` - Raw params as submitted
    /// * `resumed_from` - Source job of a Resume
    ///
    /// # Returns
    /// A snapshot of the created job.
    pub fn create(
        &self,
        user_id: &str,
        kind: JobKind,
        params: serde_json::Value,
        resumed_from: Option<JobId>,
    ) -> Job {
        let mut inner = self.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let job = Job::new(seq, user_id, kind, params, resumed_from);
        inner.order.push(job.id.clone());
        inner.jobs.insert(job.id.clone(), job.clone());
        debug!(job_id = %job.id, user_id = %user_id, kind = %kind, seq, "Job created");
        self.notify(&job);
        job
    }

    /// Gets a snapshot of a job.
    pub fn get(&self, job_id: &JobId) -> Result<Job> {
        self.read().jobs.get(job_id).cloned().ok_or_else(|| RegistryError::NotFound(job_id.clone()))
    }

    /// Jobs of `user_id` in creation order.
    pub fn list_by_user(&self, user_id: &str) -> Vec<Job> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| job.user_id == user_id)
            .cloned()
            .collect()
    }

    /// All jobs in creation order.
    pub fn list_all(&self) -> Vec<Job> {
        let inner = self.read();
        inner.order.iter().filter_map(|id| inner.jobs.get(id)).cloned().collect()
    }

    /// Compare-and-swap on job state.
    ///
    /// `Running` is not a valid target here; use [`JobRegistry::assign`], which
    /// binds the device in the same step. Leaving `Running` clears the device.
    ///
    /// # Errors
    /// `Conflict` if the stored state is not `expected`, `InvalidTransition`
    /// if the state machine refuses the move.
    pub fn transition(&self, job_id: &JobId, expected: JobState, new_state: JobState) -> Result<Job> {
        self.mutate(job_id, |job| {
            check_expected(job, expected)?;
            if new_state == JobState::Running || !job.state.can_transition_to(new_state) {
                return Err(RegistryError::InvalidTransition {
                    job_id: job.id.clone(),
                    from: job.state,
                    to: new_state,
                });
            }
            debug!(job_id = %job.id, from = ?job.state, to = ?new_state, "State transition");
            if job.state == JobState::Running {
                job.assigned_device = None;
            }
            if new_state.is_terminal() {
                job.finished_at = Some(Utc::now());
            }
            job.state = new_state;
            Ok(())
        })
    }

    /// Compare-and-swap into `Running`, binding `device`.
    pub fn assign(&self, job_id: &JobId, expected: JobState, device: DeviceId) -> Result<Job> {
        self.mutate(job_id, |job| {
            check_expected(job, expected)?;
            if !job.state.can_transition_to(JobState::Running) {
                return Err(RegistryError::InvalidTransition {
                    job_id: job.id.clone(),
                    from: job.state,
                    to: JobState::Running,
                });
            }
            debug!(job_id = %job.id, from = ?job.state, device = %device, "Job assigned");
            job.state = JobState::Running;
            job.assigned_device = Some(device);
            job.started_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Records the latest checkpoint. Allowed in any state.
    pub fn update_checkpoint(&self, job_id: &JobId, checkpoint: CheckpointRef) -> Result<Job> {
        self.mutate(job_id, |job| {
            job.checkpoint_ref = Some(checkpoint);
            Ok(())
        })
    }

    /// Attaches an error to a job that is not yet terminal.
    pub fn record_error(&self, job_id: &JobId, error: JobError) -> Result<Job> {
        self.mutate(job_id, |job| {
            ensure_mutable(job)?;
            job.last_error = Some(error);
            Ok(())
        })
    }

    /// Caches the latest progress event of a running job.
    pub fn record_progress(&self, job_id: &JobId, event: ProgressEvent) -> Result<Job> {
        self.mutate(job_id, |job| {
            ensure_mutable(job)?;
            job.latest_progress = Some(event);
            Ok(())
        })
    }

    /// Stores the artifact of a job about to complete.
    pub fn record_result(&self, job_id: &JobId, artifact: JobArtifact) -> Result<Job> {
        self.mutate(job_id, |job| {
            ensure_mutable(job)?;
            job.result = Some(artifact);
            Ok(())
        })
    }

    /// Seeds the registry from persisted snapshots.
    ///
    /// Jobs are ordered by `seq` and the counter continues after the highest one.
    pub fn restore(&self, mut jobs: Vec<Job>) -> Result<usize> {
        jobs.sort_by_key(|job| job.seq);
        let mut inner = self.write();
        if let Some(dup) = jobs.iter().find(|job| inner.jobs.contains_key(&job.id)) {
            return Err(RegistryError::Duplicate(dup.id.clone()));
        }

        let count = jobs.len();
        for job in jobs {
            inner.next_seq = inner.next_seq.max(job.seq + 1);
            inner.order.push(job.id.clone());
            inner.jobs.insert(job.id.clone(), job);
        }
        let inner = &mut *inner;
        inner.order.sort_by_key(|id| inner.jobs.get(id).map_or(0, |job| job.seq));
        debug!(count, next_seq = inner.next_seq, "Registry restored");
        Ok(count)
    }
}

fn check_expected(job: &Job, expected: JobState) -> Result<()> {
    if job.state == expected {
        Ok(())
    } else {
        warn!(job_id = %job.id, expected = ?expected, actual = ?job.state, "Transition conflict");
        Err(RegistryError::Conflict { job_id: job.id.clone(), expected, actual: job.state })
    }
}

fn ensure_mutable(job: &Job) -> Result<()> {
    if job.is_terminal() { Err(RegistryError::Immutable(job.id.clone())) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_training::{ErrorKind, Metrics};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn registry_with_job() -> (JobRegistry, JobId) {
        let registry = JobRegistry::new();
        let job = registry.create("alice", JobKind::Train, json!({"epochs": 1}), None);
        (registry, job.id)
    }

    #[test]
    fn test_create_and_get() {
        let (registry, id) = registry_with_job();
        let job = registry.get(&id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.user_id, "alice");
        assert_eq!(job.seq, 1);
    }

    #[test]
    fn test_get_unknown() {
        let registry = JobRegistry::new();
        let err = registry.get(&JobId::from("missing")).unwrap_err();
        assert_eq!(err, RegistryError::NotFound(JobId::from("missing")));
    }

    #[test]
    fn test_list_by_user_in_creation_order() {
        let registry = JobRegistry::new();
        let a1 = registry.create("alice", JobKind::Train, json!({}), None);
        registry.create("bob", JobKind::Train, json!({}), None);
        let a2 = registry.create("alice", JobKind::Infer, json!({}), None);

        let ids: Vec<JobId> = registry.list_by_user("alice").into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a1.id, a2.id]);
        assert_eq!(registry.list_all().len(), 3);
    }

    #[test]
    fn test_transition_cas_conflict() {
        let (registry, id) = registry_with_job();
        registry.transition(&id, JobState::Pending, JobState::Queued).unwrap();

        let err = registry.transition(&id, JobState::Pending, JobState::Queued).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Conflict { expected: JobState::Pending, actual: JobState::Queued, .. }
        ));
    }

    #[test]
    fn test_transition_refuses_running_target() {
        let (registry, id) = registry_with_job();
        let err = registry.transition(&id, JobState::Pending, JobState::Running).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[test]
    fn test_assign_binds_and_leaving_running_unbinds() {
        let (registry, id) = registry_with_job();
        let job = registry.assign(&id, JobState::Pending, DeviceId::from("gpu0")).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.assigned_device, Some(DeviceId::from("gpu0")));
        assert!(job.started_at.is_some());

        let job = registry.transition(&id, JobState::Running, JobState::Completed).unwrap();
        assert!(job.assigned_device.is_none());
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_double_assign_conflicts() {
        let (registry, id) = registry_with_job();
        registry.assign(&id, JobState::Pending, DeviceId::from("gpu0")).unwrap();
        let err = registry.assign(&id, JobState::Pending, DeviceId::from("gpu1")).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
        assert_eq!(registry.get(&id).unwrap().assigned_device, Some(DeviceId::from("gpu0")));
    }

    #[test]
    fn test_terminal_job_is_immutable_except_checkpoint() {
        let (registry, id) = registry_with_job();
        registry.transition(&id, JobState::Pending, JobState::Stopped).unwrap();

        let err = registry.record_error(&id, JobError::new(ErrorKind::Runner, "late")).unwrap_err();
        assert_eq!(err, RegistryError::Immutable(id.clone()));
        let event = ProgressEvent::new(id.clone(), 1, None, Metrics::new());
        assert!(registry.record_progress(&id, event).is_err());

        let ckpt = CheckpointRef::new(id.clone(), 3, PathBuf::from("/tmp/ckpt"));
        let job = registry.update_checkpoint(&id, ckpt).unwrap();
        assert_eq!(job.checkpoint_ref.map(|c| c.step), Some(3));

        let err = registry.transition(&id, JobState::Stopped, JobState::Queued).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[test]
    fn test_restore_continues_seq() {
        let registry = JobRegistry::new();
        let mut old = Job::new(5, "alice", JobKind::Train, json!({}), None);
        old.state = JobState::Completed;
        let mut older = Job::new(2, "bob", JobKind::Infer, json!({}), None);
        older.state = JobState::Failed;
        assert_eq!(registry.restore(vec![old.clone(), older.clone()]).unwrap(), 2);

        let ids: Vec<JobId> = registry.list_all().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![older.id, old.id.clone()]);

        let next = registry.create("alice", JobKind::Train, json!({}), None);
        assert_eq!(next.seq, 6);

        assert_eq!(registry.restore(vec![old.clone()]).unwrap_err(), RegistryError::Duplicate(old.id));
    }

    struct Recorder(Mutex<Vec<JobState>>);

    impl JobObserver for Recorder {
        fn job_changed(&self, job: &Job) {
            self.0.lock().unwrap().push(job.state);
        }
    }

    #[test]
    fn test_observer_sees_every_mutation() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let registry = JobRegistry::with_observer(recorder.clone());
        let job = registry.create("alice", JobKind::Train, json!({}), None);
        registry.transition(&job.id, JobState::Pending, JobState::Queued).unwrap();
        registry.assign(&job.id, JobState::Queued, DeviceId::from("cpu0")).unwrap();

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen, vec![JobState::Pending, JobState::Queued, JobState::Running]);
    }
}
