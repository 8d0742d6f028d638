//! Admission queue.
//!
//! Holds the jobs waiting for a slot and a device in submission order.

use kiln_training::{DevicePolicy, JobId, TaskSpec};
use std::collections::VecDeque;
use std::time::Duration;

/// A waiting job together with what is needed to start it.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub user_id: String,
    pub task: TaskSpec,
    pub policy: DevicePolicy,
    pub max_duration: Option<Duration>,
}

/// FIFO of [`QueuedJob`]s.
#[derive(Debug, Default)]
pub struct JobQueue {
    items: VecDeque<QueuedJob>,
}

impl JobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: QueuedJob) {
        self.items.push_back(job);
    }

    /// Removes a job wherever it is in the queue.
    pub fn remove(&mut self, job_id: &JobId) -> Option<QueuedJob> {
        let pos = self.items.iter().position(|q| &q.job_id == job_id)?;
        self.items.remove(pos)
    }

    /// Takes every job out, oldest first, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<QueuedJob> {
        self.items.drain(..).collect()
    }

    /// Puts back jobs that were not admitted, ahead of anything queued meanwhile.
    pub fn restore_front(&mut self, jobs: Vec<QueuedJob>) {
        for job in jobs.into_iter().rev() {
            self.items.push_front(job);
        }
    }

    #[must_use]
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.items.iter().any(|q| &q.job_id == job_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedJob> {
        self.items.iter()
    }
}
