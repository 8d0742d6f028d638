//! Job journal.
//!
//! Keeps the latest snapshot of every job as `<dir>/<job_id>.json` so that a
//! restarted service can hand them to `Scheduler::recover`. Snapshots arrive
//! through [`JobObserver`] and are written by a background task, each one
//! through a temporary file and a rename.

use crate::error::Result;
use kiln_orchestrator::{Job, JobObserver};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SNAPSHOT_EXTENSION: &str = "json";

#[derive(Debug)]
pub struct JobJournal {
    dir: PathBuf,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl JobJournal {
    /// Creates `dir` if needed and starts the writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_snapshots(dir.clone(), rx));
        debug!(dir = %dir.display(), "Job journal opened");
        Ok(Self { dir, tx: Mutex::new(Some(tx)), writer: tokio::sync::Mutex::new(Some(writer)) })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads every snapshot in `dir`, ordered by submission.
    ///
    /// A missing directory yields no jobs; unreadable snapshots are skipped.
    pub fn load_all(dir: &Path) -> Result<Vec<Job>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != SNAPSHOT_EXTENSION) {
                continue;
            }
            let parsed = std::fs::read(&path)
                .map_err(crate::error::CoreError::from)
                .and_then(|bytes| serde_json::from_slice::<Job>(&bytes).map_err(Into::into));
            match parsed {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job snapshot"),
            }
        }
        jobs.sort_by_key(|job| job.seq);
        debug!(dir = %dir.display(), count = jobs.len(), "Job journal loaded");
        Ok(jobs)
    }

    /// Stops accepting snapshots and waits until queued ones are written.
    pub async fn close(&self) {
        // A poisoned lock only means another thread panicked mid-send.
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.await {
                warn!(dir = %self.dir.display(), error = %e, "Journal writer task failed");
            }
        }
    }
}

impl JobObserver for JobJournal {
    fn job_changed(&self, job: &Job) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(job.clone()).is_err() {
                    warn!(job_id = %job.id, "Journal writer is gone, snapshot dropped");
                }
            }
            None => debug!(job_id = %job.id, state = %job.state, "Journal closed, snapshot dropped"),
        }
    }
}

async fn write_snapshots(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        if let Err(e) = write_snapshot(&dir, &job).await {
            warn!(job_id = %job.id, error = %e, "Failed to write job snapshot");
        }
    }
}

async fn write_snapshot(dir: &Path, job: &Job) -> Result<()> {
    let path = dir.join(format!("{}.{}", job.id, SNAPSHOT_EXTENSION));
    let tmp = dir.join(format!("{}.{}.tmp", job.id, SNAPSHOT_EXTENSION));
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(job)?).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}
