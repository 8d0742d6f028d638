//! Append-only JSONL metrics log.
//!
//! Every progress event becomes one line `{job_id, step, metrics, created_at}`.
//! Writes happen on a background task; a failed write is logged and never
//! reaches the job that produced the event.

use crate::error::Result;
use chrono::{DateTime, Utc};
use kiln_orchestrator::MetricsSink;
use kiln_training::{JobId, Metrics, ProgressEvent};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One line of the metrics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub job_id: JobId,
    pub step: u64,
    pub metrics: Metrics,
    pub created_at: DateTime<Utc>,
}

impl From<&ProgressEvent> for MetricsRecord {
    fn from(event: &ProgressEvent) -> Self {
        Self {
            job_id: event.job_id.clone(),
            step: event.step,
            metrics: event.metrics.clone(),
            created_at: event.timestamp,
        }
    }
}

/// [`MetricsSink`] appending to a JSONL file.
#[derive(Debug)]
pub struct JsonlMetricsSink {
    path: PathBuf,
    tx: Mutex<Option<mpsc::UnboundedSender<MetricsRecord>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl JsonlMetricsSink {
    /// Opens `path` for appending and starts the writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_records(tokio::fs::File::from_std(file), rx, path.clone()));
        debug!(path = %path.display(), "Metrics log opened");

        Ok(Self { path, tx: Mutex::new(Some(tx)), writer: tokio::sync::Mutex::new(Some(writer)) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting records and waits until queued ones are written.
    pub async fn close(&self) {
        // A poisoned lock only means another thread panicked mid-send.
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.await {
                warn!(path = %self.path.display(), error = %e, "Metrics writer task failed");
            }
        }
    }

    /// Reads every record of a metrics log.
    pub fn read_all(path: &Path) -> Result<Vec<MetricsRecord>> {
        let content = std::fs::read_to_string(path)?;
        let mut records = Vec::new();
        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn record(&self, event: &ProgressEvent) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(MetricsRecord::from(event)).is_err() {
                    warn!(job_id = %event.job_id, step = event.step, "Metrics writer is gone, record dropped");
                }
            }
            None => debug!(job_id = %event.job_id, step = event.step, "Metrics log closed, record dropped"),
        }
    }
}

async fn write_records(
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<MetricsRecord>,
    path: PathBuf,
) {
    while let Some(record) = rx.recv().await {
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(job_id = %record.job_id, error = %e, "Failed to encode metrics");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = file.write_all(&line).await {
            warn!(path = %path.display(), error = %e, "Failed to append metrics");
            continue;
        }
        if let Err(e) = file.flush().await {
            warn!(path = %path.display(), error = %e, "Failed to flush metrics");
        }
    }
}
