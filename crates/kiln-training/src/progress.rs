use crate::job::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named scalar metrics of one iteration (e.g. `loss`, `map50`).
pub type Metrics = BTreeMap<String, f64>;

/// Emitted by a runner after each completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// 1-based index of the completed iteration.
    pub step: u64,
    /// Total iterations of the run, when known.
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub metrics: Metrics,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    #[must_use]
    pub fn new(job_id: JobId, step: u64, total: Option<u64>, metrics: Metrics) -> Self {
        Self { job_id, step, total, metrics, timestamp: Utc::now() }
    }

    /// Human readable one-liner, e.g. `step 3/10 loss=0.2500`.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = match self.total {
            Some(total) => format!("step {}/{}", self.step, total),
            None => format!("step {}", self.step),
        };
        for (name, value) in &self.metrics {
            out.push_str(&format!(" {name}={value:.4}"));
        }
        out
    }
}
