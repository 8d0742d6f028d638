//! Run command implementation.
//!
//! Starts an in-process service on the simulated backend, submits every
//! entry of a batch file in order and follows each job until it is terminal.
//!
//! ```toml
//! step_delay_ms = 20
//!
//! [[jobs]]
//! name = "base"
//! user = "alice"
//! kind = "train"
//! stop_after = 2
//! [jobs.params]
//! base_model = "yolov8n.pt"
//! dataset = "data/cars"
//! epochs = 10
//! model_name = "cars"
//!
//! [[jobs]]
//! user = "alice"
//! kind = "resume"
//! [jobs.params]
//! source_job = "base"
//! ```
//!
//! A Resume whose `source_job` names an earlier entry waits for that entry to
//! finish and then refers to its job id.

use super::jobs::paint_state;
use anyhow::{Context, Result, bail};
use colored::Colorize;
use kiln_core::{Kiln, KilnConfig};
use kiln_orchestrator::{Job, JobState};
use kiln_training::{JobId, JobKind, Pacing, SimulatedBackend};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A batch file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Batch {
    /// Per-iteration delay of the simulated backend.
    #[serde(default)]
    step_delay_ms: u64,
    #[serde(default)]
    jobs: Vec<BatchEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchEntry {
    /// Handle later entries can use as a Resume source.
    #[serde(default)]
    name: Option<String>,
    user: String,
    kind: JobKind,
    #[serde(default)]
    params: toml::Table,
    /// Stop the job once it reports this step.
    #[serde(default)]
    stop_after: Option<u64>,
}

impl Batch {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read batch file {}", path.display()))?;
        let batch: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse batch file {}", path.display()))?;
        if batch.jobs.is_empty() {
            bail!("Batch file {} contains no jobs", path.display());
        }
        Ok(batch)
    }
}

/// A submission the service refused.
#[derive(Debug, Serialize)]
struct Rejection {
    entry: String,
    user: String,
    kind: JobKind,
    error: String,
}

#[derive(Debug, Serialize)]
struct Summary {
    jobs: Vec<Job>,
    rejected: Vec<Rejection>,
}

impl Summary {
    fn failures(&self) -> usize {
        self.jobs.iter().filter(|job| job.state == JobState::Failed).count() + self.rejected.len()
    }
}

/// Execute the run command.
pub async fn execute(config: KilnConfig, batch_path: &Path, json_output: bool, quiet: bool) -> Result<()> {
    let batch = Batch::load(batch_path)?;
    let quiet = quiet || json_output;

    let mut backend = SimulatedBackend::new();
    if batch.step_delay_ms > 0 {
        backend = backend.with_pacing(Pacing::Delay(Duration::from_millis(batch.step_delay_ms)));
    }

    let kiln = Arc::new(Kiln::start(config, Arc::new(backend)).await.context("Failed to start Kiln")?);
    let recovery = kiln.recovery();
    if !quiet && (recovery.requeued > 0 || recovery.interrupted > 0) {
        println!(
            "{} requeued {}, interrupted {} job(s) from the journal",
            "Recovered:".dimmed(),
            recovery.requeued,
            recovery.interrupted
        );
    }

    let mut handles: HashMap<String, JobId> = HashMap::new();
    let mut followers: Vec<(String, JoinHandle<Result<Job>>)> = Vec::new();
    let mut rejected = Vec::new();

    for (index, entry) in batch.jobs.into_iter().enumerate() {
        let label = entry.name.clone().unwrap_or_else(|| format!("#{}", index + 1));
        let mut params = serde_json::to_value(&entry.params)?;

        if entry.kind == JobKind::Resume {
            let source = params.get("source_job").and_then(|v| v.as_str()).and_then(|s| handles.get(s)).cloned();
            if let Some(source) = source {
                // The source has to be terminal before it can be resumed.
                kiln.wait(&source).await.with_context(|| format!("Failed to wait for {source}"))?;
                params["source_job"] = serde_json::Value::String(source.to_string());
            }
        }

        match kiln.submit(&entry.user, entry.kind, params).await {
            Ok(job_id) => {
                info!(entry = %label, job_id = %job_id, "Batch entry submitted");
                if !quiet {
                    println!("{} {} {} ({})", "Submitted".green(), label.bold(), job_id, entry.kind);
                }
                if let Some(name) = &entry.name {
                    handles.insert(name.clone(), job_id.clone());
                }
                let follower = tokio::spawn(follow(
                    Arc::clone(&kiln),
                    label.clone(),
                    entry.user,
                    job_id,
                    entry.stop_after,
                    quiet,
                ));
                followers.push((label, follower));
            }
            Err(e) => {
                warn!(entry = %label, error = %e, "Batch entry rejected");
                if !quiet {
                    println!("{} {}: {}", "Rejected".red(), label.bold(), e);
                }
                rejected.push(Rejection { entry: label, user: entry.user, kind: entry.kind, error: e.to_string() });
            }
        }
    }

    let mut jobs = Vec::with_capacity(followers.len());
    for (label, follower) in followers {
        let job = follower.await.with_context(|| format!("Follower of {label} panicked"))??;
        jobs.push(job);
    }
    kiln.shutdown().await;

    let summary = Summary { jobs, rejected };
    if json_output {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    let failures = summary.failures();
    if failures > 0 {
        bail!("{} of {} job(s) failed", failures, summary.jobs.len() + summary.rejected.len());
    }
    Ok(())
}

/// Streams progress of one job and returns its terminal snapshot.
async fn follow(
    kiln: Arc<Kiln>,
    label: String,
    user: String,
    job_id: JobId,
    stop_after: Option<u64>,
    quiet: bool,
) -> Result<Job> {
    let mut subscription = kiln.subscribe(&job_id).await?;
    let mut stop_sent = false;

    while let Some(event) = subscription.recv().await {
        if !quiet {
            println!("{} {}", format!("[{label}]").cyan(), event.summary());
        }
        if let Some(limit) = stop_after {
            if !stop_sent && event.step >= limit {
                stop_sent = kiln.stop(&user, &job_id).await;
            }
        }
    }

    if subscription.dropped() > 0 {
        warn!(job_id = %job_id, dropped = subscription.dropped(), "Progress events dropped");
    }
    Ok(kiln.get_job(&job_id)?)
}

fn print_summary(summary: &Summary) {
    println!();
    println!("{}", "Summary".bold().cyan());
    println!();
    println!("{:<38} {:<12} {:<8} {:<10} {}", "ID", "User", "Kind", "State", "Detail");
    println!("{}", "─".repeat(100));

    for job in &summary.jobs {
        let detail = match (&job.result, &job.last_error) {
            (Some(result), _) => result.describe(),
            (None, Some(error)) => error.to_string(),
            (None, None) => job.current_step().map_or_else(|| "-".to_string(), |s| format!("stopped at step {s}")),
        };
        println!(
            "{:<38} {:<12} {:<8} {:<10} {}",
            job.id.as_str().cyan(),
            job.user_id,
            job.kind.to_string(),
            paint_state(job.state),
            detail
        );
    }
    for rejection in &summary.rejected {
        println!(
            "{:<38} {:<12} {:<8} {:<10} {}",
            rejection.entry.dimmed(),
            rejection.user,
            rejection.kind.to_string(),
            "rejected".red(),
            rejection.error
        );
    }
    println!();
}
