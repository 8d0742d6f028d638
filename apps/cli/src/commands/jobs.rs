//! Jobs command implementation.
//!
//! Reads job snapshots from the journal directory; no service is started.

use anyhow::{Context, Result, bail};
use colored::{ColoredString, Colorize};
use kiln_core::{JobJournal, KilnConfig};
use kiln_orchestrator::{Job, JobState};

/// List journaled jobs, optionally restricted to one user.
pub fn execute(config: &KilnConfig, user: Option<&str>, json_output: bool) -> Result<()> {
    let Some(dir) = &config.runtime.journal_dir else {
        bail!("No journal configured; set runtime.journal_dir in the configuration");
    };

    let jobs: Vec<Job> = JobJournal::load_all(dir)
        .with_context(|| format!("Failed to read journal at {}", dir.display()))?
        .into_iter()
        .filter(|job| user.is_none_or(|u| job.user_id == u))
        .collect();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Jobs ({})", jobs.len()).bold().cyan());
    println!();

    if jobs.is_empty() {
        println!("  {}", "No jobs recorded.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:<38} {:<12} {:<8} {:<10} {:<8} {}", "ID", "User", "Kind", "State", "Step", "Created");
    println!("{}", "─".repeat(100));
    for job in &jobs {
        let step = job.current_step().map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "{:<38} {:<12} {:<8} {:<10} {:<8} {}",
            job.id.as_str().cyan(),
            job.user_id,
            job.kind.to_string(),
            paint_state(job.state),
            step,
            job.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    println!();

    Ok(())
}

/// State label colored by outcome.
pub fn paint_state(state: JobState) -> ColoredString {
    let label = format!("{state}");
    match state {
        JobState::Completed => label.green(),
        JobState::Failed => label.red(),
        JobState::Stopped => label.yellow(),
        JobState::Running => label.blue(),
        JobState::Pending | JobState::Queued => label.normal(),
    }
}
