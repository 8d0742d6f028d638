//! Devices command implementation.

use anyhow::Result;
use colored::Colorize;
use kiln_core::KilnConfig;

/// Print the configured device pool.
pub fn execute(config: &KilnConfig, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(&config.devices)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Devices ({})", config.devices.len()).bold().cyan());
    println!();

    if config.devices.is_empty() {
        println!("  {}", "No devices configured.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:<20} {}", "ID", "Kind");
    println!("{}", "─".repeat(40));
    for device in &config.devices {
        println!("{:<20} {}", device.id.cyan(), device.kind);
    }
    println!();
    println!(
        "  {} global limit {}, per-user limit {}",
        "Admission:".dimmed(),
        config.scheduler.global_limit,
        config.scheduler.per_user_limit
    );
    println!();

    Ok(())
}
