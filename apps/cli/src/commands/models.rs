//! Models command implementation.

use super::types::ModelsCommand;
use anyhow::{Context, Result, bail};
use colored::Colorize;
use kiln_abstraction::StorageGateway;
use kiln_core::{KilnConfig, LocalFsStorage};

/// Execute the models command.
pub async fn execute(config: &KilnConfig, command: ModelsCommand) -> Result<()> {
    let storage = LocalFsStorage::new(&config.storage.root).with_context(|| {
        format!("Failed to open model store at {}", config.storage.root.display())
    })?;

    match command {
        ModelsCommand::List { user, json } => list_models(&storage, &user, json).await,
        ModelsCommand::Delete { user, name } => delete_model(&storage, &user, &name).await,
    }
}

async fn list_models(storage: &LocalFsStorage, user: &str, json_output: bool) -> Result<()> {
    let models = storage.list_models(user).await.context("Failed to list models")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Models of '{}' ({})", user, models.len()).bold().cyan());
    println!();

    if models.is_empty() {
        println!("  {}", "No models stored.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:<24} {:<20} {}", "Name", "Saved", "Labels");
    println!("{}", "─".repeat(70));
    for model in &models {
        let labels = if model.labels.is_empty() { "-".to_string() } else { model.labels.join(",") };
        println!(
            "{:<24} {:<20} {}",
            model.model_name.cyan(),
            model.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            labels
        );
    }
    println!();

    Ok(())
}

async fn delete_model(storage: &LocalFsStorage, user: &str, name: &str) -> Result<()> {
    let deleted = storage.delete_model(user, name).await.context("Failed to delete model")?;
    if !deleted {
        bail!("Model '{}' of user '{}' not found", name, user);
    }
    println!("{} Deleted model '{}' of user '{}'", "✓".green(), name, user);
    Ok(())
}
