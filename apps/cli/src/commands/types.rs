//! Command type definitions shared between main.rs and the command modules.

use clap::Subcommand;

#[derive(Subcommand, Debug, Clone)]
pub enum ModelsCommand {
    /// List the models stored for a user
    List {
        /// Owner of the models
        #[arg(short, long)]
        user: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a stored model (every saved version of it)
    Delete {
        /// Owner of the model
        #[arg(short, long)]
        user: String,

        /// Model name
        #[arg(short, long)]
        name: String,
    },
}
