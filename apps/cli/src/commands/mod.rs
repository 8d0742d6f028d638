//! Command implementations for the Kiln CLI.

pub mod devices;
pub mod jobs;
pub mod models;
pub mod run;
pub mod types;
