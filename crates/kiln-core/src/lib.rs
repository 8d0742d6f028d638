//! Kiln Core
//!
//! The service layer around the scheduling core:
//! - Layered configuration (`KilnConfig`)
//! - Tracing setup for hosts
//! - Local filesystem model store
//! - JSONL metrics log and the job journal used for restart recovery
//! - The `Kiln` service facade

pub mod config;
pub mod error;
pub mod journal;
pub mod logging;
pub mod metrics;
pub mod service;
pub mod storage;

pub use config::{ConfigError, KilnConfig};
pub use error::{CoreError, Result};
pub use journal::JobJournal;
pub use logging::LogFormat;
pub use metrics::{JsonlMetricsSink, MetricsRecord};
pub use service::Kiln;
pub use storage::LocalFsStorage;
