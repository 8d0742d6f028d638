//! The Kiln service.
//!
//! Wires configuration, the local model store, the job journal and the
//! metrics log around a [`Scheduler`], and recovers persisted jobs on start.

use crate::config::KilnConfig;
use crate::error::Result;
use crate::journal::JobJournal;
use crate::metrics::JsonlMetricsSink;
use crate::storage::LocalFsStorage;
use kiln_abstraction::{ModelMeta, StorageGateway};
use kiln_orchestrator::{
    DeviceStatus, Job, RecoveryReport, Scheduler, SchedulerStats, Subscription,
};
use kiln_training::{JobId, JobKind, ModelBackend};
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub struct Kiln {
    config: KilnConfig,
    scheduler: Scheduler,
    storage: Arc<LocalFsStorage>,
    journal: Option<Arc<JobJournal>>,
    metrics: Option<Arc<JsonlMetricsSink>>,
    recovery: RecoveryReport,
}

impl fmt::Debug for Kiln {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kiln")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

impl Kiln {
    /// Builds the service and recovers jobs from the journal, if one is configured.
    ///
    /// # Arguments
    /// * `config` - Validated before use
    /// * `backend` - Model engine shared by all runners
    pub async fn start(config: KilnConfig, backend: Arc<dyn ModelBackend>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(LocalFsStorage::new(&config.storage.root)?);
        let gateway: Arc<dyn StorageGateway> = storage.clone();
        let mut builder = Scheduler::builder(config.scheduler_config())
            .devices(config.device_pool())
            .backend(backend)
            .storage(gateway);

        let mut persisted = Vec::new();
        let journal = match &config.runtime.journal_dir {
            Some(dir) => {
                persisted = JobJournal::load_all(dir)?;
                let journal = Arc::new(JobJournal::open(dir)?);
                builder = builder.observer(journal.clone());
                Some(journal)
            }
            None => None,
        };
        let metrics = match &config.runtime.metrics_file {
            Some(path) => {
                let sink = Arc::new(JsonlMetricsSink::open(path)?);
                builder = builder.metrics_sink(sink.clone());
                Some(sink)
            }
            None => None,
        };

        let scheduler = builder.build()?;
        let recovery = if persisted.is_empty() {
            RecoveryReport::default()
        } else {
            scheduler.recover(persisted).await?
        };

        info!(
            devices = config.devices.len(),
            storage = %storage.root().display(),
            journal = journal.is_some(),
            metrics = metrics.is_some(),
            "Kiln started"
        );
        Ok(Self { config, scheduler, storage, journal, metrics, recovery })
    }

    #[must_use]
    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// What happened to persisted jobs at start-up.
    #[must_use]
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    pub async fn submit(
        &self,
        user_id: &str,
        kind: JobKind,
        params: serde_json::Value,
    ) -> Result<JobId> {
        Ok(self.scheduler.submit(user_id, kind, params).await?)
    }

    pub async fn stop(&self, user_id: &str, job_id: &JobId) -> bool {
        self.scheduler.stop(user_id, job_id).await
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Job> {
        Ok(self.scheduler.get_job(job_id)?)
    }

    pub fn list_jobs(&self, user_id: &str) -> Vec<Job> {
        self.scheduler.list_jobs(user_id)
    }

    pub fn list_all_jobs(&self) -> Vec<Job> {
        self.scheduler.list_all_jobs()
    }

    pub async fn subscribe(&self, job_id: &JobId) -> Result<Subscription> {
        Ok(self.scheduler.subscribe(job_id).await?)
    }

    /// Waits for a job to finish.
    pub async fn wait(&self, job_id: &JobId) -> Result<Job> {
        Ok(self.scheduler.wait(job_id).await?)
    }

    pub async fn list_devices(&self) -> Vec<DeviceStatus> {
        self.scheduler.list_devices().await
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.scheduler.stats().await
    }

    pub async fn list_models(&self, user_id: &str) -> Result<Vec<ModelMeta>> {
        Ok(self.storage.list_models(user_id).await?)
    }

    pub async fn delete_model(&self, user_id: &str, model_name: &str) -> Result<bool> {
        let deleted = self.storage.delete_model(user_id, model_name).await?;
        info!(user_id = %user_id, model = %model_name, deleted, "Delete model requested");
        Ok(deleted)
    }

    /// Shuts the scheduler down, then flushes the journal and metrics log.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        if let Some(journal) = &self.journal {
            journal.close().await;
        }
        if let Some(metrics) = &self.metrics {
            metrics.close().await;
        }
        info!("Kiln stopped");
    }
}
