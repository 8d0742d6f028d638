//! Shared helpers for the orchestrator integration tests.
//!
//! Every harness runs the simulated backend behind an iteration gate: a
//! training job only advances when the test adds permits to [`Harness::gate`].

#![allow(dead_code)]

use kiln_abstraction::{InMemoryStorage, StorageGateway};
use kiln_orchestrator::{Job, JobState, Scheduler, SchedulerConfig, Subscription};
use kiln_training::{Device, DeviceKind, JobId, JobKind, Pacing, SimulatedBackend};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub struct Harness {
    pub scheduler: Scheduler,
    pub gate: Arc<Semaphore>,
    pub storage: Arc<InMemoryStorage>,
    pub base_model: PathBuf,
    pub dataset: PathBuf,
    pub work_dir: PathBuf,
    _temp: TempDir,
}

/// `n` CPU devices named `cpu0..`.
pub fn cpus(n: usize) -> Vec<Device> {
    (0..n).map(|i| Device::new(format!("cpu{i}"), DeviceKind::Cpu)).collect()
}

impl Harness {
    pub fn new(global_limit: usize, per_user_limit: usize, devices: Vec<Device>) -> Self {
        Self::with_backend(global_limit, per_user_limit, devices, |backend| backend)
    }

    pub fn with_backend(
        global_limit: usize,
        per_user_limit: usize,
        devices: Vec<Device>,
        customize: impl FnOnce(SimulatedBackend) -> SimulatedBackend,
    ) -> Self {
        let temp = TempDir::new().unwrap();
        let base_model = temp.path().join("yolov8n.pt");
        std::fs::write(&base_model, b"pretrained").unwrap();
        let dataset = temp.path().join("dataset");
        std::fs::create_dir_all(&dataset).unwrap();
        let work_dir = temp.path().join("work");

        let gate = Arc::new(Semaphore::new(0));
        let backend = customize(SimulatedBackend::new().with_pacing(Pacing::Gated(Arc::clone(&gate))));
        let storage = Arc::new(InMemoryStorage::new());
        let gateway: Arc<dyn StorageGateway> = storage.clone();

        let config = SchedulerConfig {
            global_limit,
            per_user_limit,
            work_dir: work_dir.clone(),
            ..Default::default()
        };
        let scheduler = Scheduler::builder(config)
            .devices(devices)
            .backend(Arc::new(backend))
            .storage(gateway)
            .build()
            .unwrap();

        Self { scheduler, gate, storage, base_model, dataset, work_dir, _temp: temp }
    }

    pub fn train_params(&self, model_name: &str, epochs: u64) -> Value {
        json!({
            "base_model": self.base_model,
            "dataset": self.dataset,
            "epochs": epochs,
            "model_name": model_name,
            "labels": ["car", "bus"],
        })
    }

    pub async fn submit_train(&self, user_id: &str, model_name: &str, epochs: u64) -> JobId {
        self.scheduler
            .submit(user_id, JobKind::Train, self.train_params(model_name, epochs))
            .await
            .unwrap()
    }

    /// Lets `n` more iterations complete across all gated runs.
    pub fn advance(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn state(&self, job_id: &JobId) -> JobState {
        self.scheduler.get_job(job_id).unwrap().state
    }

    /// Waits for the job to reach a terminal state.
    pub async fn finished(&self, job_id: &JobId) -> Job {
        tokio::time::timeout(Duration::from_secs(10), self.scheduler.wait(job_id))
            .await
            .expect("job did not finish in time")
            .unwrap()
    }
}

/// Receives until an event for `step` arrives.
pub async fn recv_until_step(subscription: &mut Subscription, step: u64) {
    let wait = async {
        while let Some(event) = subscription.recv().await {
            if event.step >= step {
                return;
            }
        }
        panic!("stream closed before step {step}");
    };
    tokio::time::timeout(Duration::from_secs(10), wait).await.expect("no progress in time");
}
