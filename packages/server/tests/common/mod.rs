//! Shared test harness.
//!
//! Wires the job runtime over the in-memory store and a recording bus
//! that loops frames into a real hub, so enqueue → dispatch → SSE behaves
//! like production without Postgres or NATS.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use server_core::config::{JobsConfig, SseConfig};
use server_core::kernel::bus::TestStreamBus;
use server_core::kernel::jobs::{
    InMemoryJobStore, Job, JobApi, JobRegistry, JobStatus, JobStore, JobWorker, Reaper,
    SharedJobRegistry,
};
use server_core::kernel::{ServerDeps, StreamHub};

/// Aggressive intervals so dispatcher tests settle in tens of
/// milliseconds instead of seconds.
pub fn fast_config() -> JobsConfig {
    JobsConfig {
        worker_pool_size: 4,
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(50),
        lease_timeout: Duration::from_secs(60),
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
        ..Default::default()
    }
}

pub struct Harness {
    pub deps: Arc<ServerDeps>,
    pub registry: SharedJobRegistry,
    pub bus: Arc<TestStreamBus>,
    pub hub: StreamHub,
    shutdown: CancellationToken,
}

impl Harness {
    pub fn new(config: JobsConfig, registry: JobRegistry) -> Self {
        let hub = StreamHub::new();
        let bus = Arc::new(TestStreamBus::with_hub(hub.clone()));
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let deps = Arc::new(ServerDeps::new(
            None,
            store,
            hub.clone(),
            bus.clone(),
            config,
            SseConfig::default(),
        ));

        Self {
            deps,
            registry: Arc::new(registry),
            bus,
            hub,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn api(&self) -> JobApi {
        JobApi::new(self.deps.clone(), self.registry.clone())
    }

    /// Spawn the dispatcher loop for this harness.
    pub fn start_worker(&self) {
        let worker = Arc::new(JobWorker::with_worker_id(
            self.deps.clone(),
            self.registry.clone(),
            "worker-test",
        ));
        worker.spawn(self.shutdown.clone());
    }

    /// Spawn the lease reaper for this harness.
    pub fn start_reaper(&self) {
        Reaper::new(self.deps.clone()).spawn(self.shutdown.clone());
    }

    /// Poll until the job reaches `status` or the timeout expires.
    pub async fn wait_for_status(&self, job_id: Uuid, status: JobStatus, timeout: Duration) -> Job {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self
                .deps
                .store
                .get(job_id)
                .await
                .expect("job should exist while waiting");
            if job.status == status {
                return job;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "job {job_id} never reached {status:?}; currently {:?} (stage '{}', error {:?})",
                    job.status, job.stage, job.error
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the job reaches any terminal status.
    pub async fn wait_terminal(&self, job_id: Uuid, timeout: Duration) -> Job {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self
                .deps
                .store
                .get(job_id)
                .await
                .expect("job should exist while waiting");
            if job.is_terminal() {
                return job;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "job {job_id} never settled; currently {:?} (stage '{}')",
                    job.status, job.stage
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the bus has recorded an event of `kind`.
    pub async fn wait_for_event(&self, kind: &str, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.bus.was_published(kind) {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "event '{kind}' was never published; saw {:?}",
                    self.bus
                        .published_messages()
                        .iter()
                        .map(|m| m.kind.clone())
                        .collect::<Vec<_>>()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
