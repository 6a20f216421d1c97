//! Server dependencies for the job runtime.
//!
//! `ServerDeps` is the explicit environment passed to the dispatcher, the
//! API surface and every handler: database pool, job store, stream hub,
//! bus and tuning config. It is constructed once at process start and
//! threaded by `Arc`; nothing in the runtime reaches for globals.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use crate::config::{JobsConfig, SseConfig};
use crate::kernel::bus::{LocalStreamBus, StreamBus};
use crate::kernel::jobs::{
    DagCoordinator, InMemoryJobStore, JobLifecycle, JobNotifier, JobStore, PostgresJobStore,
    RunningJobs,
};
use crate::kernel::stream_hub::StreamHub;

/// Dependency container threaded through the job runtime.
#[derive(Clone)]
pub struct ServerDeps {
    /// Present in production; absent when running on the in-memory store.
    db: Option<PgPool>,
    pub store: Arc<dyn JobStore>,
    pub hub: StreamHub,
    pub bus: Arc<dyn StreamBus>,
    pub notifier: JobNotifier,
    /// Cancellation tokens of jobs running on this replica.
    pub running: RunningJobs,
    pub jobs_config: JobsConfig,
    pub sse_config: SseConfig,
}

impl ServerDeps {
    pub fn new(
        db: Option<PgPool>,
        store: Arc<dyn JobStore>,
        hub: StreamHub,
        bus: Arc<dyn StreamBus>,
        jobs_config: JobsConfig,
        sse_config: SseConfig,
    ) -> Self {
        let notifier = JobNotifier::new(bus.clone());
        Self {
            db,
            store,
            hub,
            bus,
            notifier,
            running: RunningJobs::default(),
            jobs_config,
            sse_config,
        }
    }

    /// Production wiring over Postgres.
    pub fn postgres(
        pool: PgPool,
        hub: StreamHub,
        bus: Arc<dyn StreamBus>,
        jobs_config: JobsConfig,
        sse_config: SseConfig,
    ) -> Self {
        let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool.clone()));
        Self::new(Some(pool), store, hub, bus, jobs_config, sse_config)
    }

    /// In-memory wiring for tests and single-node development. The bus is
    /// a loopback into the hub, so SSE delivery behaves like production.
    pub fn in_memory(jobs_config: JobsConfig) -> Self {
        let hub = StreamHub::new();
        let bus: Arc<dyn StreamBus> = Arc::new(LocalStreamBus::new(hub.clone()));
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        Self::new(None, store, hub, bus, jobs_config, SseConfig::default())
    }

    /// The database pool. Errors when the process was wired without one.
    pub fn db(&self) -> Result<&PgPool> {
        self.db
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no database pool configured"))
    }

    pub fn dag(&self) -> DagCoordinator {
        DagCoordinator::new(self.store.clone(), self.notifier.clone())
    }

    pub fn lifecycle(&self) -> JobLifecycle {
        JobLifecycle::new(
            self.store.clone(),
            self.notifier.clone(),
            self.dag(),
            self.jobs_config.clone(),
        )
    }
}
