//! Job dispatcher.
//!
//! The `JobWorker` is the long-running service on each worker replica:
//! - claims due jobs from the store under a lease, one at a time
//! - enforces the replica-wide pool cap and per-type concurrency caps
//! - runs handlers inside a panic/timeout shell with a heartbeat ticker
//! - closes runs the handler left open (implicit success) and applies the
//!   retry-or-fail decision for handler errors
//!
//! # Architecture
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► ClaimOne (skip-locked, scheduled_for ≤ now)
//!     ├─► heartbeat ticker (lease renewal)
//!     ├─► Handler.run(JobContext)
//!     └─► finish: succeed / retry with backoff / fail / cancel
//!
//! Reaper
//!     └─► rewinds running rows whose heartbeat went silent
//! ```
//!
//! Cancellation is cooperative: the API flips the row and signals the
//! per-job token when the job runs on this replica; handlers observe the
//! token (or the CAS miss on their next progress call) and unwind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::JobContext;
use super::error::classify_error;
use super::events::JobEvent;
use super::job::{ErrorKind, Job, JobStatus};
use super::lifecycle::JobLifecycle;
use super::registry::SharedJobRegistry;
use super::store::{JobPatch, JobStore};
use crate::kernel::deps::ServerDeps;

/// How long a shutting-down worker waits for in-flight jobs before
/// signaling their cancel tokens, and then how long after that.
const DRAIN_GRACE: Duration = Duration::from_secs(30);
const DRAIN_AFTER_CANCEL: Duration = Duration::from_secs(5);

/// Cancellation tokens of the jobs currently running on this replica.
///
/// Shared between the dispatcher (which registers each run) and the API
/// (which signals a token directly when a cancel lands on the replica
/// executing the job).
#[derive(Clone, Default)]
pub struct RunningJobs {
    inner: Arc<std::sync::RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl RunningJobs {
    pub fn insert(&self, job_id: Uuid, token: CancellationToken) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, token);
    }

    pub fn remove(&self, job_id: Uuid) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }

    /// Signal the cancel token of a job running here. Returns whether the
    /// job was found on this replica.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let tokens = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match tokens.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let tokens = self.inner.read().unwrap_or_else(|e| e.into_inner());
        for token in tokens.values() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A worker service that drives queued jobs to a terminal state.
pub struct JobWorker {
    deps: Arc<ServerDeps>,
    registry: SharedJobRegistry,
    lifecycle: JobLifecycle,
    worker_id: String,
    pool: Arc<Semaphore>,
    type_permits: HashMap<String, Arc<Semaphore>>,
}

impl JobWorker {
    pub fn new(deps: Arc<ServerDeps>, registry: SharedJobRegistry) -> Self {
        Self::with_worker_id(deps, registry, format!("worker-{}", Uuid::new_v4()))
    }

    pub fn with_worker_id(
        deps: Arc<ServerDeps>,
        registry: SharedJobRegistry,
        worker_id: impl Into<String>,
    ) -> Self {
        let config = &deps.jobs_config;
        let pool = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        let type_permits = config
            .type_concurrency
            .iter()
            .map(|(job_type, cap)| {
                (job_type.clone(), Arc::new(Semaphore::new((*cap).max(1))))
            })
            .collect();

        let lifecycle = deps.lifecycle();
        Self {
            deps,
            registry,
            lifecycle,
            worker_id: worker_id.into(),
            pool,
            type_permits,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Spawn the claim loop as a background task.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Run the claim loop until shutdown, then drain in-flight jobs.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker_id = %self.worker_id,
            pool_size = self.deps.jobs_config.worker_pool_size,
            "job worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Hold an in-flight slot before claiming, so a full pool blocks
            // here instead of leaving a claimed row unattended.
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let allowed = self.claimable_types();
            if allowed.is_empty() {
                drop(permit);
                self.idle_sleep(&shutdown).await;
                continue;
            }

            match self
                .deps
                .store
                .claim_one(&self.worker_id, &allowed, Utc::now())
                .await
            {
                Ok(Some(job)) => {
                    debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "claimed job");

                    let type_permit = match self.acquire_type_permit(&job).await {
                        Ok(permit) => permit,
                        Err(()) => {
                            drop(permit);
                            continue;
                        }
                    };

                    let worker = self.clone();
                    let job_cancel = shutdown.child_token();
                    let job_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        worker.process_job(job, job_cancel, job_shutdown).await;
                        drop(type_permit);
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.idle_sleep(&shutdown).await;
                }
                Err(e) => {
                    error!(error = %e, "failed to claim a job");
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        self.drain().await;
        info!(worker_id = %self.worker_id, "job worker stopped");
    }

    /// Registered types whose per-type cap is not currently saturated.
    fn claimable_types(&self) -> Vec<String> {
        self.registry
            .registered_types()
            .into_iter()
            .filter(|job_type| {
                self.type_permits
                    .get(job_type)
                    .is_none_or(|sem| sem.available_permits() > 0)
            })
            .collect()
    }

    /// The claim loop is serial, so a cap that looked open a moment ago
    /// still is; the fallback hands the row back rather than over-running
    /// the cap.
    async fn acquire_type_permit(
        &self,
        job: &Job,
    ) -> Result<Option<tokio::sync::OwnedSemaphorePermit>, ()> {
        let Some(sem) = self.type_permits.get(&job.job_type) else {
            return Ok(None);
        };

        match sem.clone().try_acquire_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => {
                warn!(job_id = %job.id, job_type = %job.job_type, "type cap saturated after claim; requeueing");
                let patch = JobPatch::default()
                    .scheduled_for(Utc::now())
                    .clear_lease();
                if let Err(e) = self
                    .deps
                    .store
                    .transition(job.id, JobStatus::Running, JobStatus::Queued, patch)
                    .await
                {
                    error!(job_id = %job.id, error = %e, "failed to requeue job past type cap");
                }
                Err(())
            }
        }
    }

    async fn idle_sleep(&self, shutdown: &CancellationToken) {
        let base = self.deps.jobs_config.poll_interval;
        let jittered = base.mul_f64(0.5 + fastrand::f64());
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(jittered) => {}
        }
    }

    /// Drive one claimed job to completion.
    async fn process_job(
        &self,
        job: Job,
        cancel: CancellationToken,
        shutdown: CancellationToken,
    ) {
        let job_id = job.id;

        self.deps.running.insert(job_id, cancel.clone());
        self.deps
            .notifier
            .notify(JobEvent::Started {
                job_id,
                owner_user_id: job.owner_user_id,
                job_type: job.job_type.clone(),
                attempt: job.attempts,
                worker_id: self.worker_id.clone(),
            })
            .await;

        // Heartbeat ticker renews the lease while the handler runs.
        let heartbeat_stop = CancellationToken::new();
        let heartbeat_handle = {
            let store = self.deps.store.clone();
            let stop = heartbeat_stop.clone();
            let interval = self.deps.jobs_config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // Skip first immediate tick

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = store.heartbeat(job_id).await {
                                warn!(job_id = %job_id, error = %e, "heartbeat failed");
                            }
                        }
                    }
                }
            })
        };

        self.execute(job, cancel, shutdown).await;

        heartbeat_stop.cancel();
        let _ = heartbeat_handle.await;
        self.deps.running.remove(job_id);
    }

    /// Run the handler inside the panic/timeout shell and settle the row.
    async fn execute(&self, job: Job, cancel: CancellationToken, shutdown: CancellationToken) {
        let job_id = job.id;
        let job_type = job.job_type.clone();

        let Some(handler) = self.registry.get(&job_type) else {
            error!(job_id = %job_id, job_type = %job_type, "no handler registered");
            self.fail_if_running(
                &job,
                Some("dispatch"),
                format!("no handler registered for job type '{job_type}'"),
                ErrorKind::NonRetryable,
            )
            .await;
            return;
        };

        let ctx = JobContext::new(
            job.clone(),
            self.deps.clone(),
            self.registry.clone(),
            cancel.clone(),
        );

        // An inner spawn isolates handler panics as JoinErrors.
        let run_handle = tokio::spawn(async move { handler.run(ctx).await });
        let abort_handle = run_handle.abort_handle();

        let outcome =
            tokio::time::timeout(self.deps.jobs_config.job_max_runtime, run_handle).await;

        match outcome {
            Err(_) => {
                abort_handle.abort();
                warn!(job_id = %job_id, job_type = %job_type, "handler exceeded max runtime");
                self.fail_if_running(
                    &job,
                    Some("timeout"),
                    format!(
                        "exceeded max runtime of {:?}",
                        self.deps.jobs_config.job_max_runtime
                    ),
                    ErrorKind::Timeout,
                )
                .await;
            }
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(job_id = %job_id, job_type = %job_type, "handler panicked");
                self.fail_if_running(
                    &job,
                    Some("panic"),
                    format!("handler panicked: {join_err}"),
                    ErrorKind::Panic,
                )
                .await;
            }
            Ok(Err(join_err)) => {
                warn!(job_id = %job_id, error = %join_err, "handler task aborted");
                self.fail_if_running(
                    &job,
                    None,
                    "handler task aborted".to_string(),
                    ErrorKind::Retryable,
                )
                .await;
            }
            Ok(Ok(handler_result)) => {
                self.settle(&job, handler_result, &shutdown).await;
            }
        }
    }

    /// Inspect the post-run row and close out whatever the handler left.
    async fn settle(
        &self,
        job: &Job,
        handler_result: anyhow::Result<()>,
        shutdown: &CancellationToken,
    ) {
        let row = match self.deps.store.get(job.id).await {
            Ok(row) => row,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to read job after run");
                return;
            }
        };

        match handler_result {
            Ok(()) => {
                if row.status == JobStatus::Running {
                    // Handler returned without a terminal call; close the
                    // run so the row cannot leak in `running` forever.
                    debug!(job_id = %job.id, "handler returned without terminal call; recording success");
                    let stage = if row.stage.is_empty() {
                        Some("done".to_string())
                    } else {
                        None
                    };
                    if let Err(e) = self
                        .lifecycle
                        .finish_success(job.id, stage, row.result.clone())
                        .await
                    {
                        error!(job_id = %job.id, error = %e, "failed to mark job as succeeded");
                    }
                }
            }
            Err(handler_err) => {
                let kind = classify_error(&handler_err);

                if kind == ErrorKind::Canceled {
                    if row.status != JobStatus::Running {
                        // The cancel API settled the row already.
                        return;
                    }
                    if shutdown.is_cancelled() {
                        // Interrupted by graceful shutdown, not by a user:
                        // hand the row back for another worker.
                        self.fail_if_running(
                            &row,
                            None,
                            "interrupted by worker shutdown".to_string(),
                            ErrorKind::Retryable,
                        )
                        .await;
                    } else if let Err(e) = self.lifecycle.finish_cancel(job.id, None).await {
                        error!(job_id = %job.id, error = %e, "failed to mark job as canceled");
                    }
                    return;
                }

                if row.status == JobStatus::Running {
                    self.fail_if_running(&row, None, handler_err.to_string(), kind)
                        .await;
                } else {
                    debug!(
                        job_id = %job.id,
                        status = row.status.as_str(),
                        error = %handler_err,
                        "handler returned an error after settling the row itself"
                    );
                }
            }
        }
    }

    async fn fail_if_running(
        &self,
        job: &Job,
        stage: Option<&str>,
        error_msg: String,
        kind: ErrorKind,
    ) {
        let row = match self.deps.store.get(job.id).await {
            Ok(row) => row,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to read job before failing it");
                return;
            }
        };
        if row.status != JobStatus::Running {
            return;
        }

        if let Err(e) = self
            .lifecycle
            .finish_failure(&row, stage.map(str::to_string), error_msg, kind)
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to mark job as failed");
        }
    }

    /// Wait for in-flight jobs, then cancel the stragglers and wait a
    /// little longer. Anything still running loses its lease to the
    /// reaper later.
    async fn drain(&self) {
        if self.deps.running.is_empty() {
            return;
        }

        info!(count = self.deps.running.len(), "waiting for running jobs to complete");
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        while !self.deps.running.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if !self.deps.running.is_empty() {
            warn!(count = self.deps.running.len(), "canceling jobs still running at shutdown");
            self.deps.running.cancel_all();
            let deadline = tokio::time::Instant::now() + DRAIN_AFTER_CANCEL;
            while !self.deps.running.is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Background task that reclaims leases of silent workers.
pub struct Reaper {
    deps: Arc<ServerDeps>,
    lifecycle: JobLifecycle,
}

impl Reaper {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        let lifecycle = deps.lifecycle();
        Self { deps, lifecycle }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let lease = self.deps.jobs_config.lease_timeout;
        let period = (lease / 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        info!(lease_secs = lease.as_secs(), "job reaper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let deadline = Utc::now()
                - chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));

            match self.deps.store.reap(deadline).await {
                Ok(reaped) => {
                    for job in reaped {
                        warn!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempts = job.attempts,
                            status = job.status.as_str(),
                            "reaped stale job lease"
                        );
                        match job.status {
                            JobStatus::Queued => {
                                self.deps
                                    .notifier
                                    .notify(JobEvent::Retrying {
                                        job_id: job.id,
                                        owner_user_id: job.owner_user_id,
                                        job_type: job.job_type.clone(),
                                        error: "worker lease expired".to_string(),
                                        attempt: job.attempts,
                                        next_attempt_at: Utc::now(),
                                    })
                                    .await;
                            }
                            JobStatus::Failed => {
                                self.deps
                                    .notifier
                                    .notify(JobEvent::Failed {
                                        job_id: job.id,
                                        owner_user_id: job.owner_user_id,
                                        job_type: job.job_type.clone(),
                                        stage: job.stage.clone(),
                                        error: job
                                            .error
                                            .clone()
                                            .unwrap_or_else(|| "worker lease expired".to_string()),
                                        attempts: job.attempts,
                                    })
                                    .await;
                                if let Err(e) = self.lifecycle.dag().cascade_cancel(job.id).await {
                                    warn!(job_id = %job.id, error = %e, "failed to cascade-cancel after reap");
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "reap pass failed");
                }
            }
        }

        info!("job reaper stopped");
    }
}
