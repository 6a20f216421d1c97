//! Per-run facade handed to handlers.
//!
//! A `JobContext` belongs to exactly one running attempt and is only ever
//! driven from the task executing the handler, so progress/succeed/fail
//! are serialized by construction. Every mutation goes through the store's
//! status CAS; a CAS miss is how a handler discovers it lost the row to a
//! cancel or a reaped lease.

use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::api::JobApi;
use super::error::{classify_error, JobError};
use super::events::JobEvent;
use super::job::{Job, JobStatus, WAIT_UNTIL_KEY};
use super::lifecycle::JobLifecycle;
use super::registry::SharedJobRegistry;
use super::store::{JobPatch, JobStore, StoreError};
use crate::kernel::deps::ServerDeps;

#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    deps: Arc<ServerDeps>,
    registry: SharedJobRegistry,
    lifecycle: JobLifecycle,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        job: Job,
        deps: Arc<ServerDeps>,
        registry: SharedJobRegistry,
        cancel: CancellationToken,
    ) -> Self {
        let lifecycle = deps.lifecycle();
        Self {
            job: Arc::new(job),
            deps,
            registry,
            lifecycle,
            cancel,
        }
    }

    // ------------------------------------------------------------------
    // Snapshot accessors
    // ------------------------------------------------------------------

    /// The row as it looked when this attempt was claimed.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    pub fn owner_user_id(&self) -> Option<Uuid> {
        self.job.owner_user_id
    }

    /// 1-based attempt number of this run.
    pub fn attempt(&self) -> i32 {
        self.job.attempts
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.job.payload.clone())
            .map_err(|e| anyhow::anyhow!("failed to deserialize payload: {e}"))
    }

    // ------------------------------------------------------------------
    // Lifecycle calls
    // ------------------------------------------------------------------

    /// Persist a progress step and emit it to the owner's stream.
    ///
    /// Progress is clamped so it never decreases within a run. Returns the
    /// cancel sentinel when the row was canceled out from under the run;
    /// handlers propagate it with `?` to unwind promptly.
    pub async fn progress(&self, stage: &str, pct: i32, message: &str) -> Result<()> {
        let patch = JobPatch::default()
            .stage(stage)
            .progress(pct.clamp(0, 100))
            .message(message);

        match self
            .deps
            .store
            .transition(self.job.id, JobStatus::Running, JobStatus::Running, patch)
            .await
        {
            Ok(row) => {
                self.deps
                    .notifier
                    .notify(JobEvent::Progress {
                        job_id: row.id,
                        owner_user_id: row.owner_user_id,
                        job_type: row.job_type.clone(),
                        stage: row.stage.clone(),
                        progress: row.progress,
                        message: row.message.clone(),
                    })
                    .await;
                Ok(())
            }
            Err(StoreError::StaleStatus) => Err(self.lost_row().await),
            Err(e) => Err(e.into()),
        }
    }

    /// Park the run until `until` (or an external resume). The dispatcher
    /// releases the lease; a later claim resumes the job with a fresh
    /// attempt and the progress baseline intact.
    pub async fn pause(
        &self,
        stage: &str,
        message: &str,
        until: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let patch = JobPatch::default()
            .stage(stage)
            .message(message)
            .result(serde_json::json!({ WAIT_UNTIL_KEY: until.to_rfc3339() }))
            .scheduled_for(until)
            .clear_lease();

        match self
            .deps
            .store
            .transition(
                self.job.id,
                JobStatus::Running,
                JobStatus::WaitingUser,
                patch,
            )
            .await
        {
            Ok(row) => {
                self.deps
                    .notifier
                    .notify(JobEvent::Waiting {
                        job_id: row.id,
                        owner_user_id: row.owner_user_id,
                        job_type: row.job_type.clone(),
                        stage: row.stage.clone(),
                        wait_until: until,
                    })
                    .await;
                Ok(())
            }
            Err(StoreError::StaleStatus) => Err(self.lost_row().await),
            Err(e) => Err(e.into()),
        }
    }

    /// Terminal success. Clamps progress to 100 and stores the result.
    pub async fn succeed(&self, stage: &str, result: serde_json::Value) -> Result<()> {
        match self
            .lifecycle
            .finish_success(self.job.id, Some(stage.to_string()), Some(result))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::StaleStatus) => Err(self.lost_row().await),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a failed attempt. Retries with backoff while the error kind
    /// and attempts budget allow, otherwise fails the row terminally.
    pub async fn fail(&self, stage: &str, error: anyhow::Error) -> Result<()> {
        let kind = classify_error(&error);

        let row = self.deps.store.get(self.job.id).await?;
        if row.status != JobStatus::Running {
            return Err(self.lost_row().await);
        }

        self.lifecycle
            .finish_failure(&row, Some(stage.to_string()), error.to_string(), kind)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Token that fires when a cancel arrives for this run. Handlers
    /// should observe it at safe points.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves when the run has been canceled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------

    pub fn deps(&self) -> &Arc<ServerDeps> {
        &self.deps
    }

    /// Database handle for handler reads/writes not mediated by the
    /// context. Errors when the process runs on the in-memory store.
    pub fn db(&self) -> Result<&PgPool> {
        self.deps.db()
    }

    /// Job API scoped to the same environment, for handlers that spawn
    /// children or inspect other runs.
    pub fn api(&self) -> JobApi {
        JobApi::new(self.deps.clone(), self.registry.clone())
    }

    /// The row is no longer this run's to mutate. Translate into either
    /// the cancel sentinel (and fire the token) or a stale-run error.
    async fn lost_row(&self) -> anyhow::Error {
        match self.deps.store.get(self.job.id).await {
            Ok(row) if row.status == JobStatus::Canceled => {
                self.cancel.cancel();
                JobError::canceled()
            }
            Ok(row) => anyhow::anyhow!(
                "job {} is no longer running (status {})",
                self.job.id,
                row.status.as_str()
            ),
            Err(e) => e.into(),
        }
    }
}
