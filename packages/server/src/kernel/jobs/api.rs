//! Thin contract layer over the job store.
//!
//! Used by the HTTP edge and by handlers that spawn children. Enqueueing
//! is idempotent per (owner, type, entity) scope: a second enqueue inside
//! a runnable window returns the existing row with `created = false`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::events::JobEvent;
use super::job::{Job, JobStatus};
use super::lifecycle::JobLifecycle;
use super::registry::SharedJobRegistry;
use super::store::{JobFilter, JobPatch, JobStore, StoreError};
use crate::kernel::deps::ServerDeps;

#[derive(Debug, Error)]
pub enum JobApiError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job not found")]
    NotFound,

    #[error("job is not in a terminal state")]
    NotTerminal,

    #[error("a runnable job already exists for this scope")]
    Conflict,

    #[error(transparent)]
    Store(anyhow::Error),
}

impl From<StoreError> for JobApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => JobApiError::NotFound,
            StoreError::AlreadyRunnable => JobApiError::Conflict,
            StoreError::StaleStatus => {
                JobApiError::Store(anyhow::anyhow!("job status changed concurrently"))
            }
            StoreError::Storage(e) => JobApiError::Store(e),
        }
    }
}

/// Everything needed to enqueue one unit of work.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EnqueueRequest {
    #[builder(default, setter(strip_option))]
    pub owner_user_id: Option<Uuid>,
    pub job_type: String,
    #[builder(default, setter(strip_option))]
    pub entity_kind: Option<String>,
    #[builder(default, setter(strip_option))]
    pub entity_id: Option<Uuid>,
    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub parent_job_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub max_attempts: Option<i32>,
}

/// Result of an enqueue that distinguishes new rows from idempotency hits.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// The job was accepted and a new row created.
    Created(Job),
    /// A runnable row for this scope already existed; no row was created.
    Duplicate(Job),
}

impl EnqueueResult {
    /// The job row regardless of whether it was created or duplicate.
    pub fn job(&self) -> &Job {
        match self {
            EnqueueResult::Created(job) | EnqueueResult::Duplicate(job) => job,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job().id
    }

    /// Returns true if this enqueue created a new row.
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// The job contract layer: enqueue, cancel, resume, restart, read.
#[derive(Clone)]
pub struct JobApi {
    deps: Arc<ServerDeps>,
    registry: SharedJobRegistry,
    lifecycle: JobLifecycle,
}

impl JobApi {
    pub fn new(deps: Arc<ServerDeps>, registry: SharedJobRegistry) -> Self {
        let lifecycle = deps.lifecycle();
        Self {
            deps,
            registry,
            lifecycle,
        }
    }

    /// Enqueue a job, idempotently per (owner, type, entity) scope.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResult, JobApiError> {
        self.validate(&request)?;

        // A child starts gated unless its parent already succeeded.
        let initial_status = match request.parent_job_id {
            None => JobStatus::Queued,
            Some(parent_id) => {
                let parent = match self.deps.store.get(parent_id).await {
                    Ok(parent) => parent,
                    Err(StoreError::NotFound) => {
                        return Err(JobApiError::Validation(format!(
                            "parent job {parent_id} not found"
                        )))
                    }
                    Err(e) => return Err(e.into()),
                };
                match parent.status {
                    JobStatus::Succeeded => JobStatus::Queued,
                    JobStatus::Failed | JobStatus::Canceled => {
                        return Err(JobApiError::Validation(format!(
                            "parent job {parent_id} is {}",
                            parent.status.as_str()
                        )))
                    }
                    _ => JobStatus::WaitingParent,
                }
            }
        };

        if let Some(parent_id) = request.parent_job_id {
            self.lifecycle
                .dag()
                .assert_no_ancestor_conflict(parent_id, &request.job_type, request.entity_id)
                .await
                .map_err(|e| JobApiError::Validation(e.to_string()))?;
        }

        // Idempotency pre-check; the partial unique index backs it up
        // against races.
        if let Some(existing) = self
            .deps
            .store
            .find_runnable(
                request.owner_user_id,
                &request.job_type,
                request.entity_kind.as_deref(),
                request.entity_id,
            )
            .await?
        {
            return Ok(EnqueueResult::Duplicate(existing));
        }

        let job = Job::enqueued(
            request.owner_user_id,
            &request.job_type,
            request.entity_kind.clone(),
            request.entity_id,
            request.payload.clone(),
            initial_status,
            request.scheduled_for,
            request.parent_job_id,
            request
                .max_attempts
                .unwrap_or(self.deps.jobs_config.max_attempts_default),
        );

        match self.deps.store.create(job).await {
            Ok(created) => {
                self.deps
                    .notifier
                    .notify(JobEvent::Queued {
                        job: created.clone(),
                    })
                    .await;
                let created = self.settle_gate_race(created).await?;
                Ok(EnqueueResult::Created(created))
            }
            Err(StoreError::AlreadyRunnable) => {
                // Lost the insert race; surface the winner.
                let existing = self
                    .deps
                    .store
                    .find_runnable(
                        request.owner_user_id,
                        &request.job_type,
                        request.entity_kind.as_deref(),
                        request.entity_id,
                    )
                    .await?
                    .ok_or(JobApiError::Conflict)?;
                Ok(EnqueueResult::Duplicate(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel a job. Idempotent: a terminal row is returned unchanged.
    /// When the job is running on this replica, its cancel token is
    /// signaled directly; elsewhere the handler learns from the row CAS.
    pub async fn cancel(&self, job_id: Uuid, reason: Option<&str>) -> Result<Job, JobApiError> {
        let job = self.lifecycle.finish_cancel(job_id, reason).await?;
        self.deps.running.cancel(job_id);
        Ok(job)
    }

    /// Cancel every runnable job touching a business entity, across job
    /// types. Used when the entity itself is deleted or superseded.
    pub async fn cancel_for_entity(
        &self,
        entity_kind: &str,
        entity_id: Uuid,
        reason: Option<&str>,
    ) -> Result<Vec<Job>, JobApiError> {
        let runnable = self
            .deps
            .store
            .list_runnable_for_entity(entity_kind, entity_id)
            .await?;

        let mut canceled = Vec::with_capacity(runnable.len());
        for job in runnable {
            canceled.push(self.cancel(job.id, reason).await?);
        }
        Ok(canceled)
    }

    /// Make a paused job due for immediate re-claim. The row stays
    /// `waiting_user` until a dispatcher picks it up (paused rows are
    /// exempt from the attempts cap at claim time, and that must survive
    /// an explicit resume); the claim emits `job.started`.
    pub async fn resume(&self, job_id: Uuid) -> Result<Job, JobApiError> {
        Ok(self.deps.store.resume(job_id).await?)
    }

    /// Create a fresh run of a terminal job. The original row is left
    /// untouched; the new row carries payload, type, scope and the DAG
    /// linkage.
    pub async fn restart(&self, job_id: Uuid) -> Result<Job, JobApiError> {
        let original = self.deps.store.get(job_id).await?;
        if !original.is_terminal() {
            return Err(JobApiError::NotTerminal);
        }

        let fresh = original.restarted(
            self.deps.jobs_config.restart_resets_attempts,
            self.deps.jobs_config.max_attempts_default,
        );
        let created = self.deps.store.create(fresh).await?;

        self.deps
            .notifier
            .notify(JobEvent::Queued {
                job: created.clone(),
            })
            .await;
        Ok(created)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Job, JobApiError> {
        Ok(self.deps.store.get(job_id).await?)
    }

    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        filter: JobFilter,
    ) -> Result<Vec<Job>, JobApiError> {
        Ok(self.deps.store.list_for_user(user_id, filter).await?)
    }

    /// Children of a DAG parent, oldest first.
    pub async fn children(&self, parent_job_id: Uuid) -> Result<Vec<Job>, JobApiError> {
        Ok(self.deps.store.list_children(parent_job_id).await?)
    }

    /// A parent may settle between the status check and the child insert,
    /// after its release/cascade scan already ran. Re-check once the child
    /// row exists so it cannot strand in `waiting_parent`.
    async fn settle_gate_race(&self, child: Job) -> Result<Job, JobApiError> {
        if child.status != JobStatus::WaitingParent {
            return Ok(child);
        }
        let Some(parent_id) = child.parent_job_id else {
            return Ok(child);
        };

        let parent = self.deps.store.get(parent_id).await?;
        match parent.status {
            JobStatus::Succeeded => {
                match self
                    .deps
                    .store
                    .transition(
                        child.id,
                        JobStatus::WaitingParent,
                        JobStatus::Queued,
                        JobPatch::default().scheduled_for(Utc::now()),
                    )
                    .await
                {
                    Ok(released) => Ok(released),
                    // The release scan got there first.
                    Err(StoreError::StaleStatus) => Ok(self.deps.store.get(child.id).await?),
                    Err(e) => Err(e.into()),
                }
            }
            JobStatus::Failed | JobStatus::Canceled => {
                let canceled = self
                    .lifecycle
                    .finish_cancel(child.id, Some("parent job did not succeed"))
                    .await?;
                Ok(canceled)
            }
            _ => Ok(child),
        }
    }

    fn validate(&self, request: &EnqueueRequest) -> Result<(), JobApiError> {
        if request.job_type.trim().is_empty() {
            return Err(JobApiError::Validation("job_type must not be empty".into()));
        }
        if !self.registry.is_registered(&request.job_type) {
            return Err(JobApiError::Validation(format!(
                "no handler registered for job type '{}'",
                request.job_type
            )));
        }
        if !(request.payload.is_object() || request.payload.is_null()) {
            return Err(JobApiError::Validation(
                "payload must be a JSON object".into(),
            ));
        }
        if request.entity_id.is_some() && request.entity_kind.is_none() {
            return Err(JobApiError::Validation(
                "entity_id requires entity_kind".into(),
            ));
        }
        if let Some(cap) = request.max_attempts {
            if cap < 1 {
                return Err(JobApiError::Validation("max_attempts must be >= 1".into()));
            }
        }
        Ok(())
    }
}
