//! Terminal transitions for job runs.
//!
//! Success, retry and terminal failure all funnel through here so the
//! dispatcher, the job context, the API and the reaper behave identically:
//! one CAS on the row, one lifecycle event, and the DAG hooks for
//! releasing or cascade-canceling children.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::backoff::backoff;
use super::dag::DagCoordinator;
use super::events::JobEvent;
use super::job::{ErrorKind, Job, JobStatus};
use super::notifier::JobNotifier;
use super::store::{JobPatch, JobStore, StoreError};
use crate::config::JobsConfig;

#[derive(Clone)]
pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
    notifier: JobNotifier,
    dag: DagCoordinator,
    config: JobsConfig,
}

impl JobLifecycle {
    pub fn new(
        store: Arc<dyn JobStore>,
        notifier: JobNotifier,
        dag: DagCoordinator,
        config: JobsConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            dag,
            config,
        }
    }

    pub fn dag(&self) -> &DagCoordinator {
        &self.dag
    }

    /// Transition a running row to `succeeded`, emit the terminal event
    /// and release any gated children.
    pub async fn finish_success(
        &self,
        job_id: Uuid,
        stage: Option<String>,
        result: Option<serde_json::Value>,
    ) -> Result<Job, StoreError> {
        let mut patch = JobPatch::default().progress(100).clear_lease();
        patch.stage = stage;
        patch.result = result;

        let job = self
            .store
            .transition(job_id, JobStatus::Running, JobStatus::Succeeded, patch)
            .await?;

        info!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "job succeeded");
        self.notifier
            .notify(JobEvent::Done {
                job_id: job.id,
                owner_user_id: job.owner_user_id,
                job_type: job.job_type.clone(),
                stage: job.stage.clone(),
                result: job.result.clone(),
            })
            .await;

        if let Err(e) = self.dag.release_children(job.id).await {
            warn!(job_id = %job.id, error = %e, "failed to release child jobs");
        }

        Ok(job)
    }

    /// Handle a failed attempt on a running row: re-queue with backoff
    /// while the attempts budget and the error kind allow it, otherwise
    /// fail terminally and cascade-cancel pending children.
    pub async fn finish_failure(
        &self,
        job: &Job,
        stage: Option<String>,
        error: String,
        kind: ErrorKind,
    ) -> Result<Job, StoreError> {
        let will_retry = kind.should_retry(job.attempts) && job.attempts < job.max_attempts;

        if will_retry {
            let delay = backoff(job.attempts, self.config.backoff_base, self.config.backoff_cap);
            let next_attempt_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            let mut patch = JobPatch::default()
                .error(error.clone())
                .scheduled_for(next_attempt_at)
                .clear_lease();
            patch.stage = stage;

            let job = self
                .store
                .transition(job.id, JobStatus::Running, JobStatus::Queued, patch)
                .await?;

            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                next_attempt_at = %next_attempt_at,
                error = %error,
                "job attempt failed; retrying"
            );
            self.notifier
                .notify(JobEvent::Retrying {
                    job_id: job.id,
                    owner_user_id: job.owner_user_id,
                    job_type: job.job_type.clone(),
                    error,
                    attempt: job.attempts,
                    next_attempt_at,
                })
                .await;

            return Ok(job);
        }

        let mut patch = JobPatch::default().error(error.clone()).clear_lease();
        patch.stage = stage;

        let job = self
            .store
            .transition(job.id, JobStatus::Running, JobStatus::Failed, patch)
            .await?;

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            error = %error,
            "job failed terminally"
        );
        self.notifier
            .notify(JobEvent::Failed {
                job_id: job.id,
                owner_user_id: job.owner_user_id,
                job_type: job.job_type.clone(),
                stage: job.stage.clone(),
                error,
                attempts: job.attempts,
            })
            .await;

        if let Err(e) = self.dag.cascade_cancel(job.id).await {
            warn!(job_id = %job.id, error = %e, "failed to cascade-cancel child jobs");
        }

        Ok(job)
    }

    /// Mark a row canceled (any non-terminal status), emit the event and
    /// cascade to pending children. Idempotent: an already-terminal row is
    /// returned untouched.
    pub async fn finish_cancel(
        &self,
        job_id: Uuid,
        reason: Option<&str>,
    ) -> Result<Job, StoreError> {
        match self.store.cancel(job_id, reason).await? {
            Some(job) => {
                info!(job_id = %job.id, job_type = %job.job_type, "job canceled");
                self.notifier
                    .notify(JobEvent::Canceled {
                        job_id: job.id,
                        owner_user_id: job.owner_user_id,
                        job_type: job.job_type.clone(),
                        reason: reason.map(str::to_string),
                    })
                    .await;

                if let Err(e) = self.dag.cascade_cancel(job.id).await {
                    warn!(job_id = %job.id, error = %e, "failed to cascade-cancel child jobs");
                }

                Ok(job)
            }
            None => self.store.get(job_id).await,
        }
    }
}
