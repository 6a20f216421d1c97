//! In-memory job store.
//!
//! Implements the full [`JobStore`] contract against a mutex-guarded map.
//! Backs the test suites and single-node development; claim ordering, the
//! status CAS and the runnable-scope guard behave exactly like the Postgres
//! implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::job::{Job, JobStatus};
use super::store::{JobFilter, JobPatch, JobStore, StoreError};

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, unordered. Test helper.
    pub fn all(&self) -> Vec<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn scope_matches(
        job: &Job,
        owner_user_id: Option<Uuid>,
        job_type: &str,
        entity_kind: Option<&str>,
        entity_id: Option<Uuid>,
    ) -> bool {
        job.owner_user_id == owner_user_id
            && job.job_type == job_type
            && job.entity_kind.as_deref() == entity_kind
            && job.entity_id == entity_id
    }

    fn apply_patch(job: &mut Job, patch: &JobPatch) {
        if let Some(stage) = &patch.stage {
            job.stage = stage.clone();
        }
        if let Some(pct) = patch.progress {
            job.progress = job.progress.max(pct);
        }
        if let Some(message) = &patch.message {
            job.message = Some(message.clone());
        }
        if let Some(result) = &patch.result {
            job.result = Some(result.clone());
        }
        if let Some(error) = &patch.error {
            job.error = Some(error.clone());
        }
        if let Some(at) = patch.scheduled_for {
            job.scheduled_for = Some(at);
        }
        if patch.clear_lease {
            job.locked_at = None;
            job.heartbeat_at = None;
            job.worker_id = None;
        }
        job.updated_at = Utc::now();
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());

        let conflict = job.status.is_runnable()
            && jobs.values().any(|existing| {
                existing.is_runnable()
                    && Self::scope_matches(
                        existing,
                        job.owner_user_id,
                        &job.job_type,
                        job.entity_kind.as_deref(),
                        job.entity_id,
                    )
            });
        if conflict {
            return Err(StoreError::AlreadyRunnable);
        }

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn claim_one(
        &self,
        worker_id: &str,
        types: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        if types.is_empty() {
            return Ok(None);
        }

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());

        // Pause cycles are not failures: a waiting_user row stays
        // claimable even with its attempts budget spent.
        let next_id = jobs
            .values()
            .filter(|job| {
                job.status.is_claimable()
                    && job.scheduled_for.is_none_or(|at| at <= now)
                    && types.iter().any(|t| *t == job.job_type)
                    && (job.status == JobStatus::WaitingUser || job.attempts < job.max_attempts)
            })
            .min_by_key(|job| (job.scheduled_for, job.created_at))
            .map(|job| job.id);

        let Some(id) = next_id else { return Ok(None) };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.attempts += 1;
        job.locked_at = Some(now);
        job.heartbeat_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        job.scheduled_for = None;
        job.updated_at = Utc::now();

        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == JobStatus::Running {
                job.heartbeat_at = Some(Utc::now());
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;

        if job.status != from {
            return Err(StoreError::StaleStatus);
        }

        job.status = to;
        Self::apply_patch(job, &patch);
        Ok(job.clone())
    }

    async fn reap(&self, deadline: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut reaped = Vec::new();

        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Running
                && job.heartbeat_at.is_none_or(|at| at < deadline);
            if !stale {
                continue;
            }

            if job.attempts >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.error = Some("lease expired with no attempts remaining".to_string());
            } else {
                job.status = JobStatus::Queued;
            }
            job.scheduled_for = Some(Utc::now());
            job.locked_at = None;
            job.heartbeat_at = None;
            job.worker_id = None;
            job.updated_at = Utc::now();
            reaped.push(job.clone());
        }

        Ok(reaped)
    }

    async fn cancel(&self, id: Uuid, reason: Option<&str>) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;

        if job.is_terminal() {
            return Ok(None);
        }

        job.status = JobStatus::Canceled;
        if let Some(reason) = reason {
            job.message = Some(reason.to_string());
        }
        job.locked_at = None;
        job.heartbeat_at = None;
        job.worker_id = None;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn resume(&self, id: Uuid) -> Result<Job, StoreError> {
        // Stays waiting_user so the claim path's pause exemption from the
        // attempts cap keeps applying; only the due time changes.
        self.transition(
            id,
            JobStatus::WaitingUser,
            JobStatus::WaitingUser,
            JobPatch::default().scheduled_for(Utc::now()),
        )
        .await
    }

    async fn find_runnable(
        &self,
        owner_user_id: Option<Uuid>,
        job_type: &str,
        entity_kind: Option<&str>,
        entity_id: Option<Uuid>,
    ) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs
            .values()
            .find(|job| {
                job.is_runnable()
                    && Self::scope_matches(job, owner_user_id, job_type, entity_kind, entity_id)
            })
            .cloned())
    }

    async fn list_runnable_for_entity(
        &self,
        entity_kind: &str,
        entity_id: Uuid,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<Job> = jobs
            .values()
            .filter(|job| {
                job.is_runnable()
                    && job.entity_kind.as_deref() == Some(entity_kind)
                    && job.entity_id == Some(entity_id)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        filter: JobFilter,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<Job> = jobs
            .values()
            .filter(|job| job.owner_user_id == Some(user_id))
            .filter(|job| {
                filter
                    .job_type
                    .as_deref()
                    .is_none_or(|t| job.job_type == t)
            })
            .filter(|job| filter.status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();

        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(50).max(0) as usize;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_children(&self, parent_job_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<Job> = jobs
            .values()
            .filter(|job| job.parent_job_id == Some(parent_job_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryJobStore {
        InMemoryJobStore::new()
    }

    fn scoped_job(user: Uuid, entity: Uuid) -> Job {
        Job::builder()
            .owner_user_id(user)
            .job_type("demo".to_string())
            .entity_kind("doc".to_string())
            .entity_id(entity)
            .build()
    }

    #[tokio::test]
    async fn create_rejects_second_runnable_row_in_scope() {
        let store = store();
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        store.create(scoped_job(user, entity)).await.unwrap();
        let second = store.create(scoped_job(user, entity)).await;
        assert!(matches!(second, Err(StoreError::AlreadyRunnable)));
    }

    #[tokio::test]
    async fn create_allows_same_scope_after_terminal() {
        let store = store();
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let first = store.create(scoped_job(user, entity)).await.unwrap();
        store.cancel(first.id, None).await.unwrap();

        assert!(store.create(scoped_job(user, entity)).await.is_ok());
    }

    #[tokio::test]
    async fn claim_orders_by_schedule_then_creation() {
        let store = store();
        let user = Uuid::new_v4();
        let first = store.create(Job::immediate(user, "demo")).await.unwrap();
        let _second = store
            .create(
                Job::builder()
                    .owner_user_id(Uuid::new_v4())
                    .job_type("demo".to_string())
                    .build(),
            )
            .await
            .unwrap();

        let claimed = store
            .claim_one("w1", &["demo".to_string()], Utc::now())
            .await
            .unwrap()
            .expect("a job should be claimable");
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn future_scheduled_jobs_are_not_claimed() {
        let store = store();
        let user = Uuid::new_v4();
        store
            .create(Job::scheduled(
                user,
                "demo",
                Utc::now() + chrono::Duration::hours(1),
            ))
            .await
            .unwrap();

        let claimed = store
            .claim_one("w1", &["demo".to_string()], Utc::now())
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn transition_cas_rejects_wrong_from_status() {
        let store = store();
        let job = store
            .create(Job::immediate(Uuid::new_v4(), "demo"))
            .await
            .unwrap();

        let result = store
            .transition(
                job.id,
                JobStatus::Running,
                JobStatus::Succeeded,
                JobPatch::default(),
            )
            .await;
        assert!(matches!(result, Err(StoreError::StaleStatus)));
    }

    #[tokio::test]
    async fn progress_patch_never_moves_backwards() {
        let store = store();
        let job = store
            .create(Job::immediate(Uuid::new_v4(), "demo"))
            .await
            .unwrap();
        store
            .claim_one("w1", &["demo".to_string()], Utc::now())
            .await
            .unwrap();

        store
            .transition(
                job.id,
                JobStatus::Running,
                JobStatus::Running,
                JobPatch::default().progress(60),
            )
            .await
            .unwrap();
        let after = store
            .transition(
                job.id,
                JobStatus::Running,
                JobStatus::Running,
                JobPatch::default().progress(30),
            )
            .await
            .unwrap();

        assert_eq!(after.progress, 60);
    }

    #[tokio::test]
    async fn reap_rewinds_stale_rows_and_fails_exhausted_ones() {
        let store = store();
        let fresh = store
            .create(Job::immediate(Uuid::new_v4(), "demo"))
            .await
            .unwrap();
        let exhausted = store
            .create(
                Job::builder()
                    .owner_user_id(Uuid::new_v4())
                    .job_type("demo".to_string())
                    .max_attempts(1)
                    .build(),
            )
            .await
            .unwrap();

        // Claim both, then pretend both heartbeats went silent.
        store
            .claim_one("w1", &["demo".to_string()], Utc::now())
            .await
            .unwrap();
        store
            .claim_one("w1", &["demo".to_string()], Utc::now())
            .await
            .unwrap();

        let reaped = store
            .reap(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reaped.len(), 2);

        let fresh_after = store.get(fresh.id).await.unwrap();
        assert_eq!(fresh_after.status, JobStatus::Queued);
        assert!(fresh_after.worker_id.is_none());

        let exhausted_after = store.get(exhausted.id).await.unwrap();
        assert_eq!(exhausted_after.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let store = store();
        let job = store
            .create(Job::immediate(Uuid::new_v4(), "demo"))
            .await
            .unwrap();

        let first = store.cancel(job.id, Some("user asked")).await.unwrap();
        assert!(first.is_some());

        let second = store.cancel(job.id, Some("user asked")).await.unwrap();
        assert!(second.is_none());

        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn resume_makes_a_paused_job_immediately_claimable() {
        let store = store();
        let job = store
            .create(Job::immediate(Uuid::new_v4(), "demo"))
            .await
            .unwrap();
        store
            .claim_one("w1", &["demo".to_string()], Utc::now())
            .await
            .unwrap();
        store
            .transition(
                job.id,
                JobStatus::Running,
                JobStatus::WaitingUser,
                JobPatch::default()
                    .scheduled_for(Utc::now() + chrono::Duration::hours(2))
                    .clear_lease(),
            )
            .await
            .unwrap();

        // Resume only moves the due time; the requeue happens at claim.
        let resumed = store.resume(job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::WaitingUser);
        assert!(resumed.scheduled_for.unwrap() <= Utc::now());

        let claimed = store
            .claim_one("w1", &["demo".to_string()], Utc::now())
            .await
            .unwrap()
            .expect("resumed job should be claimable");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 2);
    }

    #[tokio::test]
    async fn resume_preserves_the_pause_exemption_for_a_spent_budget() {
        let store = store();
        let job = store
            .create(
                Job::builder()
                    .owner_user_id(Uuid::new_v4())
                    .job_type("demo".to_string())
                    .max_attempts(1)
                    .build(),
            )
            .await
            .unwrap();

        // The only permitted attempt pauses.
        store
            .claim_one("w1", &["demo".to_string()], Utc::now())
            .await
            .unwrap();
        store
            .transition(
                job.id,
                JobStatus::Running,
                JobStatus::WaitingUser,
                JobPatch::default()
                    .scheduled_for(Utc::now() + chrono::Duration::hours(2))
                    .clear_lease(),
            )
            .await
            .unwrap();

        store.resume(job.id).await.unwrap();

        // attempts == max_attempts, yet the resumed row must not strand.
        let claimed = store
            .claim_one("w1", &["demo".to_string()], Utc::now())
            .await
            .unwrap()
            .expect("paused rows stay claimable past the attempts cap");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.attempts, 2);
    }
}
