//! Durable job storage.
//!
//! The [`JobStore`] trait is the single seam between the job runtime and its
//! persistence. [`PostgresJobStore`] is the production implementation; the
//! in-memory implementation lives in [`super::memory`] and backs tests and
//! single-node development.
//!
//! Concurrency contract: `claim_one` must be safe under concurrent workers
//! (row locking with skip-locked semantics), and `transition` is a CAS on
//! status so every state change is linearizable per row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::job::{Job, JobStatus, JOB_COLUMNS};
use super::record::Record;

/// Name of the partial unique index enforcing one runnable row per scope.
const RUNNABLE_SCOPE_INDEX: &str = "jobs_runnable_scope_idx";

/// Errors surfaced by job storage.
///
/// Anything that is not one of the three contract violations is a `Storage`
/// problem the caller can only log or retry.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a runnable job already exists for this scope")]
    AlreadyRunnable,

    #[error("job not found")]
    NotFound,

    #[error("job status changed concurrently")]
    StaleStatus,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err
                .constraint()
                .is_some_and(|name| name == RUNNABLE_SCOPE_INDEX)
            {
                return StoreError::AlreadyRunnable;
            }
        }
        StoreError::Storage(err.into())
    }
}

/// Partial update applied together with a status transition.
///
/// `None` fields leave the column untouched. `progress` is applied through
/// `GREATEST` so it can never move backwards within a run.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub stage: Option<String>,
    pub progress: Option<i32>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Release the lease columns (`locked_at`, `heartbeat_at`, `worker_id`).
    pub clear_lease: bool,
}

impl JobPatch {
    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn progress(mut self, pct: i32) -> Self {
        self.progress = Some(pct);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn clear_lease(mut self) -> Self {
        self.clear_lease = true;
        self
    }
}

/// Filters for user-scoped job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Storage contract for job rows.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new row. Fails with [`StoreError::AlreadyRunnable`] when a
    /// runnable row with the same (owner, type, entity) scope exists.
    async fn create(&self, job: Job) -> Result<Job, StoreError>;

    /// Fetch a row by id.
    async fn get(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Atomically claim the earliest due claimable row of one of `types`,
    /// marking it running under this worker's lease. Claims count as
    /// attempts. Ordering: `scheduled_for ASC, created_at ASC`.
    async fn claim_one(
        &self,
        worker_id: &str,
        types: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Refresh the lease on a running row. No-op for any other status.
    async fn heartbeat(&self, id: Uuid) -> Result<(), StoreError>;

    /// CAS the row from `from` to `to`, applying `patch`. Fails with
    /// [`StoreError::StaleStatus`] when the current status is not `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, StoreError>;

    /// Rewind every running row whose heartbeat predates `deadline` back to
    /// `queued` (or to `failed` once its attempts budget is spent) and
    /// release the lease. Returns the rows after the rewind.
    async fn reap(&self, deadline: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Transition any non-terminal row to `canceled`. Returns the updated
    /// row, or `None` when the row was already terminal (idempotent).
    async fn cancel(&self, id: Uuid, reason: Option<&str>) -> Result<Option<Job>, StoreError>;

    /// Make a paused (`waiting_user`) row due immediately. The external
    /// resume signal. The row stays `waiting_user` until the next claim:
    /// the claim path exempts paused rows from the attempts cap, and a
    /// resumed row must keep that exemption or a job that paused on its
    /// last permitted attempt would strand in `queued`, unclaimable.
    async fn resume(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Find the runnable row for a (owner, type, entity) scope, if any.
    async fn find_runnable(
        &self,
        owner_user_id: Option<Uuid>,
        job_type: &str,
        entity_kind: Option<&str>,
        entity_id: Option<Uuid>,
    ) -> Result<Option<Job>, StoreError>;

    /// Runnable rows touching a business entity, across job types.
    async fn list_runnable_for_entity(
        &self,
        entity_kind: &str,
        entity_id: Uuid,
    ) -> Result<Vec<Job>, StoreError>;

    /// User-scoped listing, newest first.
    async fn list_for_user(&self, user_id: Uuid, filter: JobFilter)
        -> Result<Vec<Job>, StoreError>;

    /// Children of a DAG parent, oldest first.
    async fn list_children(&self, parent_job_id: Uuid) -> Result<Vec<Job>, StoreError>;
}

/// PostgreSQL-backed job store.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        job.insert(&self.pool).await.map_err(|e| {
            match e.downcast_ref::<sqlx::Error>() {
                Some(sqlx::Error::Database(db_err))
                    if db_err
                        .constraint()
                        .is_some_and(|name| name == RUNNABLE_SCOPE_INDEX) =>
                {
                    StoreError::AlreadyRunnable
                }
                _ => StoreError::Storage(e),
            }
        })
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        Job::find_by_id(id, &self.pool)
            .await
            .map_err(StoreError::Storage)?
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

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE (
                        (status = 'queued' AND attempts < max_attempts)
                        OR status = 'waiting_user'
                      )
                  AND (scheduled_for IS NULL OR scheduled_for <= $3)
                  AND job_type = ANY($2)
                ORDER BY scheduled_for ASC NULLS FIRST, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                attempts = attempts + 1,
                locked_at = $3,
                heartbeat_at = $3,
                worker_id = $1,
                scheduled_for = NULL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(types)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn heartbeat(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, StoreError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = $3,
                stage = COALESCE($4, stage),
                progress = GREATEST(progress, COALESCE($5, progress)),
                message = COALESCE($6, message),
                result = COALESCE($7, result),
                error = COALESCE($8, error),
                scheduled_for = COALESCE($9, scheduled_for),
                locked_at = CASE WHEN $10 THEN NULL ELSE locked_at END,
                heartbeat_at = CASE WHEN $10 THEN NULL ELSE heartbeat_at END,
                worker_id = CASE WHEN $10 THEN NULL ELSE worker_id END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(&patch.stage)
        .bind(patch.progress)
        .bind(&patch.message)
        .bind(&patch.result)
        .bind(&patch.error)
        .bind(patch.scheduled_for)
        .bind(patch.clear_lease)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            // CAS miss: distinguish a missing row from a concurrent change.
            None => match self.get(id).await {
                Ok(_) => Err(StoreError::StaleStatus),
                Err(StoreError::NotFound) => Err(StoreError::NotFound),
                Err(other) => Err(other),
            },
        }
    }

    async fn reap(&self, deadline: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH stale AS (
                SELECT id
                FROM jobs
                WHERE status = 'running' AND heartbeat_at < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = CASE
                    WHEN attempts >= max_attempts THEN 'failed'::job_status
                    ELSE 'queued'::job_status
                END,
                error = CASE
                    WHEN attempts >= max_attempts THEN 'lease expired with no attempts remaining'
                    ELSE error
                END,
                scheduled_for = NOW(),
                locked_at = NULL,
                heartbeat_at = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM stale)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(deadline)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn cancel(&self, id: Uuid, reason: Option<&str>) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'canceled',
                message = COALESCE($2, message),
                locked_at = NULL,
                heartbeat_at = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND status NOT IN ('succeeded', 'failed', 'canceled')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(Some(job)),
            // Nothing updated: terminal row is fine, missing row is not.
            None => match self.get(id).await {
                Ok(_) => Ok(None),
                Err(err) => Err(err),
            },
        }
    }

    async fn resume(&self, id: Uuid) -> Result<Job, StoreError> {
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
        // Mirrors the COALESCE expressions of the partial unique index so a
        // NULL scope column matches NULL, not everything.
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE COALESCE(owner_user_id, '00000000-0000-0000-0000-000000000000'::uuid)
                  = COALESCE($1, '00000000-0000-0000-0000-000000000000'::uuid)
              AND job_type = $2
              AND COALESCE(entity_kind, '') = COALESCE($3, '')
              AND COALESCE(entity_id, '00000000-0000-0000-0000-000000000000'::uuid)
                  = COALESCE($4, '00000000-0000-0000-0000-000000000000'::uuid)
              AND status IN ('queued', 'running', 'waiting_user', 'waiting_parent')
            LIMIT 1
            "#
        ))
        .bind(owner_user_id)
        .bind(job_type)
        .bind(entity_kind)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn list_runnable_for_entity(
        &self,
        entity_kind: &str,
        entity_id: Uuid,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE entity_kind = $1
              AND entity_id = $2
              AND status IN ('queued', 'running', 'waiting_user', 'waiting_parent')
            ORDER BY created_at ASC
            "#
        ))
        .bind(entity_kind)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        filter: JobFilter,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE owner_user_id = $1
              AND ($2::text IS NULL OR job_type = $2)
              AND ($3::job_status IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(user_id)
        .bind(&filter.job_type)
        .bind(filter.status)
        .bind(filter.limit.unwrap_or(50))
        .bind(filter.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn list_children(&self, parent_job_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let jobs = Job::find_by_parent(parent_job_id, &self.pool)
            .await
            .map_err(StoreError::Storage)?;
        Ok(jobs)
    }
}
