//! Job model for durable background execution.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::db_id;
use crate::kernel::jobs::record::Record;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    /// Paused by the handler until `wait_until` or an explicit resume.
    WaitingUser,
    /// Gated behind an unfinished parent job.
    WaitingParent,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses are absorbing: the row never transitions out.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Runnable statuses participate in the one-runnable-per-scope guard.
    pub fn is_runnable(&self) -> bool {
        !self.is_terminal()
    }

    /// Only these statuses may be picked up by a dispatcher claim.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::WaitingUser)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::WaitingUser => "waiting_user",
            JobStatus::WaitingParent => "waiting_parent",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
    /// Job was cancelled by user/system
    Canceled,
    /// Dispatcher-raised wall-clock timeout - retries like a transient error
    Timeout,
    /// Handler panicked - one retry, then permanent
    Panic,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self, attempts: i32) -> bool {
        match self {
            ErrorKind::Retryable | ErrorKind::Timeout => true,
            ErrorKind::Panic => attempts < 2,
            ErrorKind::NonRetryable | ErrorKind::Canceled => false,
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// Result key holding the resume time of a paused job.
pub const WAIT_UNTIL_KEY: &str = "wait_until";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = db_id())]
    pub id: Uuid,

    // Core identity
    #[builder(default, setter(strip_option))]
    pub owner_user_id: Option<Uuid>,
    pub job_type: String,

    // Business entity scope (one-runnable guard + cancel-by-entity)
    #[builder(default, setter(strip_option))]
    pub entity_kind: Option<String>,
    #[builder(default, setter(strip_option))]
    pub entity_id: Option<Uuid>,

    // Payload, immutable after enqueue
    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = String::new())]
    pub stage: String,
    #[builder(default = 0)]
    pub progress: i32,
    #[builder(default, setter(strip_option))]
    pub message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,

    // Retry accounting
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,

    // Scheduling + lease
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub locked_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    // DAG linkage
    #[builder(default, setter(strip_option))]
    pub parent_job_id: Option<Uuid>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// Column list shared by every full-row query.
pub(crate) const JOB_COLUMNS: &str = "id, owner_user_id, job_type, entity_kind, entity_id, payload, \
     status, stage, progress, message, result, error, attempts, max_attempts, \
     scheduled_for, locked_at, heartbeat_at, worker_id, parent_job_id, created_at, updated_at";

impl Job {
    /// Create an immediate one-off job (convenience constructor)
    pub fn immediate(owner_user_id: Uuid, job_type: &str) -> Self {
        Self::builder()
            .owner_user_id(owner_user_id)
            .job_type(job_type.to_string())
            .build()
    }

    /// Create a job scheduled for a future dispatch time.
    pub fn scheduled(owner_user_id: Uuid, job_type: &str, run_at: DateTime<Utc>) -> Self {
        Self::builder()
            .owner_user_id(owner_user_id)
            .job_type(job_type.to_string())
            .scheduled_for(run_at)
            .build()
    }

    /// Create the row for an enqueue request.
    ///
    /// This constructor is used by `JobApi` to persist accepted work.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueued(
        owner_user_id: Option<Uuid>,
        job_type: &str,
        entity_kind: Option<String>,
        entity_id: Option<Uuid>,
        payload: serde_json::Value,
        status: JobStatus,
        scheduled_for: Option<DateTime<Utc>>,
        parent_job_id: Option<Uuid>,
        max_attempts: i32,
    ) -> Self {
        Self {
            id: db_id(),
            owner_user_id,
            job_type: job_type.to_string(),
            entity_kind,
            entity_id,
            payload,
            status,
            stage: String::new(),
            progress: 0,
            message: None,
            result: None,
            error: None,
            attempts: 0,
            max_attempts,
            scheduled_for,
            locked_at: None,
            heartbeat_at: None,
            worker_id: None,
            parent_job_id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the row still counts against the one-runnable-per-scope guard.
    pub fn is_runnable(&self) -> bool {
        self.status.is_runnable()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Resume time of a paused job, read back out of `result`.
    pub fn wait_until(&self) -> Option<DateTime<Utc>> {
        let raw = self.result.as_ref()?.get(WAIT_UNTIL_KEY)?.as_str()?;
        raw.parse().ok()
    }

    /// Build the replacement row for a restart of this (terminal) job.
    ///
    /// Carries payload, type, scope and DAG linkage into a fresh queued row.
    pub fn restarted(&self, reset_attempts_cap: bool, default_max_attempts: i32) -> Self {
        Self {
            id: db_id(),
            owner_user_id: self.owner_user_id,
            job_type: self.job_type.clone(),
            entity_kind: self.entity_kind.clone(),
            entity_id: self.entity_id,
            payload: self.payload.clone(),
            status: JobStatus::Queued,
            stage: String::new(),
            progress: 0,
            message: None,
            result: None,
            error: None,
            attempts: 0,
            max_attempts: if reset_attempts_cap {
                default_max_attempts
            } else {
                self.max_attempts
            },
            scheduled_for: None,
            locked_at: None,
            heartbeat_at: None,
            worker_id: None,
            parent_job_id: self.parent_job_id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Jobs linked to a parent, oldest first.
    pub async fn find_by_parent(parent_job_id: Uuid, db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE parent_job_id = $1 ORDER BY created_at ASC"
        ))
        .bind(parent_job_id)
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }
}

#[async_trait::async_trait]
impl Record for Job {
    const TABLE: &'static str = "jobs";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO jobs (
                id, owner_user_id, job_type, entity_kind, entity_id, payload,
                status, stage, progress, message, result, error, attempts, max_attempts,
                scheduled_for, locked_at, heartbeat_at, worker_id, parent_job_id,
                created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19,
                $20, $21
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(self.owner_user_id)
        .bind(&self.job_type)
        .bind(&self.entity_kind)
        .bind(self.entity_id)
        .bind(&self.payload)
        .bind(self.status)
        .bind(&self.stage)
        .bind(self.progress)
        .bind(&self.message)
        .bind(&self.result)
        .bind(&self.error)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(self.scheduled_for)
        .bind(self.locked_at)
        .bind(self.heartbeat_at)
        .bind(&self.worker_id)
        .bind(self.parent_job_id)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(job)
    }
}
