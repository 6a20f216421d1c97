//! Job lifecycle events.
//!
//! These events are facts about the job lifecycle, not commands. The
//! notifier turns each one into an SSE frame; everything a client can see
//! about a run flows through here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::Job;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// A job row was accepted and persisted.
    Queued { job: Job },

    /// A dispatcher claimed the row and is about to run the handler.
    Started {
        job_id: Uuid,
        owner_user_id: Option<Uuid>,
        job_type: String,
        attempt: i32,
        worker_id: String,
    },

    /// The handler reported progress.
    Progress {
        job_id: Uuid,
        owner_user_id: Option<Uuid>,
        job_type: String,
        stage: String,
        progress: i32,
        message: Option<String>,
    },

    /// The handler paused the job until a resume time or signal.
    Waiting {
        job_id: Uuid,
        owner_user_id: Option<Uuid>,
        job_type: String,
        stage: String,
        wait_until: DateTime<Utc>,
    },

    /// A transient failure; the row was re-queued for another attempt.
    Retrying {
        job_id: Uuid,
        owner_user_id: Option<Uuid>,
        job_type: String,
        error: String,
        attempt: i32,
        next_attempt_at: DateTime<Utc>,
    },

    /// Terminal success.
    Done {
        job_id: Uuid,
        owner_user_id: Option<Uuid>,
        job_type: String,
        stage: String,
        result: Option<serde_json::Value>,
    },

    /// Terminal failure (retries exhausted or permanent error).
    Failed {
        job_id: Uuid,
        owner_user_id: Option<Uuid>,
        job_type: String,
        stage: String,
        error: String,
        attempts: i32,
    },

    /// The job was canceled; not a failure.
    Canceled {
        job_id: Uuid,
        owner_user_id: Option<Uuid>,
        job_type: String,
        reason: Option<String>,
    },
}

impl JobEvent {
    /// The SSE event kind for this lifecycle fact.
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Queued { .. } => "job.queued",
            JobEvent::Started { .. } => "job.started",
            JobEvent::Progress { .. } => "job.progress",
            JobEvent::Waiting { .. } => "job.waiting",
            JobEvent::Retrying { .. } => "job.retrying",
            JobEvent::Done { .. } => "job.done",
            JobEvent::Failed { .. } => "job.failed",
            JobEvent::Canceled { .. } => "job.canceled",
        }
    }

    /// The user whose stream should carry this event. System jobs have
    /// no owner and never reach the SSE fan-out.
    pub fn owner_user_id(&self) -> Option<Uuid> {
        match self {
            JobEvent::Queued { job } => job.owner_user_id,
            JobEvent::Started { owner_user_id, .. }
            | JobEvent::Progress { owner_user_id, .. }
            | JobEvent::Waiting { owner_user_id, .. }
            | JobEvent::Retrying { owner_user_id, .. }
            | JobEvent::Done { owner_user_id, .. }
            | JobEvent::Failed { owner_user_id, .. }
            | JobEvent::Canceled { owner_user_id, .. } => *owner_user_id,
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Queued { job } => job.id,
            JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Waiting { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Done { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Canceled { job_id, .. } => *job_id,
        }
    }

    /// The flat JSON payload carried on the wire.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            JobEvent::Queued { job } => serde_json::json!({
                "job_id": job.id,
                "job_type": job.job_type,
                "status": job.status,
                "scheduled_for": job.scheduled_for,
            }),
            JobEvent::Started {
                job_id,
                job_type,
                attempt,
                worker_id,
                ..
            } => serde_json::json!({
                "job_id": job_id,
                "job_type": job_type,
                "attempt": attempt,
                "worker_id": worker_id,
            }),
            JobEvent::Progress {
                job_id,
                job_type,
                stage,
                progress,
                message,
                ..
            } => serde_json::json!({
                "job_id": job_id,
                "job_type": job_type,
                "stage": stage,
                "progress": progress,
                "message": message,
            }),
            JobEvent::Waiting {
                job_id,
                job_type,
                stage,
                wait_until,
                ..
            } => serde_json::json!({
                "job_id": job_id,
                "job_type": job_type,
                "stage": stage,
                "wait_until": wait_until,
            }),
            JobEvent::Retrying {
                job_id,
                job_type,
                error,
                attempt,
                next_attempt_at,
                ..
            } => serde_json::json!({
                "job_id": job_id,
                "job_type": job_type,
                "error": error,
                "attempt": attempt,
                "next_attempt_at": next_attempt_at,
            }),
            JobEvent::Done {
                job_id,
                job_type,
                stage,
                result,
                ..
            } => serde_json::json!({
                "job_id": job_id,
                "job_type": job_type,
                "stage": stage,
                "result": result,
            }),
            JobEvent::Failed {
                job_id,
                job_type,
                stage,
                error,
                attempts,
                ..
            } => serde_json::json!({
                "job_id": job_id,
                "job_type": job_type,
                "stage": stage,
                "error": error,
                "attempts": attempts,
            }),
            JobEvent::Canceled {
                job_id,
                job_type,
                reason,
                ..
            } => serde_json::json!({
                "job_id": job_id,
                "job_type": job_type,
                "reason": reason,
            }),
        }
    }
}
