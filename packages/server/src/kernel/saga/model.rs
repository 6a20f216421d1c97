//! Saga run and action rows.
//!
//! A `SagaRun` groups an ordered list of `SagaAction`s. Each action row is
//! persisted *before* its step executes and updated after, so the table is
//! the source of truth for crash recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::db_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "saga_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    #[default]
    Running,
    Succeeded,
    /// A step failed; executed actions are being rolled back.
    Compensating,
    Failed,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Succeeded | SagaStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "saga_action_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SagaActionStatus {
    #[default]
    Pending,
    Executed,
    Compensated,
    Failed,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct SagaRun {
    pub id: Uuid,
    pub name: String,
    /// The job run that owns this saga, when executed from a handler.
    pub job_id: Option<Uuid>,
    pub status: SagaStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRun {
    pub fn new(name: &str, job_id: Option<Uuid>) -> Self {
        Self {
            id: db_id(),
            name: name.to_string(),
            job_id,
            status: SagaStatus::Running,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct SagaAction {
    pub id: Uuid,
    pub saga_run_id: Uuid,
    pub action_index: i32,
    pub name: String,
    pub status: SagaActionStatus,
    /// Input handed to the step.
    pub payload: serde_json::Value,
    /// Input for the compensating action, captured when the step executes.
    pub compensation_payload: Option<serde_json::Value>,
    /// What the step produced.
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Set when a compensation failed and an operator must look.
    pub needs_attention: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaAction {
    pub fn pending(
        saga_run_id: Uuid,
        action_index: i32,
        name: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: db_id(),
            saga_run_id,
            action_index,
            name: name.to_string(),
            status: SagaActionStatus::Pending,
            payload,
            compensation_payload: None,
            output: None,
            error: None,
            needs_attention: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_starts_running() {
        let run = SagaRun::new("provision_course", None);
        assert_eq!(run.status, SagaStatus::Running);
        assert!(run.error.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(SagaStatus::Succeeded.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(!SagaStatus::Running.is_terminal());
    }

    #[test]
    fn pending_action_carries_payload() {
        let run_id = Uuid::new_v4();
        let action = SagaAction::pending(run_id, 0, "reserve", serde_json::json!({"seat": 1}));
        assert_eq!(action.status, SagaActionStatus::Pending);
        assert_eq!(action.payload["seat"], 1);
        assert!(!action.needs_attention);
    }
}
