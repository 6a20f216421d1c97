//! Saga persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use super::model::{SagaAction, SagaRun, SagaStatus};

const RUN_COLUMNS: &str = "id, name, job_id, status, error, created_at, updated_at";
const ACTION_COLUMNS: &str = "id, saga_run_id, action_index, name, status, payload, \
     compensation_payload, output, error, needs_attention, created_at, updated_at";

/// Storage contract for saga runs and their action rows.
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn create_run(&self, run: SagaRun) -> Result<SagaRun>;

    async fn get_run(&self, id: Uuid) -> Result<SagaRun>;

    async fn set_run_status(
        &self,
        id: Uuid,
        status: SagaStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Insert an action row if none exists for (run, index); returns the
    /// stored row either way, so resume sees prior attempts.
    async fn record_action(&self, action: SagaAction) -> Result<SagaAction>;

    async fn update_action(&self, action: &SagaAction) -> Result<()>;

    /// All actions of a run, ordered by index.
    async fn list_actions(&self, saga_run_id: Uuid) -> Result<Vec<SagaAction>>;
}

/// PostgreSQL-backed saga store.
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn create_run(&self, run: SagaRun) -> Result<SagaRun> {
        let run = sqlx::query_as::<_, SagaRun>(&format!(
            r#"
            INSERT INTO saga_runs (id, name, job_id, status, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run.id)
        .bind(&run.name)
        .bind(run.job_id)
        .bind(run.status)
        .bind(&run.error)
        .bind(run.created_at)
        .bind(run.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<SagaRun> {
        let run = sqlx::query_as::<_, SagaRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM saga_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(run)
    }

    async fn set_run_status(
        &self,
        id: Uuid,
        status: SagaStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE saga_runs
            SET status = $2,
                error = COALESCE($3, error),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_action(&self, action: SagaAction) -> Result<SagaAction> {
        // The (saga_run_id, action_index) unique key makes this a no-op on
        // resume; the stored row wins.
        sqlx::query(
            r#"
            INSERT INTO saga_actions (
                id, saga_run_id, action_index, name, status, payload,
                compensation_payload, output, error, needs_attention, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (saga_run_id, action_index) DO NOTHING
            "#,
        )
        .bind(action.id)
        .bind(action.saga_run_id)
        .bind(action.action_index)
        .bind(&action.name)
        .bind(action.status)
        .bind(&action.payload)
        .bind(&action.compensation_payload)
        .bind(&action.output)
        .bind(&action.error)
        .bind(action.needs_attention)
        .bind(action.created_at)
        .bind(action.updated_at)
        .execute(&self.pool)
        .await?;

        let stored = sqlx::query_as::<_, SagaAction>(&format!(
            "SELECT {ACTION_COLUMNS} FROM saga_actions WHERE saga_run_id = $1 AND action_index = $2"
        ))
        .bind(action.saga_run_id)
        .bind(action.action_index)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn update_action(&self, action: &SagaAction) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE saga_actions
            SET status = $2,
                compensation_payload = $3,
                output = $4,
                error = $5,
                needs_attention = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(action.id)
        .bind(action.status)
        .bind(&action.compensation_payload)
        .bind(&action.output)
        .bind(&action.error)
        .bind(action.needs_attention)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_actions(&self, saga_run_id: Uuid) -> Result<Vec<SagaAction>> {
        let actions = sqlx::query_as::<_, SagaAction>(&format!(
            "SELECT {ACTION_COLUMNS} FROM saga_actions WHERE saga_run_id = $1 ORDER BY action_index ASC"
        ))
        .bind(saga_run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(actions)
    }
}

/// In-memory saga store for tests and single-node development.
#[derive(Default)]
pub struct InMemorySagaStore {
    runs: Mutex<HashMap<Uuid, SagaRun>>,
    actions: Mutex<HashMap<Uuid, SagaAction>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every run, unordered. Test helper.
    pub fn runs(&self) -> Vec<SagaRun> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create_run(&self, run: SagaRun) -> Result<SagaRun> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<SagaRun> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("saga run {id} not found"))
    }

    async fn set_run_status(
        &self,
        id: Uuid,
        status: SagaStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("saga run {id} not found"))?;
        run.status = status;
        if let Some(error) = error {
            run.error = Some(error.to_string());
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn record_action(&self, action: SagaAction) -> Result<SagaAction> {
        let mut actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = actions
            .values()
            .find(|a| a.saga_run_id == action.saga_run_id && a.action_index == action.action_index)
        {
            return Ok(existing.clone());
        }
        actions.insert(action.id, action.clone());
        Ok(action)
    }

    async fn update_action(&self, action: &SagaAction) -> Result<()> {
        let mut actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        let stored = actions
            .get_mut(&action.id)
            .ok_or_else(|| anyhow::anyhow!("saga action {} not found", action.id))?;
        *stored = action.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn list_actions(&self, saga_run_id: Uuid) -> Result<Vec<SagaAction>> {
        let actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<SagaAction> = actions
            .values()
            .filter(|a| a.saga_run_id == saga_run_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.action_index);
        Ok(rows)
    }
}
