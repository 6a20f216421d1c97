//! Saga execution engine.
//!
//! Runs an ordered list of steps, each paired with a compensating action.
//! Every action row is written before its step executes, so a crashed
//! worker resumes deterministically: executed steps are skipped, the first
//! non-terminal action re-runs with idempotent step logic, and a saga that
//! died mid-rollback finishes compensating.
//!
//! Compensation is best-effort and LIFO: a failing compensation is flagged
//! for operator attention and the walk continues; the saga still
//! terminates in `failed`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::model::{SagaAction, SagaActionStatus, SagaRun, SagaStatus};
use super::store::SagaStore;

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("saga step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("saga storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// What a successful step hands back: its output, plus the payload its
/// compensation will need if the saga later unwinds.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub output: serde_json::Value,
    pub compensation: serde_json::Value,
}

impl StepOutcome {
    pub fn new(output: serde_json::Value, compensation: serde_json::Value) -> Self {
        Self {
            output,
            compensation,
        }
    }
}

type RunFn =
    Box<dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<StepOutcome>> + Send>> + Send + Sync>;
type CompensateFn =
    Box<dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// One step of a saga: a forward action and its inverse.
pub struct SagaStep {
    name: String,
    payload: serde_json::Value,
    run: RunFn,
    compensate: CompensateFn,
}

impl SagaStep {
    pub fn new<R, RFut, C, CFut>(
        name: impl Into<String>,
        payload: serde_json::Value,
        run: R,
        compensate: C,
    ) -> Self
    where
        R: Fn(serde_json::Value) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<StepOutcome>> + Send + 'static,
        C: Fn(serde_json::Value) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            payload,
            run: Box::new(move |payload| Box::pin(run(payload))),
            compensate: Box::new(move |payload| Box::pin(compensate(payload))),
        }
    }
}

pub struct SagaEngine {
    store: Arc<dyn SagaStore>,
}

impl SagaEngine {
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self { store }
    }

    /// Start a fresh saga and drive it to a terminal state.
    pub async fn run(
        &self,
        name: &str,
        job_id: Option<Uuid>,
        steps: &[SagaStep],
    ) -> Result<SagaRun, SagaError> {
        let run = self.store.create_run(SagaRun::new(name, job_id)).await?;
        info!(saga_id = %run.id, name = %name, steps = steps.len(), "saga started");
        self.execute(run, steps).await
    }

    /// Resume a saga after a crash or lease loss. Executed steps are
    /// skipped; a saga that died while compensating finishes the rollback.
    pub async fn resume(
        &self,
        saga_run_id: Uuid,
        steps: &[SagaStep],
    ) -> Result<SagaRun, SagaError> {
        let run = self.store.get_run(saga_run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        info!(saga_id = %run.id, status = ?run.status, "resuming saga");

        if run.status == SagaStatus::Compensating {
            let error = run.error.clone().unwrap_or_else(|| "resumed rollback".to_string());
            return self.compensate_and_fail(run, steps, error).await;
        }

        self.execute(run, steps).await
    }

    async fn execute(&self, run: SagaRun, steps: &[SagaStep]) -> Result<SagaRun, SagaError> {
        let existing = self.store.list_actions(run.id).await?;

        for (index, step) in steps.iter().enumerate() {
            let prior = existing.iter().find(|a| a.action_index == index as i32);
            if let Some(action) = prior {
                if action.status == SagaActionStatus::Executed {
                    continue;
                }
            }

            // Persist the intent before doing the work; the row is what
            // recovery scans.
            let mut action = self
                .store
                .record_action(SagaAction::pending(
                    run.id,
                    index as i32,
                    &step.name,
                    step.payload.clone(),
                ))
                .await?;
            if action.status == SagaActionStatus::Executed {
                continue;
            }

            match (step.run)(action.payload.clone()).await {
                Ok(outcome) => {
                    action.status = SagaActionStatus::Executed;
                    action.output = Some(outcome.output);
                    action.compensation_payload = Some(outcome.compensation);
                    action.error = None;
                    self.store.update_action(&action).await?;
                }
                Err(step_err) => {
                    warn!(saga_id = %run.id, step = %step.name, error = %step_err, "saga step failed; rolling back");
                    action.status = SagaActionStatus::Failed;
                    action.error = Some(step_err.to_string());
                    self.store.update_action(&action).await?;

                    let error = format!("step '{}' failed: {step_err}", step.name);
                    self.store
                        .set_run_status(run.id, SagaStatus::Compensating, Some(&error))
                        .await?;

                    self.compensate_and_fail(run, steps, error.clone()).await?;
                    return Err(SagaError::StepFailed {
                        step: step.name.clone(),
                        source: step_err,
                    });
                }
            }
        }

        self.store
            .set_run_status(run.id, SagaStatus::Succeeded, None)
            .await?;
        let run = self.store.get_run(run.id).await?;
        info!(saga_id = %run.id, "saga succeeded");
        Ok(run)
    }

    /// Walk executed actions in descending index order, invoking each
    /// compensation with its stored payload, then mark the saga failed.
    async fn compensate_and_fail(
        &self,
        run: SagaRun,
        steps: &[SagaStep],
        error: String,
    ) -> Result<SagaRun, SagaError> {
        let mut actions = self.store.list_actions(run.id).await?;
        actions.sort_by_key(|a| std::cmp::Reverse(a.action_index));

        for mut action in actions {
            if action.status != SagaActionStatus::Executed {
                continue;
            }
            let Some(step) = steps.get(action.action_index as usize) else {
                warn!(saga_id = %run.id, action_index = action.action_index, "no step definition for executed action");
                continue;
            };

            let payload = action
                .compensation_payload
                .clone()
                .unwrap_or(serde_json::Value::Null);
            match (step.compensate)(payload).await {
                Ok(()) => {
                    action.status = SagaActionStatus::Compensated;
                    self.store.update_action(&action).await?;
                    info!(saga_id = %run.id, step = %step.name, "compensated saga step");
                }
                Err(comp_err) => {
                    // Best-effort: flag the row and keep unwinding.
                    error!(saga_id = %run.id, step = %step.name, error = %comp_err, "compensation failed; flagged for operator");
                    action.error = Some(format!("compensation failed: {comp_err}"));
                    action.needs_attention = true;
                    self.store.update_action(&action).await?;
                }
            }
        }

        self.store
            .set_run_status(run.id, SagaStatus::Failed, Some(&error))
            .await?;
        Ok(self.store.get_run(run.id).await?)
    }
}
