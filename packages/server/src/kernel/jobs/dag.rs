//! Parent/child coordination between jobs.
//!
//! Children enqueued with a `parent_job_id` wait in `waiting_parent` until
//! the parent succeeds. A failed or canceled parent cascades cancellation
//! to its pending descendants; running children are left to finish on
//! their own. Fan-in stays in the parent handler (pause-and-poll over
//! [`DagCoordinator::collect_child_results`]), which keeps the coordinator
//! small and the semantics auditable.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::events::JobEvent;
use super::job::JobStatus;
use super::notifier::JobNotifier;
use super::store::{JobPatch, JobStore, StoreError};

/// How deep a parent chain may grow before enqueue refuses it outright.
const MAX_ANCESTRY_DEPTH: usize = 32;

#[derive(Clone)]
pub struct DagCoordinator {
    store: Arc<dyn JobStore>,
    notifier: JobNotifier,
}

impl DagCoordinator {
    pub fn new(store: Arc<dyn JobStore>, notifier: JobNotifier) -> Self {
        Self { store, notifier }
    }

    /// Flip the gated children of a succeeded parent to `queued`.
    pub async fn release_children(&self, parent_job_id: Uuid) -> Result<(), StoreError> {
        let children = self.store.list_children(parent_job_id).await?;

        for child in children {
            if child.status != JobStatus::WaitingParent {
                continue;
            }
            match self
                .store
                .transition(
                    child.id,
                    JobStatus::WaitingParent,
                    JobStatus::Queued,
                    JobPatch::default().scheduled_for(chrono::Utc::now()),
                )
                .await
            {
                Ok(released) => {
                    info!(job_id = %released.id, parent_job_id = %parent_job_id, "released gated child job");
                    self.notifier.notify(JobEvent::Queued { job: released }).await;
                }
                // Lost a race with cancel; nothing to release.
                Err(StoreError::StaleStatus) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Cancel every pending descendant of a failed or canceled parent.
    ///
    /// Only `waiting_parent` and `queued` rows cascade; a child already
    /// claimed by a worker finishes or times out on its own.
    pub async fn cascade_cancel(&self, parent_job_id: Uuid) -> Result<(), StoreError> {
        let mut frontier = vec![parent_job_id];

        while let Some(parent) = frontier.pop() {
            let children = self.store.list_children(parent).await?;

            for child in children {
                if !matches!(
                    child.status,
                    JobStatus::WaitingParent | JobStatus::Queued
                ) {
                    continue;
                }
                match self
                    .store
                    .transition(
                        child.id,
                        child.status,
                        JobStatus::Canceled,
                        JobPatch::default()
                            .message("parent job did not succeed")
                            .clear_lease(),
                    )
                    .await
                {
                    Ok(canceled) => {
                        info!(job_id = %canceled.id, parent_job_id = %parent, "cascade-canceled child job");
                        self.notifier
                            .notify(JobEvent::Canceled {
                                job_id: canceled.id,
                                owner_user_id: canceled.owner_user_id,
                                job_type: canceled.job_type.clone(),
                                reason: Some("parent job did not succeed".to_string()),
                            })
                            .await;
                        frontier.push(canceled.id);
                    }
                    Err(StoreError::StaleStatus) => {
                        warn!(job_id = %child.id, "child changed status during cascade cancel");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    /// Reject an enqueue whose parent chain already contains the same
    /// `(job_type, entity_id)`: that pairing always means a handler is
    /// recursively re-enqueueing its own work.
    pub async fn assert_no_ancestor_conflict(
        &self,
        parent_job_id: Uuid,
        job_type: &str,
        entity_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut cursor = Some(parent_job_id);
        let mut depth = 0usize;

        while let Some(id) = cursor {
            if depth >= MAX_ANCESTRY_DEPTH {
                return Err(StoreError::Storage(anyhow::anyhow!(
                    "job ancestry deeper than {MAX_ANCESTRY_DEPTH} levels"
                )));
            }
            let ancestor = self.store.get(id).await?;
            if ancestor.job_type == job_type && ancestor.entity_id == entity_id {
                return Err(StoreError::Storage(anyhow::anyhow!(
                    "ancestor job {} already runs {} for this entity",
                    ancestor.id,
                    job_type
                )));
            }
            cursor = ancestor.parent_job_id;
            depth += 1;
        }

        Ok(())
    }

    /// Child outcomes keyed by job id, for fan-in parents merging results.
    pub async fn collect_child_results(
        &self,
        parent_job_id: Uuid,
    ) -> Result<serde_json::Value, StoreError> {
        let children = self.store.list_children(parent_job_id).await?;
        let mut merged = serde_json::Map::new();

        for child in children {
            merged.insert(
                child.id.to_string(),
                serde_json::json!({
                    "job_type": child.job_type,
                    "status": child.status,
                    "result": child.result,
                }),
            );
        }

        Ok(serde_json::Value::Object(merged))
    }

    /// Whether every child of `parent_job_id` reached a terminal state.
    pub async fn children_settled(&self, parent_job_id: Uuid) -> Result<bool, StoreError> {
        let children = self.store.list_children(parent_job_id).await?;
        Ok(children.iter().all(|c| c.is_terminal()))
    }
}
