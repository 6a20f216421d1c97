//! Parent/child semantics: gating, release on success, cascade cancel,
//! ancestor cycle rejection and fan-out from inside a handler.

mod common;

use std::time::Duration;

use uuid::Uuid;

use common::{fast_config, Harness};
use server_core::kernel::jobs::{EnqueueRequest, JobError, JobRegistry, JobStatus};

const WAIT: Duration = Duration::from_secs(5);

fn request(user: Uuid, job_type: &str) -> EnqueueRequest {
    EnqueueRequest::builder()
        .owner_user_id(user)
        .job_type(job_type.to_string())
        .build()
}

#[tokio::test]
async fn child_waits_for_parent_then_runs() {
    let mut registry = JobRegistry::new();
    registry.register_fn("parent", |ctx| async move {
        // Stay running long enough for the child to be enqueued while the
        // parent is not yet terminal.
        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.succeed("done", serde_json::json!({})).await
    });
    registry.register_fn("child", |ctx| async move {
        ctx.succeed("done", serde_json::json!({"child": true})).await
    });

    let harness = Harness::new(fast_config(), registry);
    harness.start_worker();

    let user = Uuid::new_v4();
    let parent = harness.api().enqueue(request(user, "parent")).await.unwrap();
    harness.wait_for_status(parent.job_id(), JobStatus::Running, WAIT).await;

    let child_req = EnqueueRequest::builder()
        .owner_user_id(user)
        .job_type("child".to_string())
        .parent_job_id(parent.job_id())
        .build();
    let child = harness.api().enqueue(child_req).await.unwrap();

    // Gated while the parent runs.
    assert_eq!(child.job().status, JobStatus::WaitingParent);

    harness.wait_for_status(parent.job_id(), JobStatus::Succeeded, WAIT).await;
    let child_row = harness.wait_for_status(child.job_id(), JobStatus::Succeeded, WAIT).await;
    assert_eq!(child_row.result.unwrap()["child"], serde_json::json!(true));
}

#[tokio::test]
async fn child_of_succeeded_parent_starts_queued() {
    let mut registry = JobRegistry::new();
    registry.register_fn("parent", |ctx| async move {
        ctx.succeed("done", serde_json::json!({})).await
    });
    registry.register_fn("child", |ctx| async move {
        ctx.succeed("done", serde_json::json!({})).await
    });

    let harness = Harness::new(fast_config(), registry);
    harness.start_worker();

    let user = Uuid::new_v4();
    let parent = harness.api().enqueue(request(user, "parent")).await.unwrap();
    harness.wait_for_status(parent.job_id(), JobStatus::Succeeded, WAIT).await;

    let child_req = EnqueueRequest::builder()
        .owner_user_id(user)
        .job_type("child".to_string())
        .parent_job_id(parent.job_id())
        .build();
    let child = harness.api().enqueue(child_req).await.unwrap();
    assert_ne!(child.job().status, JobStatus::WaitingParent);

    harness.wait_for_status(child.job_id(), JobStatus::Succeeded, WAIT).await;
}

#[tokio::test]
async fn failed_parent_cascades_cancel_to_pending_children() {
    let mut registry = JobRegistry::new();
    registry.register_fn("parent", |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Err(JobError::permanent("parent exploded"))
    });
    registry.register_fn("child", |ctx| async move {
        ctx.succeed("done", serde_json::json!({})).await
    });

    let harness = Harness::new(fast_config(), registry);
    harness.start_worker();

    let user = Uuid::new_v4();
    let parent = harness.api().enqueue(request(user, "parent")).await.unwrap();
    harness.wait_for_status(parent.job_id(), JobStatus::Running, WAIT).await;

    let child_req = EnqueueRequest::builder()
        .owner_user_id(user)
        .job_type("child".to_string())
        .parent_job_id(parent.job_id())
        .build();
    let child = harness.api().enqueue(child_req).await.unwrap();

    harness.wait_for_status(parent.job_id(), JobStatus::Failed, WAIT).await;
    let child_row = harness.wait_for_status(child.job_id(), JobStatus::Canceled, WAIT).await;
    assert_eq!(child_row.status, JobStatus::Canceled);
}

#[tokio::test]
async fn enqueue_under_dead_parent_is_rejected() {
    let mut registry = JobRegistry::new();
    registry.register_fn("parent", |_ctx| async move {
        Err(JobError::permanent("nope"))
    });
    registry.register_fn("child", |_ctx| async move { Ok(()) });

    let harness = Harness::new(fast_config(), registry);
    harness.start_worker();

    let user = Uuid::new_v4();
    let parent = harness.api().enqueue(request(user, "parent")).await.unwrap();
    harness.wait_for_status(parent.job_id(), JobStatus::Failed, WAIT).await;

    let child_req = EnqueueRequest::builder()
        .owner_user_id(user)
        .job_type("child".to_string())
        .parent_job_id(parent.job_id())
        .build();
    let err = harness.api().enqueue(child_req).await.unwrap_err();
    assert!(err.to_string().contains("failed"));
}

#[tokio::test]
async fn ancestor_running_the_same_work_is_rejected() {
    let mut registry = JobRegistry::new();
    registry.register_fn("refine", |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    });

    let harness = Harness::new(fast_config(), registry);
    harness.start_worker();

    let user = Uuid::new_v4();
    let entity = Uuid::new_v4();
    let parent_req = EnqueueRequest::builder()
        .owner_user_id(user)
        .job_type("refine".to_string())
        .entity_kind("library".to_string())
        .entity_id(entity)
        .build();
    let parent = harness.api().enqueue(parent_req).await.unwrap();

    // Same (job_type, entity_id) anywhere up the chain is a cycle.
    let child_req = EnqueueRequest::builder()
        .owner_user_id(Uuid::new_v4())
        .job_type("refine".to_string())
        .entity_kind("library".to_string())
        .entity_id(entity)
        .parent_job_id(parent.job_id())
        .build();
    let err = harness.api().enqueue(child_req).await.unwrap_err();
    assert!(err.to_string().contains("already runs"));
}

#[tokio::test]
async fn handler_fans_out_children_that_run_after_it_succeeds() {
    let mut registry = JobRegistry::new();
    registry.register_fn("parent", |ctx| async move {
        let api = ctx.api();
        for i in 0..2 {
            let child_req = EnqueueRequest::builder()
                .owner_user_id(ctx.owner_user_id().unwrap())
                .job_type("child".to_string())
                .entity_kind("chunk".to_string())
                .entity_id(Uuid::new_v4())
                .payload(serde_json::json!({"chunk": i}))
                .parent_job_id(ctx.job_id())
                .build();
            api.enqueue(child_req)
                .await
                .map_err(|e| anyhow::anyhow!("enqueue child: {e}"))?;
        }
        ctx.succeed("fanned_out", serde_json::json!({})).await
    });
    registry.register_fn("child", |ctx| async move {
        let chunk = ctx.payload()["chunk"].clone();
        ctx.succeed("done", serde_json::json!({"chunk": chunk})).await
    });

    let harness = Harness::new(fast_config(), registry);
    harness.start_worker();

    let user = Uuid::new_v4();
    let parent = harness.api().enqueue(request(user, "parent")).await.unwrap();
    harness.wait_for_status(parent.job_id(), JobStatus::Succeeded, WAIT).await;

    // Both children were released by the parent's success and finished.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let children = harness.api().children(parent.job_id()).await.unwrap();
        if children.len() == 2 && children.iter().all(|c| c.status == JobStatus::Succeeded) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "children never settled: {children:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let dag = harness.deps.dag();
    assert!(dag.children_settled(parent.job_id()).await.unwrap());

    // Fan-in parents read child outputs keyed by job id.
    let merged = dag.collect_child_results(parent.job_id()).await.unwrap();
    let outputs = merged.as_object().unwrap();
    assert_eq!(outputs.len(), 2);
    for child in outputs.values() {
        assert_eq!(child["status"], serde_json::json!("succeeded"));
        assert!(child["result"]["chunk"].is_number());
    }
}
