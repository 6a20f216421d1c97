//! Stream delivery end to end: job lifecycle events arriving on a user's
//! subscription in order, replay after reconnect, channel scoping.

mod common;

use std::time::Duration;

use uuid::Uuid;

use common::{fast_config, Harness};
use server_core::kernel::jobs::{EnqueueRequest, JobRegistry, JobStatus};
use server_core::kernel::stream_hub::SseMessage;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn a_subscriber_sees_the_whole_run_in_order() {
    let mut registry = JobRegistry::new();
    registry.register_fn("demo", |ctx| async move {
        ctx.progress("a", 10, "step a").await?;
        ctx.progress("b", 50, "step b").await?;
        ctx.succeed("done", serde_json::json!({"ok": true})).await
    });

    let harness = Harness::new(fast_config(), registry);
    let user = Uuid::new_v4();
    let mut sub = harness.hub.subscribe(user, vec![], 0).await;

    harness.start_worker();
    let request = EnqueueRequest::builder()
        .owner_user_id(user)
        .job_type("demo".to_string())
        .build();
    let result = harness.api().enqueue(request).await.unwrap();
    harness.wait_for_status(result.job_id(), JobStatus::Succeeded, WAIT).await;

    let mut kinds = Vec::new();
    let mut last_seq = 0;
    while kinds.last().map(String::as_str) != Some("job.done") {
        let msg = tokio::time::timeout(WAIT, sub.recv())
            .await
            .expect("stream went quiet before job.done")
            .expect("hub dropped the subscriber");
        assert!(msg.id > last_seq, "sequence must be strictly increasing");
        last_seq = msg.id;
        kinds.push(msg.kind);
    }

    assert_eq!(
        kinds,
        vec!["job.queued", "job.started", "job.progress", "job.progress", "job.done"]
    );
}

#[tokio::test]
async fn reconnect_replays_only_the_missed_suffix() {
    let registry = JobRegistry::new();
    let harness = Harness::new(fast_config(), registry);
    let user = Uuid::new_v4();

    for i in 1..=12u64 {
        harness
            .hub
            .broadcast(SseMessage::new(user, format!("evt.{i}"), serde_json::json!({})))
            .await;
    }

    // A client that saw seq 5 reconnects: exactly 6..=12, in order.
    let mut sub = harness.hub.subscribe(user, vec![], 5).await;
    for expected in 6..=12u64 {
        let msg = tokio::time::timeout(WAIT, sub.recv()).await.unwrap().unwrap();
        assert_eq!(msg.id, expected);
        assert_eq!(msg.kind, format!("evt.{expected}"));
    }
}

#[tokio::test]
async fn another_users_events_do_not_leak() {
    let mut registry = JobRegistry::new();
    registry.register_fn("demo", |ctx| async move {
        ctx.succeed("done", serde_json::json!({})).await
    });

    let harness = Harness::new(fast_config(), registry);
    let owner = Uuid::new_v4();
    let bystander = Uuid::new_v4();
    let mut sub = harness.hub.subscribe(bystander, vec![], 0).await;

    harness.start_worker();
    let request = EnqueueRequest::builder()
        .owner_user_id(owner)
        .job_type("demo".to_string())
        .build();
    let result = harness.api().enqueue(request).await.unwrap();
    harness.wait_for_status(result.job_id(), JobStatus::Succeeded, WAIT).await;

    let leaked = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
    assert!(leaked.is_err(), "bystander received another user's event");
}

#[tokio::test]
async fn channel_scoped_messages_respect_the_filter() {
    let registry = JobRegistry::new();
    let harness = Harness::new(fast_config(), registry);
    let user = Uuid::new_v4();

    let mut scoped = harness
        .hub
        .subscribe(user, vec!["course:42".to_string()], 0)
        .await;
    let mut unscoped = harness.hub.subscribe(user, vec![], 0).await;

    harness
        .hub
        .broadcast(
            SseMessage::new(user, "course.update", serde_json::json!({}))
                .with_channel("course:42"),
        )
        .await;
    harness
        .hub
        .broadcast(SseMessage::new(user, "broadcast", serde_json::json!({})))
        .await;

    // The scoped client gets both; the unscoped client only the unscoped
    // message.
    assert_eq!(scoped.recv().await.unwrap().kind, "course.update");
    assert_eq!(scoped.recv().await.unwrap().kind, "broadcast");
    assert_eq!(unscoped.recv().await.unwrap().kind, "broadcast");
}
