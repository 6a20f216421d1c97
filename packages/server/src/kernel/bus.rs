//! Cross-replica stream bus.
//!
//! Job lifecycle events raised on any replica must reach the in-memory hub
//! of every replica. Publishers write JSON frames to a shared NATS subject;
//! a forwarder task per replica reads the subject and feeds the local
//! [`StreamHub`]. Delivery is at-most-once: a missed frame is recovered by
//! the hub's ring replay on reconnect, and the database stays the source
//! of truth for job state.
//!
//! The trait allows swapping between real NATS, a single-replica loopback
//! and a recording test double.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream_hub::{SseMessage, StreamHub};

/// Default broadcast subject for SSE frames.
pub const SSE_SUBJECT: &str = "sse.broadcast";

/// Trait for stream bus publish operations.
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Publish a message to the shared broadcast subject.
    async fn publish(&self, msg: SseMessage) -> Result<()>;
}

/// Real NATS-backed bus publisher.
pub struct NatsStreamBus {
    client: async_nats::Client,
    subject: String,
}

impl NatsStreamBus {
    pub fn new(client: async_nats::Client) -> Self {
        Self::with_subject(client, SSE_SUBJECT)
    }

    pub fn with_subject(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl StreamBus for NatsStreamBus {
    async fn publish(&self, msg: SseMessage) -> Result<()> {
        let payload = serde_json::to_vec(&msg)?;
        self.client
            .publish(self.subject.clone(), Bytes::from(payload))
            .await?;
        Ok(())
    }
}

/// Single-replica loopback: publishes straight into the local hub.
///
/// Used when no NATS endpoint is configured and by the test harness, so
/// the publish → hub → subscriber path is identical either way.
pub struct LocalStreamBus {
    hub: StreamHub,
}

impl LocalStreamBus {
    pub fn new(hub: StreamHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl StreamBus for LocalStreamBus {
    async fn publish(&self, msg: SseMessage) -> Result<()> {
        self.hub.broadcast(msg).await;
        Ok(())
    }
}

/// Recording bus for tests: keeps every published frame for assertions
/// and optionally loops frames into a hub like the real forwarder would.
#[derive(Default)]
pub struct TestStreamBus {
    published: RwLock<Vec<SseMessage>>,
    hub: Option<StreamHub>,
}

impl TestStreamBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and also deliver to `hub`, mimicking a replica's forwarder.
    pub fn with_hub(hub: StreamHub) -> Self {
        Self {
            published: RwLock::new(Vec::new()),
            hub: Some(hub),
        }
    }

    pub fn record(&self, msg: SseMessage) {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(msg);
    }

    /// Get all published messages.
    pub fn published_messages(&self) -> Vec<SseMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Published messages of one kind (e.g. `job.progress`).
    pub fn messages_of_kind(&self, kind: &str) -> Vec<SseMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }

    pub fn was_published(&self, kind: &str) -> bool {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|m| m.kind == kind)
    }

    pub fn publish_count(&self) -> usize {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn clear(&self) {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl StreamBus for TestStreamBus {
    async fn publish(&self, msg: SseMessage) -> Result<()> {
        self.record(msg.clone());
        if let Some(hub) = &self.hub {
            hub.broadcast(msg).await;
        }
        Ok(())
    }
}

/// Spawn the per-replica forwarder: reads the broadcast subject and feeds
/// every frame into the local hub until shutdown.
pub fn spawn_forwarder(
    client: async_nats::Client,
    hub: StreamHub,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscriber = match client.subscribe(SSE_SUBJECT.to_string()).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, subject = SSE_SUBJECT, "stream bus subscribe failed; forwarder exiting");
                return;
            }
        };

        info!(subject = SSE_SUBJECT, "stream bus forwarder started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = subscriber.next() => {
                    let Some(frame) = next else { break };
                    match serde_json::from_slice::<SseMessage>(&frame.payload) {
                        Ok(msg) => {
                            debug!(user_id = %msg.user_id, kind = %msg.kind, "forwarding bus frame");
                            hub.broadcast(msg).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping malformed bus frame");
                        }
                    }
                }
            }
        }

        info!("stream bus forwarder stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn msg(user: Uuid, kind: &str) -> SseMessage {
        SseMessage::new(user, kind, serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_bus_records_messages() {
        let bus = TestStreamBus::new();
        let user = Uuid::new_v4();

        bus.publish(msg(user, "job.queued")).await.unwrap();
        bus.publish(msg(user, "job.done")).await.unwrap();

        assert_eq!(bus.publish_count(), 2);
        assert!(bus.was_published("job.queued"));
        assert!(!bus.was_published("job.failed"));
        assert_eq!(bus.messages_of_kind("job.done").len(), 1);
    }

    #[tokio::test]
    async fn test_bus_clear() {
        let bus = TestStreamBus::new();
        bus.publish(msg(Uuid::new_v4(), "job.queued")).await.unwrap();
        bus.clear();
        assert_eq!(bus.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_bus_forwards_into_hub() {
        let hub = StreamHub::new();
        let bus = TestStreamBus::with_hub(hub.clone());
        let user = Uuid::new_v4();

        let mut sub = hub.subscribe(user, vec![], 0).await;
        bus.publish(msg(user, "job.progress")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().kind, "job.progress");
    }

    #[tokio::test]
    async fn local_bus_delivers_to_subscribers() {
        let hub = StreamHub::new();
        let bus = LocalStreamBus::new(hub.clone());
        let user = Uuid::new_v4();

        let mut sub = hub.subscribe(user, vec![], 0).await;
        bus.publish(msg(user, "job.done")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().kind, "job.done");
    }

    #[tokio::test]
    async fn frames_roundtrip_as_json() {
        let original = msg(Uuid::new_v4(), "job.progress").with_channel("course_build");
        let bytes = serde_json::to_vec(&original).unwrap();
        let decoded: SseMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.kind, original.kind);
        assert_eq!(decoded.channel, original.channel);
        assert_eq!(decoded.user_id, original.user_id);
    }
}
