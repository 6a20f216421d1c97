//! In-process pub/sub hub for real-time streaming.
//!
//! Fans each incoming message out to the connected clients of one user and
//! keeps a bounded ring of recent messages per user so a reconnecting
//! client can replay what it missed.
//!
//! # Usage
//!
//! Producers (the job notifier, via the bus forwarder):
//!   hub.broadcast(msg).await;
//!
//! Consumers (SSE endpoints):
//!   let sub = hub.subscribe(user_id, vec![], last_seq).await;
//!
//! The hub is the one process-wide singleton of the runtime: its identity
//! is "this replica's in-memory fan-out".

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::config::SseConfig;

/// A single server-sent message.
///
/// `id` is the per-user monotone sequence, assigned by each hub at
/// broadcast time; publishers leave it zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseMessage {
    #[serde(default)]
    pub id: u64,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub user_id: Uuid,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl SseMessage {
    pub fn new(user_id: Uuid, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: 0,
            kind: kind.into(),
            channel: None,
            user_id,
            payload,
            ts: Utc::now(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// A client receives a message iff the user matches and the message is
    /// either unscoped or scoped to one of the client's channels.
    fn matches(&self, channels: &HashSet<String>) -> bool {
        match &self.channel {
            None => true,
            Some(channel) => channels.contains(channel),
        }
    }
}

/// One connected client's handle inside the hub.
struct HubClient {
    channels: HashSet<String>,
    tx: mpsc::Sender<SseMessage>,
}

/// Per-user fan-out state: live clients plus the replay ring.
#[derive(Default)]
struct UserStreams {
    next_seq: u64,
    ring: VecDeque<SseMessage>,
    clients: HashMap<Uuid, HubClient>,
}

/// A live subscription handed to the SSE edge.
pub struct Subscription {
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub receiver: mpsc::Receiver<SseMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SseMessage> {
        self.receiver.recv().await
    }
}

/// Per-replica in-memory fan-out hub.
///
/// Thread-safe, cloneable. Keyed by user id.
#[derive(Clone)]
pub struct StreamHub {
    users: Arc<RwLock<HashMap<Uuid, UserStreams>>>,
    ring_size: usize,
    client_buffer: usize,
}

impl StreamHub {
    /// Create a hub with the default replay depth (256 messages per user).
    pub fn new() -> Self {
        Self::with_config(&SseConfig::default())
    }

    pub fn with_config(config: &SseConfig) -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            ring_size: config.ring_size.max(1),
            // A client queue must absorb a full ring replay plus some live
            // headroom, or a reconnect gets itself dropped as "slow".
            client_buffer: config.client_buffer.max(config.ring_size + 16),
        }
    }

    /// Subscribe a client for one user.
    ///
    /// Buffered messages with `seq > last_seq` that match the channel
    /// filter are replayed, in order, before any live message.
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        channels: Vec<String>,
        last_seq: u64,
    ) -> Subscription {
        let client_id = Uuid::new_v4();
        let channels: HashSet<String> = channels.into_iter().collect();
        let (tx, rx) = mpsc::channel(self.client_buffer);

        let mut users = self.users.write().await;
        let streams = users.entry(user_id).or_default();

        for msg in streams.ring.iter() {
            if msg.id > last_seq && msg.matches(&channels) {
                // Cannot fail: the queue is sized to hold a full ring.
                let _ = tx.try_send(msg.clone());
            }
        }

        streams.clients.insert(client_id, HubClient { channels, tx });

        Subscription {
            client_id,
            user_id,
            receiver: rx,
        }
    }

    /// Drop one client's registration. Safe to call after a disconnect.
    pub async fn unsubscribe(&self, user_id: Uuid, client_id: Uuid) {
        let mut users = self.users.write().await;
        if let Some(streams) = users.get_mut(&user_id) {
            streams.clients.remove(&client_id);
        }
    }

    /// Assign the next per-user sequence, buffer the message and forward it
    /// to every matching client. Never blocks: a client whose queue is full
    /// is dropped as too slow. Returns the assigned sequence number.
    pub async fn broadcast(&self, mut msg: SseMessage) -> u64 {
        let mut users = self.users.write().await;
        let streams = users.entry(msg.user_id).or_default();

        streams.next_seq += 1;
        msg.id = streams.next_seq;

        streams.ring.push_back(msg.clone());
        while streams.ring.len() > self.ring_size {
            streams.ring.pop_front();
        }

        let mut dropped = Vec::new();
        for (client_id, client) in streams.clients.iter() {
            if !msg.matches(&client.channels) {
                continue;
            }
            if client.tx.try_send(msg.clone()).is_err() {
                dropped.push(*client_id);
            }
        }

        for client_id in dropped {
            tracing::warn!(user_id = %msg.user_id, client_id = %client_id, "dropping slow sse client");
            streams.clients.remove(&client_id);
        }

        msg.id
    }

    /// Remove users with no connected clients (housekeeping). Their replay
    /// ring is discarded, so only call this on quiet users you are willing
    /// to make re-fetch state over the API.
    pub async fn cleanup(&self) {
        let mut users = self.users.write().await;
        users.retain(|_, streams| !streams.clients.is_empty());
    }

    /// Connected client count for a user. Test and metrics helper.
    pub async fn client_count(&self, user_id: Uuid) -> usize {
        let users = self.users.read().await;
        users.get(&user_id).map_or(0, |s| s.clients.len())
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}
