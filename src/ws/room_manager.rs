use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connctx::{ConnCtx, ConnId};
use super::pubsub::{MessageStream, PubSubMessage, PubSubTransport};
use crate::error::TransportError;
use crate::models::OutboundMessage;

pub const ROOM_CHANNEL_PREFIX: &str = "ws:room:";
pub const GLOBAL_BROADCAST_CHANNEL: &str = "ws:broadcast:all";
const SUBSCRIBE_PATTERNS: [&str; 2] = ["ws:room:*", "ws:broadcast:*"];
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Message published on the distributed channel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FanoutEnvelope {
    pub instance_id: String,
    pub message: Value,
    #[serde(default)]
    pub exclude_session_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomSize {
    pub room_id: String,
    pub connection_count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub instance_id: String,
    pub distributed_enabled: bool,
    pub total_rooms: usize,
    pub total_connections: usize,
    pub messages_published: u64,
    pub messages_received: u64,
    pub rooms: Vec<RoomSize>,
}

/// Tracks which local connections sit in which document room and bridges local
/// delivery with the distributed pub/sub channel.
pub struct RoomManager {
    instance_id: String,
    local_rooms: DashMap<String, HashMap<ConnId, ConnCtx>>,
    distributed: AtomicBool,
    publish_tx: Mutex<Option<mpsc::UnboundedSender<(String, String)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    messages_published: AtomicU64,
    messages_received: AtomicU64,
}

impl RoomManager {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            local_rooms: DashMap::new(),
            distributed: AtomicBool::new(false),
            publish_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            messages_published: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed.load(Ordering::SeqCst)
    }

    /// Connect the transport and start the publisher/subscriber tasks.
    ///
    /// Connection is retried with a bounded backoff. When every attempt fails the
    /// manager stays in single-instance mode for the rest of its life and this
    /// returns false.
    pub async fn enable_distributed(self: &Arc<Self>, transport: Arc<dyn PubSubTransport>, max_attempts: u32) -> bool {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        let stream = loop {
            attempt += 1;
            match Self::connect_transport(transport.as_ref()).await {
                Ok(stream) => break stream,
                Err(e) if attempt < max_attempts => {
                    let delay = Duration::from_millis(attempt as u64 * 100).min(MAX_BACKOFF);
                    warn!(
                        "Pub/sub connect attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "Pub/sub unavailable after {} attempts, running in single-instance mode: {}",
                        attempt, e
                    );
                    return false;
                }
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
        let publisher_transport = transport.clone();
        let publisher = tokio::spawn(async move {
            while let Some((channel, payload)) = rx.recv().await {
                if let Err(e) = publisher_transport.publish(&channel, payload).await {
                    error!("Failed to publish to {}: {}", channel, e);
                }
            }
        });

        let subscriber = tokio::spawn(Self::run_subscriber(Arc::downgrade(self), stream));

        *self.publish_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([publisher, subscriber]);
        self.distributed.store(true, Ordering::SeqCst);

        info!("Distributed fan-out enabled for instance {}", self.instance_id);
        true
    }

    async fn connect_transport(transport: &dyn PubSubTransport) -> Result<MessageStream, TransportError> {
        transport.connect().await?;
        let patterns: Vec<String> = SUBSCRIBE_PATTERNS.iter().map(|p| p.to_string()).collect();
        transport.psubscribe(&patterns).await
    }

    async fn run_subscriber(manager: Weak<Self>, mut stream: MessageStream) {
        while let Some(msg) = stream.next().await {
            match manager.upgrade() {
                Some(manager) => manager.handle_remote(msg),
                None => return,
            }
        }

        if let Some(manager) = manager.upgrade() {
            warn!(
                "Pub/sub subscription ended for instance {}, falling back to single-instance mode",
                manager.instance_id
            );
            manager.distributed.store(false, Ordering::SeqCst);
            manager.publish_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        }
    }

    fn handle_remote(&self, msg: PubSubMessage) {
        let envelope: FanoutEnvelope = match serde_json::from_str(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed pub/sub message on {}: {}", msg.channel, e);
                return;
            }
        };

        // Our own publication; local members already got it
        if envelope.instance_id == self.instance_id {
            return;
        }

        self.messages_received.fetch_add(1, Ordering::Relaxed);

        let text = match serde_json::to_string(&envelope.message) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to re-serialize remote message: {}", e);
                return;
            }
        };
        let exclude = envelope.exclude_session_id.as_deref();

        if let Some(room_id) = msg.channel.strip_prefix(ROOM_CHANNEL_PREFIX) {
            let delivered = self.deliver_local(room_id, &text, exclude);
            debug!(
                "Delivered remote message from {} to {} local connections in room {}",
                envelope.instance_id, delivered, room_id
            );
        } else if msg.channel == GLOBAL_BROADCAST_CHANNEL {
            for room_id in self.room_ids() {
                self.deliver_local(&room_id, &text, exclude);
            }
        }
    }

    pub fn join(&self, room_id: &str, conn: &ConnCtx) {
        self.local_rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn.conn_id, conn.clone());
        debug!("Connection {} joined room {}", conn.conn_id, room_id);
    }

    pub fn leave(&self, room_id: &str, conn: &ConnCtx) {
        if let Some(mut room) = self.local_rooms.get_mut(room_id) {
            room.remove(&conn.conn_id);
        }
        self.local_rooms.remove_if(room_id, |_, members| members.is_empty());
        debug!("Connection {} left room {}", conn.conn_id, room_id);
    }

    /// Remove the connection from every room, returning the rooms it was in
    pub fn leave_all_rooms(&self, conn: &ConnCtx) -> Vec<String> {
        let rooms: Vec<String> = self
            .local_rooms
            .iter()
            .filter(|room| room.value().contains_key(&conn.conn_id))
            .map(|room| room.key().clone())
            .collect();
        for room_id in &rooms {
            self.leave(room_id, conn);
        }
        rooms
    }

    pub fn is_member(&self, room_id: &str, conn: &ConnCtx) -> bool {
        self.local_rooms
            .get(room_id)
            .map(|room| room.contains_key(&conn.conn_id))
            .unwrap_or(false)
    }

    pub fn is_room_empty(&self, room_id: &str) -> bool {
        self.room_size(room_id) == 0
    }

    pub fn room_size(&self, room_id: &str) -> usize {
        self.local_rooms.get(room_id).map(|room| room.len()).unwrap_or(0)
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.local_rooms.iter().map(|room| room.key().clone()).collect()
    }

    pub fn total_connections(&self) -> usize {
        self.local_rooms.iter().map(|room| room.len()).sum()
    }

    /// Fan a message out to a room: publish for the other instances, then deliver
    /// locally right away. Never waits on the transport.
    pub fn broadcast(&self, room_id: &str, message: &OutboundMessage, exclude: Option<&ConnCtx>) -> usize {
        let value = match serde_json::to_value(message) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to serialize message for room {}: {}", room_id, e);
                return 0;
            }
        };
        let exclude_session = exclude.map(|conn| conn.session_id.clone());

        self.publish(&format!("{}{}", ROOM_CHANNEL_PREFIX, room_id), &value, exclude_session.clone());

        let text = value.to_string();
        self.deliver_local(room_id, &text, exclude_session.as_deref())
    }

    /// Deliver to every local room and to every other instance
    pub fn broadcast_all(&self, message: &OutboundMessage) -> usize {
        let value = match serde_json::to_value(message) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to serialize global broadcast: {}", e);
                return 0;
            }
        };
        self.publish(GLOBAL_BROADCAST_CHANNEL, &value, None);

        let text = value.to_string();
        self.room_ids()
            .iter()
            .map(|room_id| self.deliver_local(room_id, &text, None))
            .sum()
    }

    fn publish(&self, channel: &str, message: &Value, exclude_session_id: Option<String>) {
        if !self.is_distributed() {
            return;
        }
        let envelope = FanoutEnvelope {
            instance_id: self.instance_id.clone(),
            message: message.clone(),
            exclude_session_id,
            timestamp: Utc::now().timestamp_millis(),
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize fan-out envelope: {}", e);
                return;
            }
        };

        let guard = self.publish_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            if tx.send((channel.to_string(), payload)).is_ok() {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
            } else {
                warn!("Publisher task is gone, dropping message for {}", channel);
            }
        }
    }

    fn deliver_local(&self, room_id: &str, text: &str, exclude_session_id: Option<&str>) -> usize {
        let members: Vec<ConnCtx> = match self.local_rooms.get(room_id) {
            Some(room) => room.values().cloned().collect(),
            None => return 0,
        };

        members
            .iter()
            .filter(|conn| Some(conn.session_id.as_str()) != exclude_session_id)
            .filter(|conn| conn.is_open())
            .filter(|conn| conn.send_text(text.to_string()))
            .count()
    }

    pub fn stats(&self) -> RoomStats {
        let rooms: Vec<RoomSize> = self
            .local_rooms
            .iter()
            .map(|room| RoomSize {
                room_id: room.key().clone(),
                connection_count: room.len(),
            })
            .collect();
        RoomStats {
            instance_id: self.instance_id.clone(),
            distributed_enabled: self.is_distributed(),
            total_rooms: rooms.len(),
            total_connections: rooms.iter().map(|r| r.connection_count).sum(),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            rooms,
        }
    }

    /// Stop the transport tasks and forget every local room
    pub fn shutdown(&self) {
        self.distributed.store(false, Ordering::SeqCst);
        self.publish_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        self.local_rooms.clear();
        info!("Room manager for instance {} shut down", self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodePresenceAction, NodePresenceUpdatedPayload};
    use crate::ws::connctx::OutgoingFrame;
    use crate::ws::pubsub::InMemoryPubSub;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn message(doc: &str) -> OutboundMessage {
        OutboundMessage::NodePresenceUpdated(NodePresenceUpdatedPayload {
            document_id: doc.to_string(),
            user_id: "u1".to_string(),
            session_id: "s1".to_string(),
            action: NodePresenceAction::Enter,
            node_id: "n1".to_string(),
        })
    }

    async fn next_text(rx: &mut UnboundedReceiver<OutgoingFrame>) -> Option<Value> {
        match timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(OutgoingFrame::Text(text))) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    #[test]
    fn rooms_are_dropped_when_last_member_leaves() {
        let rooms = RoomManager::new("i1");
        let (a, _ra) = ConnCtx::new("s1", None);
        let (b, _rb) = ConnCtx::new("s2", None);

        rooms.join("doc", &a);
        rooms.join("doc", &b);
        rooms.join("other", &a);
        assert_eq!(rooms.room_size("doc"), 2);
        assert_eq!(rooms.total_connections(), 3);

        rooms.leave("doc", &b);
        assert_eq!(rooms.room_size("doc"), 1);

        let left = rooms.leave_all_rooms(&a);
        assert_eq!(left.len(), 2);
        assert!(rooms.is_room_empty("doc"));
        assert!(rooms.room_ids().is_empty());
        assert_eq!(rooms.stats().total_rooms, 0);
    }

    #[tokio::test]
    async fn local_broadcast_skips_the_sender_session() {
        let rooms = RoomManager::new("i1");
        let (a, mut ra) = ConnCtx::new("s1", None);
        let (b, mut rb) = ConnCtx::new("s2", None);
        rooms.join("doc", &a);
        rooms.join("doc", &b);

        let delivered = rooms.broadcast("doc", &message("doc"), Some(&a));
        assert_eq!(delivered, 1);

        let got = next_text(&mut rb).await.unwrap();
        assert_eq!(got["type"], "ON_NODE_PRESENCE_UPDATED");
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_instances_receive_without_echo() {
        let bus = InMemoryPubSub::default();
        let first = Arc::new(RoomManager::new("i1"));
        let second = Arc::new(RoomManager::new("i2"));
        assert!(first.enable_distributed(Arc::new(bus.clone()), 3).await);
        assert!(second.enable_distributed(Arc::new(bus.clone()), 3).await);

        let (a, mut ra) = ConnCtx::new("s1", None);
        let (b, mut rb) = ConnCtx::new("s2", None);
        let (c, mut rc) = ConnCtx::new("s3", None);
        first.join("doc", &a);
        first.join("doc", &c);
        second.join("doc", &b);

        first.broadcast("doc", &message("doc"), Some(&a));

        // Local member once, remote member once, sender never
        assert!(next_text(&mut rc).await.is_some());
        assert!(next_text(&mut rb).await.is_some());
        assert!(next_text(&mut rc).await.is_none());
        assert!(ra.try_recv().is_err());
        assert_eq!(second.stats().messages_received, 1);

        first.shutdown();
        second.shutdown();
    }

    #[tokio::test]
    async fn global_broadcast_reaches_every_remote_room() {
        let bus = InMemoryPubSub::default();
        let first = Arc::new(RoomManager::new("i1"));
        let second = Arc::new(RoomManager::new("i2"));
        first.enable_distributed(Arc::new(bus.clone()), 1).await;
        second.enable_distributed(Arc::new(bus.clone()), 1).await;

        let (b, mut rb) = ConnCtx::new("s2", None);
        let (c, mut rc) = ConnCtx::new("s3", None);
        second.join("doc-1", &b);
        second.join("doc-2", &c);

        first.broadcast_all(&message("all"));
        assert!(next_text(&mut rb).await.is_some());
        assert!(next_text(&mut rc).await.is_some());
    }

    #[tokio::test]
    async fn transport_outage_degrades_to_local_delivery() {
        let bus = InMemoryPubSub::default();
        bus.set_available(false);
        let rooms = Arc::new(RoomManager::new("i1"));

        assert!(!rooms.enable_distributed(Arc::new(bus), 2).await);
        assert!(!rooms.is_distributed());

        let (a, _ra) = ConnCtx::new("s1", None);
        let (b, mut rb) = ConnCtx::new("s2", None);
        rooms.join("doc", &a);
        rooms.join("doc", &b);
        assert_eq!(rooms.broadcast("doc", &message("doc"), Some(&a)), 1);
        assert!(next_text(&mut rb).await.is_some());
    }

    #[tokio::test]
    async fn remote_payload_is_the_original_message() {
        let bus = InMemoryPubSub::default();
        let mut raw = bus.psubscribe(&["ws:room:*".to_string()]).await.unwrap();
        let rooms = Arc::new(RoomManager::new("i1"));
        rooms.enable_distributed(Arc::new(bus.clone()), 1).await;

        let (a, _ra) = ConnCtx::new("s1", None);
        rooms.join("doc", &a);
        rooms.broadcast("doc", &message("doc"), Some(&a));

        let published = timeout(Duration::from_millis(500), raw.next()).await.unwrap().unwrap();
        assert_eq!(published.channel, "ws:room:doc");
        let envelope: FanoutEnvelope = serde_json::from_str(&published.payload).unwrap();
        assert_eq!(envelope.instance_id, "i1");
        assert_eq!(envelope.exclude_session_id.as_deref(), Some("s1"));
        assert_eq!(envelope.message, serde_json::to_value(message("doc")).unwrap());
    }
}
