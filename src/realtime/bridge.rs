//! Room membership and cross-instance fan-out
//!
//! Lock order: `rooms` before a room's `members`. Both are short sync locks
//! and are never held across an await. Broker subscribe and unsubscribe run
//! under the room's own `subscription` lock, so a slow broker only stalls
//! joins to that room.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::{Broker, RoomEvent};
use super::protocol::{ServerMessage, validate_room};
use crate::GatewayError;
use crate::config::RealtimeConfig;
use crate::gateway::auth::AuthGate;

/// Connection identifier, unique per instance
pub type ConnectionId = Uuid;

type Members = Arc<RwLock<HashSet<ConnectionId>>>;
type Registry = Arc<DashMap<ConnectionId, Arc<ConnectionHandle>>>;

struct ConnectionHandle {
    subject: String,
    tx: mpsc::Sender<ServerMessage>,
    rooms: Mutex<HashSet<String>>,
}

/// Forwarder for a subscribed room; `None` until the first join subscribes
type Subscription = Arc<AsyncMutex<Option<JoinHandle<()>>>>;

#[derive(Clone)]
struct RoomEntry {
    members: Members,
    subscription: Subscription,
}

impl RoomEntry {
    fn new() -> Self {
        Self {
            members: Arc::new(RwLock::new(HashSet::new())),
            subscription: Arc::new(AsyncMutex::new(None)),
        }
    }

    fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.subscription, &other.subscription)
    }
}

/// Realtime rooms for one gateway instance
pub struct RealtimeBridge {
    instance_id: String,
    broker: Arc<dyn Broker>,
    connections: Registry,
    rooms: Mutex<HashMap<String, RoomEntry>>,
    pub(super) settings: RealtimeConfig,
    pub(super) auth: Arc<AuthGate>,
    shutdown: CancellationToken,
}

impl RealtimeBridge {
    /// Create a bridge publishing through `broker`
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        broker: Arc<dyn Broker>,
        auth: Arc<AuthGate>,
        settings: RealtimeConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            broker,
            connections: Arc::new(DashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            settings,
            auth,
            shutdown,
        }
    }

    /// Instance id stamped on published events
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Token cancelled when the bridge shuts down
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Register an authenticated connection. Frames for it arrive on the
    /// returned receiver.
    pub fn register(&self, subject: &str) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.settings.buffer_size.max(1));
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Arc::new(ConnectionHandle {
                subject: subject.to_string(),
                tx,
                rooms: Mutex::new(HashSet::new()),
            }),
        );
        telemetry_metrics::gauge!("gateway_realtime_connections").increment(1.0);
        debug!(connection = %id, subject = %subject, "Realtime connection registered");
        (id, rx)
    }

    /// Join `room`. Idempotent; returns `true` if the connection was not
    /// already a member. The first local member subscribes the instance to
    /// the room's broker channel.
    ///
    /// # Errors
    ///
    /// `ValidationFailed` for a bad room id, `Internal` if the connection is
    /// unknown or the broker cannot subscribe in time.
    pub async fn join(&self, connection: ConnectionId, room: &str) -> Result<bool, GatewayError> {
        validate_room(room).map_err(GatewayError::validation)?;
        let handle = self
            .connections
            .get(&connection)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| GatewayError::internal(format!("unknown connection {connection}")))?;

        let (entry, inserted) = {
            let mut rooms = self.rooms.lock();
            let entry = rooms.entry(room.to_string()).or_insert_with(RoomEntry::new).clone();
            let inserted = entry.members.write().insert(connection);
            (entry, inserted)
        };

        {
            let mut subscription = entry.subscription.lock().await;
            if subscription.is_none() {
                match self.subscribe(room, &entry).await {
                    Ok(forwarder) => *subscription = Some(forwarder),
                    Err(e) => {
                        drop(subscription);
                        if inserted {
                            self.forget(connection, room, &entry);
                        }
                        return Err(e);
                    }
                }
            }
        }

        handle.rooms.lock().insert(room.to_string());
        Ok(inserted)
    }

    async fn subscribe(&self, room: &str, entry: &RoomEntry) -> Result<JoinHandle<()>, GatewayError> {
        let stream = tokio::time::timeout(self.settings.broker_timeout, self.broker.subscribe(room))
            .await
            .map_err(|_| GatewayError::internal(format!("broker subscribe to '{room}' timed out")))?
            .map_err(|e| GatewayError::internal(format!("broker subscribe to '{room}' failed: {e}")))?;
        debug!(room = %room, instance = %self.instance_id, "Subscribed to room");
        Ok(spawn_forwarder(
            room.to_string(),
            stream,
            Arc::clone(&entry.members),
            Arc::clone(&self.connections),
        ))
    }

    /// Remove `connection` from `entry`'s members. Returns `(removed, dropped)`
    /// where `dropped` means the room entry itself was removed.
    fn forget(&self, connection: ConnectionId, room: &str, entry: &RoomEntry) -> (bool, bool) {
        let mut rooms = self.rooms.lock();
        let (removed, now_empty) = {
            let mut members = entry.members.write();
            let removed = members.remove(&connection);
            (removed, members.is_empty())
        };
        let dropped = now_empty && rooms.get(room).is_some_and(|current| current.same_as(entry));
        if dropped {
            rooms.remove(room);
        }
        (removed, dropped)
    }

    /// Leave `room`. Returns `true` if the connection was a member. The last
    /// local member drops the instance's broker subscription.
    pub async fn leave(&self, connection: ConnectionId, room: &str) -> bool {
        let Some(entry) = self.rooms.lock().get(room).cloned() else {
            return false;
        };
        let (removed, dropped) = self.forget(connection, room, &entry);
        if dropped {
            if let Some(forwarder) = entry.subscription.lock().await.take() {
                forwarder.abort();
                debug!(room = %room, instance = %self.instance_id, "Unsubscribed from room");
            }
        }

        if let Some(handle) = self.connections.get(&connection).map(|h| Arc::clone(h.value())) {
            handle.rooms.lock().remove(room);
        }
        removed
    }

    /// Publish an event to `room` on every instance
    ///
    /// # Errors
    ///
    /// `ValidationFailed` for a bad room or event name, `Internal` if the
    /// broker fails or times out.
    pub async fn publish(
        &self,
        room: &str,
        event: &str,
        data: Value,
        sender: Option<&str>,
    ) -> Result<(), GatewayError> {
        validate_room(room).map_err(GatewayError::validation)?;
        if event.trim().is_empty() {
            return Err(GatewayError::validation("event must not be empty"));
        }

        let event = RoomEvent {
            room: room.to_string(),
            event: event.to_string(),
            data,
            sender: sender.map(String::from),
            origin: self.instance_id.clone(),
        };
        tokio::time::timeout(self.settings.broker_timeout, self.broker.publish(room, &event))
            .await
            .map_err(|_| GatewayError::internal(format!("broker publish to '{room}' timed out")))?
            .map_err(|e| GatewayError::internal(format!("broker publish to '{room}' failed: {e}")))
    }

    /// Remove a connection from the registry and every room it joined.
    /// Nothing is delivered to it afterwards.
    pub async fn disconnect(&self, connection: ConnectionId) {
        let Some((_, handle)) = self.connections.remove(&connection) else {
            return;
        };
        let rooms: Vec<String> = handle.rooms.lock().drain().collect();
        for room in &rooms {
            self.leave(connection, room).await;
        }
        telemetry_metrics::gauge!("gateway_realtime_connections").decrement(1.0);
        debug!(connection = %connection, subject = %handle.subject, rooms = rooms.len(), "Realtime connection closed");
    }

    /// Local members of `room`
    pub async fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .lock()
            .get(room)
            .map(|entry| entry.members.read().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Rooms with at least one local member
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Registered connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop every session and drop all broker subscriptions
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let entries: Vec<RoomEntry> = self.rooms.lock().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            if let Some(forwarder) = entry.subscription.lock().await.take() {
                forwarder.abort();
            }
        }
        info!(connections = self.connections.len(), "Realtime bridge shut down");
    }
}

/// Deliver a room's broker events to its local members
fn spawn_forwarder(
    room: String,
    mut stream: super::broker::EventStream,
    members: Members,
    connections: Registry,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let targets: Vec<ConnectionId> = members.read().iter().copied().collect();
            for id in targets {
                let Some(handle) = connections.get(&id).map(|h| Arc::clone(h.value())) else {
                    continue;
                };
                let frame = ServerMessage::Event {
                    room: event.room.clone(),
                    event: event.event.clone(),
                    data: event.data.clone(),
                    sender: event.sender.clone(),
                };
                if let Err(mpsc::error::TrySendError::Full(_)) = handle.tx.try_send(frame) {
                    warn!(room = %room, connection = %id, "Connection outbound queue full; event dropped");
                }
            }
        }
        debug!(room = %room, "Room subscription ended");
    })
}

impl std::fmt::Debug for RealtimeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeBridge")
            .field("instance_id", &self.instance_id)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::realtime::MemoryBroker;
    use serde_json::json;
    use std::time::Duration;

    fn bridge(name: &str, broker: Arc<dyn Broker>) -> RealtimeBridge {
        let auth = AuthGate::from_config(&AuthConfig {
            enabled: false,
            ..Default::default()
        })
        .unwrap();
        RealtimeBridge::new(
            name,
            broker,
            Arc::new(auth),
            RealtimeConfig::default(),
            CancellationToken::new(),
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> Option<ServerMessage> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let bridge = bridge("a", Arc::new(MemoryBroker::default()));
        let (id, _rx) = bridge.register("alice");
        assert!(bridge.join(id, "chat").await.unwrap());
        assert!(!bridge.join(id, "chat").await.unwrap());
        assert_eq!(bridge.members("chat").await, vec![id]);
        assert_eq!(bridge.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_last_leave_drops_room() {
        let bridge = bridge("a", Arc::new(MemoryBroker::default()));
        let (a, _ra) = bridge.register("alice");
        let (b, _rb) = bridge.register("bob");
        bridge.join(a, "chat").await.unwrap();
        bridge.join(b, "chat").await.unwrap();
        assert!(bridge.leave(a, "chat").await);
        assert_eq!(bridge.room_count().await, 1);
        assert!(bridge.leave(b, "chat").await);
        assert_eq!(bridge.room_count().await, 0);
        assert!(!bridge.leave(b, "chat").await);
    }

    #[tokio::test]
    async fn test_publish_reaches_members_only() {
        let bridge = bridge("a", Arc::new(MemoryBroker::default()));
        let (member, mut member_rx) = bridge.register("alice");
        let (_outsider, mut outsider_rx) = bridge.register("bob");
        bridge.join(member, "chat").await.unwrap();

        bridge
            .publish("chat", "typing", json!({"user": "alice"}), Some("alice"))
            .await
            .unwrap();

        match recv(&mut member_rx).await {
            Some(ServerMessage::Event { room, event, sender, .. }) => {
                assert_eq!(room, "chat");
                assert_eq!(event, "typing");
                assert_eq!(sender.as_deref(), Some("alice"));
            }
            other => panic!("expected event, got {other:?}"),
        }
        assert!(recv(&mut outsider_rx).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_clears_rooms() {
        let bridge = bridge("a", Arc::new(MemoryBroker::default()));
        let (id, _rx) = bridge.register("alice");
        bridge.join(id, "one").await.unwrap();
        bridge.join(id, "two").await.unwrap();
        bridge.disconnect(id).await;
        assert_eq!(bridge.connection_count(), 0);
        assert_eq!(bridge.room_count().await, 0);
        assert!(bridge.join(id, "one").await.is_err());
    }

    #[tokio::test]
    async fn test_room_churn_releases_broker_channels() {
        let broker = Arc::new(MemoryBroker::default());
        let bridge = bridge("a", Arc::clone(&broker) as Arc<dyn Broker>);
        let (id, _rx) = bridge.register("alice");
        for n in 0..200 {
            let room = format!("room-{n}");
            bridge.join(id, &room).await.unwrap();
            assert!(bridge.leave(id, &room).await);
        }
        assert_eq!(bridge.room_count().await, 0);

        // Aborted forwarders drop their streams on the runtime's next pass
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while broker.channel_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.channel_count(), 0);
    }

    /// Holds subscriptions to `slow` for a second
    struct SlowBroker(MemoryBroker);

    #[async_trait::async_trait]
    impl Broker for SlowBroker {
        async fn publish(&self, room: &str, event: &RoomEvent) -> crate::Result<()> {
            self.0.publish(room, event).await
        }

        async fn subscribe(&self, room: &str) -> crate::Result<crate::realtime::EventStream> {
            if room == "slow" {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            self.0.subscribe(room).await
        }
    }

    #[tokio::test]
    async fn test_slow_subscribe_does_not_block_other_rooms() {
        let bridge = Arc::new(bridge("a", Arc::new(SlowBroker(MemoryBroker::default()))));
        let (slow, _slow_rx) = bridge.register("alice");
        let (fast, _fast_rx) = bridge.register("bob");

        let pending = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.join(slow, "slow").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = tokio::time::Instant::now();
        bridge.join(fast, "fast").await.unwrap();
        assert_eq!(bridge.members("fast").await, vec![fast]);
        bridge.disconnect(fast).await;
        assert!(started.elapsed() < Duration::from_millis(300));

        assert!(pending.await.unwrap().unwrap());
        assert_eq!(bridge.members("slow").await, vec![slow]);
    }

    #[tokio::test]
    async fn test_failed_subscribe_rolls_back_membership() {
        let broker = SlowBroker(MemoryBroker::default());
        let bridge = RealtimeBridge::new(
            "a",
            Arc::new(broker),
            Arc::new(
                AuthGate::from_config(&AuthConfig {
                    enabled: false,
                    ..Default::default()
                })
                .unwrap(),
            ),
            RealtimeConfig {
                broker_timeout: Duration::from_millis(100),
                ..RealtimeConfig::default()
            },
            CancellationToken::new(),
        );
        let (id, _rx) = bridge.register("alice");

        let err = bridge.join(id, "slow").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
        assert_eq!(bridge.room_count().await, 0);
        assert!(!bridge.leave(id, "slow").await);
    }

    #[tokio::test]
    async fn test_rejects_bad_room() {
        let bridge = bridge("a", Arc::new(MemoryBroker::default()));
        let (id, _rx) = bridge.register("alice");
        let err = bridge.join(id, "has space").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationFailed);
        assert!(bridge.publish("", "e", Value::Null, None).await.is_err());
    }
}
