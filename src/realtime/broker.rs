//! Shared event broker
//!
//! Every gateway instance publishes room events to the broker and subscribes
//! to the rooms it has local members in. Delivery to members is the bridge's
//! job; the broker only moves [`RoomEvent`]s between instances.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use crate::Result;

/// Event published to a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    /// Room id
    pub room: String,
    /// Event name
    pub event: String,
    /// Payload
    pub data: Value,
    /// Subject of the publisher
    #[serde(default)]
    pub sender: Option<String>,
    /// Instance that published the event
    pub origin: String,
}

/// Stream of events for one room subscription
pub type EventStream = BoxStream<'static, RoomEvent>;

/// Cross-instance pub/sub
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish an event to every subscriber of `room`, on any instance
    async fn publish(&self, room: &str, event: &RoomEvent) -> Result<()>;

    /// Subscribe to `room`. Dropping the stream ends the subscription.
    async fn subscribe(&self, room: &str) -> Result<EventStream>;
}

/// In-process broker. Instances sharing one `MemoryBroker` (an `Arc`) behave
/// as a fleet; a lone instance gets single-node rooms.
#[derive(Debug)]
pub struct MemoryBroker {
    channels: Channels,
    capacity: usize,
}

type Channels = Arc<DashMap<String, broadcast::Sender<RoomEvent>>>;

impl MemoryBroker {
    /// Create a broker buffering up to `capacity` events per room
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Rooms that currently have a channel
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, room: &str, event: &RoomEvent) -> Result<()> {
        let delivered = self
            .channels
            .get(room)
            .map(|tx| tx.send(event.clone()).is_ok());
        if delivered == Some(false) {
            // Every subscriber is gone
            self.channels.remove_if(room, |_, tx| tx.receiver_count() == 0);
        }
        Ok(())
    }

    async fn subscribe(&self, room: &str) -> Result<EventStream> {
        let rx = self
            .channels
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        let name = room.to_string();
        let inner = BroadcastStream::new(rx)
            .filter_map(move |item| {
                let room = name.clone();
                async move {
                    match item {
                        Ok(event) => Some(event),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            warn!(room = %room, skipped, "Room subscriber lagged; events dropped");
                            None
                        }
                    }
                }
            })
            .boxed();
        Ok(RoomStream {
            inner,
            _guard: ChannelGuard {
                channels: Arc::clone(&self.channels),
                room: room.to_string(),
            },
        }
        .boxed())
    }
}

/// Memory subscription. `inner` is declared first so its receiver is gone
/// before the guard checks for remaining subscribers.
struct RoomStream {
    inner: EventStream,
    _guard: ChannelGuard,
}

impl Stream for RoomStream {
    type Item = RoomEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Removes the room's channel once its last subscriber is dropped
struct ChannelGuard {
    channels: Channels,
    room: String,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if self
            .channels
            .remove_if(&self.room, |_, tx| tx.receiver_count() == 0)
            .is_some()
        {
            debug!(room = %self.room, "Dropped idle room channel");
        }
    }
}

/// Redis pub/sub broker. Room `r` maps to channel `<prefix>r`.
pub struct RedisBroker {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
    prefix: String,
}

impl RedisBroker {
    /// Connect the shared publish connection
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or Redis is unreachable.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        info!(prefix = %prefix, "Connected to Redis broker");
        Ok(Self {
            client,
            publisher,
            prefix: prefix.to_string(),
        })
    }

    fn channel(&self, room: &str) -> String {
        format!("{}{room}", self.prefix)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, room: &str, event: &RoomEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(self.channel(room), payload).await?;
        debug!(room = %room, receivers, "Published room event");
        Ok(())
    }

    /// Opens a dedicated pub/sub connection for the room; dropping the stream
    /// closes it.
    async fn subscribe(&self, room: &str) -> Result<EventStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel(room)).await?;
        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Unreadable broker payload");
                        return None;
                    }
                };
                match serde_json::from_str::<RoomEvent>(&payload) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(error = %e, "Malformed room event on broker");
                        None
                    }
                }
            })
            .boxed())
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
