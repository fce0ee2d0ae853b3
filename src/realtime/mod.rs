//! Realtime rooms over WebSocket
//!
//! Connection lifecycle: `Connecting -> Authenticated -> Joined(room)* -> Closed`.
//! Room events cross instances only through the shared [`Broker`].

mod bridge;
mod broker;
mod protocol;
mod session;

pub use bridge::{ConnectionId, RealtimeBridge};
pub use broker::{Broker, EventStream, MemoryBroker, RedisBroker, RoomEvent};
pub use protocol::{ClientMessage, MAX_ROOM_LEN, ServerMessage, validate_room};
pub use session::{CLOSE_GOING_AWAY, CLOSE_UNAUTHORIZED};
