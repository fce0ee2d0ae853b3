//! Per-connection WebSocket session

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::bridge::{ConnectionId, RealtimeBridge};
use super::protocol::{ClientMessage, ServerMessage};
use crate::failsafe::MessageQuota;
use crate::gateway::auth::Principal;

/// Close code sent when the handshake credential is missing or invalid
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
/// Close code sent when the gateway shuts down
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Subject used when credentials are not enforced
const ANONYMOUS: &str = "anonymous";

type Sink = SplitSink<WebSocket, Message>;
type Source = SplitStream<WebSocket>;

impl RealtimeBridge {
    /// Drive one upgraded connection until it closes.
    ///
    /// `principal` is set when the upgrade request carried a verified `token`
    /// query parameter. Otherwise, with auth enabled, the first frame must be
    /// `{"type":"auth","token":...}` within the handshake timeout.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, principal: Option<Principal>) {
        let (mut sink, mut source) = socket.split();

        let subject = match principal {
            Some(p) => p.subject().to_string(),
            None if !self.auth.is_enabled() => ANONYMOUS.to_string(),
            None => match self.handshake(&mut source).await {
                Ok(p) => p.subject().to_string(),
                Err(reason) => {
                    debug!(reason = %reason, "Realtime handshake rejected");
                    let _ = send(&mut sink, &ServerMessage::error("UNAUTHORIZED", "Unauthorized")).await;
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_UNAUTHORIZED,
                            reason: "unauthorized".into(),
                        })))
                        .await;
                    return;
                }
            },
        };

        let (id, mut outbound) = self.register(&subject);
        info!(connection = %id, subject = %subject, "Realtime connection opened");

        let authenticated = ServerMessage::Authenticated {
            connection_id: id.to_string(),
            subject: subject.clone(),
        };
        if send(&mut sink, &authenticated).await.is_err() {
            self.disconnect(id).await;
            return;
        }

        let quota = MessageQuota::per_second(self.settings.max_messages_per_second);
        let mut ping = interval(self.settings.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.tick().await;
        let shutdown = self.shutdown_token().clone();

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_GOING_AWAY,
                            reason: "gateway shutting down".into(),
                        })))
                        .await;
                    break;
                }

                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if send(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }

                incoming = source.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(connection = %id, error = %e, "WebSocket read failed");
                            break;
                        }
                    };

                    if !quota.try_acquire() {
                        telemetry_metrics::counter!("gateway_realtime_throttled_total").increment(1);
                        if send(&mut sink, &ServerMessage::error("THROTTLED", "Too many messages")).await.is_err() {
                            break;
                        }
                        continue;
                    }

                    if let Some(reply) = self.handle_frame(id, &subject, &text).await {
                        if send(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                }

                _ = ping.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.disconnect(id).await;
        info!(connection = %id, "Realtime connection closed");
    }

    /// Wait for the first `auth` frame
    async fn handshake(&self, source: &mut Source) -> Result<Principal, String> {
        let timeout = self.settings.handshake_timeout;
        let token = tokio::time::timeout(timeout, first_credential(source))
            .await
            .map_err(|_| format!("no auth frame within {}ms", timeout.as_millis()))??;
        self.auth
            .authenticate(Some(&token))
            .map_err(|e| e.detail().unwrap_or("invalid credential").to_string())
    }

    async fn handle_frame(&self, id: ConnectionId, subject: &str, text: &str) -> Option<ServerMessage> {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection = %id, error = %e, "Unparseable realtime frame");
                return Some(ServerMessage::error("INVALID_MESSAGE", "Unrecognised message"));
            }
        };

        match message {
            ClientMessage::Join { room } => Some(match self.join(id, &room).await {
                Ok(_) => ServerMessage::Joined { room },
                Err(e) => frame_for(&e),
            }),
            ClientMessage::Leave { room } => {
                self.leave(id, &room).await;
                Some(ServerMessage::Left { room })
            }
            ClientMessage::Emit { room, event, data } => self
                .publish(&room, &event, data, Some(subject))
                .await
                .err()
                .map(|e| frame_for(&e)),
            ClientMessage::Ping => Some(ServerMessage::Pong),
            ClientMessage::Auth { .. } => Some(ServerMessage::error(
                "ALREADY_AUTHENTICATED",
                "Connection is already authenticated",
            )),
        }
    }
}

async fn first_credential(source: &mut Source) -> Result<String, String> {
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return Err("closed during handshake".to_string()),
            Err(e) => return Err(e.to_string()),
        };
        return match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Auth { token }) => Ok(token),
            Ok(_) => Err("first frame was not auth".to_string()),
            Err(e) => Err(format!("malformed auth frame: {e}")),
        };
    }
    Err("closed during handshake".to_string())
}

fn frame_for(error: &crate::GatewayError) -> ServerMessage {
    if error.kind() == crate::ErrorKind::Internal {
        warn!(error = %error, "Realtime operation failed");
    }
    ServerMessage::error(error.kind().code(), error.public_message())
}

async fn send(sink: &mut Sink, frame: &ServerMessage) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to encode realtime frame");
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await
}
