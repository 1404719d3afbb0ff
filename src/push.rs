//! Push channel: per-session topic subscription on the timer's broker.
//!
//! ARCHITECTURE
//! ============
//! The supervisor sees the push channel through two small traits:
//! [`PushConnector`] performs the connect + subscribe handshake, and the
//! [`PushStream`] it returns yields raw message bodies until the
//! subscription ends. Snapshot parsing happens in the supervisor so a bad
//! body only costs that one message.
//!
//! [`StompConnector`] is the production implementation: STOMP 1.2 over a
//! websocket, subscribed to `/topic/timer/<sessionId>`.
//!
//! ERROR HANDLING
//! ==============
//! Handshake failures are returned as [`ChannelError`] and drive the
//! supervisor's backoff. Once subscribed, undecodable frames are skipped;
//! a broker `ERROR` frame, a socket error or a close ends the stream, which
//! the supervisor treats like a failed attempt.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::snapshot::SessionId;
use crate::stomp::{self, Command, Frame, StompError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("broker rejected connection: {message}")]
    Broker { message: String },
    #[error("unexpected {0} frame during handshake")]
    Handshake(&'static str),
    #[error("timed out waiting for broker")]
    Timeout,
    #[error("websocket closed during handshake")]
    Closed,
    #[error("push subscription ended")]
    Ended,
    #[error("stomp decode failed: {0}")]
    Codec(#[from] StompError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connect(Box::new(error))
    }
}

/// Topic carrying snapshots of one session.
#[must_use]
pub fn session_topic(session_id: SessionId) -> String {
    format!("/topic/timer/{session_id}")
}

/// Connect + subscribe capability of the push channel.
#[async_trait::async_trait]
pub trait PushConnector: Send + Sync {
    /// Open a connection and subscribe to the session's topic.
    ///
    /// # Errors
    ///
    /// Any [`ChannelError`]; each one counts as a failed attempt.
    async fn subscribe(&self, session_id: SessionId) -> Result<Box<dyn PushStream>, ChannelError>;
}

/// An established subscription.
#[async_trait::async_trait]
pub trait PushStream: Send {
    /// Next raw message body, or `None` once the subscription has ended.
    async fn next_message(&mut self) -> Option<String>;

    /// Unsubscribe and close the connection.
    async fn close(&mut self);
}

// =============================================================================
// STOMP OVER WEBSOCKET
// =============================================================================

pub struct StompConnector {
    ws_url: String,
    host: String,
    connect_timeout: Duration,
}

impl StompConnector {
    #[must_use]
    pub fn new(ws_url: &str, connect_timeout: Duration) -> Self {
        Self { ws_url: ws_url.to_owned(), host: host_of(ws_url).to_owned(), connect_timeout }
    }

    async fn handshake(&self, session_id: SessionId) -> Result<WsStream, ChannelError> {
        let (mut ws, _) = connect_async(self.ws_url.as_str()).await?;
        send_frame(&mut ws, &Frame::connect(&self.host)).await?;
        await_connected(&mut ws).await?;

        let subscription_id = format!("sub-{}", Uuid::new_v4());
        send_frame(&mut ws, &Frame::subscribe(&subscription_id, &session_topic(session_id))).await?;
        debug!(%session_id, %subscription_id, "stomp subscription sent");
        Ok(ws)
    }
}

#[async_trait::async_trait]
impl PushConnector for StompConnector {
    async fn subscribe(&self, session_id: SessionId) -> Result<Box<dyn PushStream>, ChannelError> {
        let ws = tokio::time::timeout(self.connect_timeout, self.handshake(session_id))
            .await
            .map_err(|_| ChannelError::Timeout)??;
        Ok(Box::new(StompStream { ws, session_id }))
    }
}

struct StompStream {
    ws: WsStream,
    session_id: SessionId,
}

#[async_trait::async_trait]
impl PushStream for StompStream {
    async fn next_message(&mut self) -> Option<String> {
        loop {
            let message = match self.ws.next().await? {
                Ok(message) => message,
                Err(error) => {
                    warn!(session_id = %self.session_id, %error, "push socket error");
                    return None;
                }
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => return None,
                _ => continue,
            };
            match stomp::decode_frame(text.as_str()) {
                Ok(Some(frame)) if frame.command == Command::Message => return Some(frame.body),
                Ok(Some(frame)) if frame.command == Command::Error => {
                    warn!(
                        session_id = %self.session_id,
                        broker_message = frame.header("message").unwrap_or(frame.body.as_str()),
                        "broker error frame"
                    );
                    return None;
                }
                Ok(_) => {}
                Err(error) => warn!(session_id = %self.session_id, %error, "discarding undecodable frame"),
            }
        }
    }

    async fn close(&mut self) {
        let _ = send_frame(&mut self.ws, &Frame::disconnect()).await;
        let _ = self.ws.close(None).await;
    }
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<(), ChannelError> {
    ws.send(Message::Text(stomp::encode_frame(frame).into())).await?;
    Ok(())
}

async fn await_connected(ws: &mut WsStream) -> Result<(), ChannelError> {
    loop {
        let Some(message) = ws.next().await else {
            return Err(ChannelError::Closed);
        };
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => return Err(ChannelError::Closed),
            _ => continue,
        };
        let Some(frame) = stomp::decode_frame(text.as_str())? else {
            continue;
        };
        return match frame.command {
            Command::Connected => Ok(()),
            Command::Error => Err(ChannelError::Broker {
                message: frame
                    .header("message")
                    .unwrap_or(frame.body.as_str())
                    .to_owned(),
            }),
            other => Err(ChannelError::Handshake(other.as_str())),
        };
    }
}

/// `host[:port]` part of a websocket URL, used for the STOMP `host` header.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?']).next().unwrap_or(rest)
}

#[cfg(test)]
#[path = "push_test.rs"]
mod tests;
