//! Push stream transport.
//!
//! The synchronizer talks to the stream through [`StreamConnector`] and
//! [`StreamConnection`]; [`WsConnector`] is the WebSocket implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use hubsync_core::{Error, Result};

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Transport-level keepalive; carries no event but proves liveness.
    Heartbeat,
}

/// An open stream connection.
#[async_trait]
pub trait StreamConnection: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next inbound frame; `None` once the peer closed the connection.
    /// Must be cancel safe.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    async fn close(&mut self);
}

/// Opens stream connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>>;
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>> {
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| Error::timeout(format!("connecting to {}", url)))?
            .map_err(|e| Error::transport(format!("connecting to {}: {}", url, e)))?;
        debug!(category = "sync", url, "Stream connected");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(Error::transport(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text))),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => {
                        debug!(category = "sync", "Skipping non UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Ping(_) | Message::Pong(_) => return Some(Ok(Frame::Heartbeat)),
                Message::Close(frame) => {
                    debug!(category = "sync", ?frame, "Stream closed by peer");
                    return None;
                }
                Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
