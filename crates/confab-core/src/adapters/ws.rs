//! WebSocket transport adapter, backed by tokio-tungstenite.
//!
//! Implements the [`Dialer`]/[`MessageSocket`] ports so everything above
//! this file stays testable with in-memory sockets.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::application::ports::{Dialer, MessageSocket, SocketMessage};

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

/// Opens `ws://` / `wss://` connections.
#[derive(Debug, Default)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> anyhow::Result<Box<dyn MessageSocket>> {
        let (stream, response) = connect_async(url).await?;
        debug!(url, status = ?response.status(), "websocket connected");
        Ok(Box::new(WsSocket { stream }))
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

pub struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl MessageSocket for WsSocket {
    async fn send(&mut self, msg: SocketMessage) -> anyhow::Result<()> {
        let msg = match msg {
            SocketMessage::Text(text) => Message::Text(text),
            SocketMessage::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.stream.send(msg).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<anyhow::Result<SocketMessage>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(SocketMessage::Text(text))),
                Ok(Message::Binary(data)) => {
                    return Some(Ok(SocketMessage::Binary(Bytes::from(data))))
                }
                // Transport-level keepalive, distinct from the
                // application-level ping the links answer themselves.
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.stream.send(Message::Pong(payload)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket closed by peer");
                    return None;
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
