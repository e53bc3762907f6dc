//! WebSocket connection adapter.
//!
//! Wraps an upgraded axum [`WebSocket`] so the relay can drive it through the
//! [`Connection`] trait.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, TransportError};

/// A WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
}

impl WebSocketConnection {
    /// Wrap an upgraded WebSocket, assigning it a fresh connection ID.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
            is_open: true,
        }
    }

    /// Record the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => {
                        warn!(connection = %self.id, "Dropping non UTF-8 binary frame");
                    }
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // axum answers pings itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }

        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
