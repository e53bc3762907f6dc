//! In-memory duplex connections.
//!
//! [`pair`] returns the server side of a connection together with a
//! [`MemoryPeer`] that plays the client. Used by tests and benchmarks to drive
//! sessions without sockets.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, TransportError};

enum Inbound {
    Text(String),
    Fail(String),
}

/// Server side of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<String>,
    is_open: bool,
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<String>,
}

/// Create a connected in-memory pair.
#[must_use]
pub fn pair(id: impl Into<ConnectionId>) -> (MemoryConnection, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let connection = MemoryConnection {
        id: id.into(),
        inbound: inbound_rx,
        outbound: outbound_tx,
        is_open: true,
    };
    let peer = MemoryPeer {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
    };

    (connection, peer)
}

impl MemoryPeer {
    /// Send a text message to the server side.
    ///
    /// Returns `false` if the peer already disconnected or the server side is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Inbound::Text(text.into())).is_ok())
    }

    /// Wait for the next message relayed to this peer.
    ///
    /// Returns `None` once the server side has been dropped.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Wait up to `timeout` for the next relayed message.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Take a relayed message if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Close the client side cleanly; the server side sees end of stream.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Break the transport; the server side sees a receive error.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if let Some(tx) = self.inbound.take() {
            let _ = tx.send(Inbound::Fail(reason.into()));
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        if !self.is_open {
            return Ok(None);
        }

        match self.inbound.recv().await {
            Some(Inbound::Text(text)) => Ok(Some(text)),
            Some(Inbound::Fail(reason)) => {
                self.is_open = false;
                Err(TransportError::ReceiveFailed(reason))
            }
            None => {
                self.is_open = false;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        self.outbound
            .send(text)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        self.inbound.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_duplex() {
        let (mut conn, mut peer) = pair("conn-1");
        assert_eq!(conn.id().as_str(), "conn-1");

        assert!(peer.send("ping"));
        assert_eq!(conn.recv().await.unwrap(), Some("ping".to_string()));

        conn.send("pong".to_string()).await.unwrap();
        assert_eq!(peer.recv().await, Some("pong".to_string()));
    }

    #[tokio::test]
    async fn test_memory_peer_disconnect() {
        let (mut conn, mut peer) = pair("conn-1");
        peer.disconnect();

        assert_eq!(conn.recv().await.unwrap(), None);
        assert!(!conn.is_open());
        assert!(!peer.send("late"));
    }

    #[tokio::test]
    async fn test_memory_peer_fail() {
        let (mut conn, mut peer) = pair("conn-1");
        peer.fail("reset by peer");

        assert!(matches!(
            conn.recv().await,
            Err(TransportError::ReceiveFailed(reason)) if reason == "reset by peer"
        ));
        assert!(matches!(
            conn.send("x".to_string()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_memory_close_is_idempotent() {
        let (mut conn, _peer) = pair("conn-1");
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(!conn.is_open());
        assert_eq!(conn.recv().await.unwrap(), None);
    }
}
