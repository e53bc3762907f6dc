//! Connection abstraction traits for Huddle.
//!
//! A [`Connection`] is one client's persistent duplex channel. The relay only
//! ever sees UTF-8 text messages; framing is left to the underlying transport.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Per-process counter so generated ids never collide, even within one nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// An active duplex connection to a single client.
///
/// Implementations must make [`Connection::recv`] cancel-safe: the session
/// races it against outbound deliveries and close requests, and a dropped
/// `recv` future must not lose a message that was already read.
#[async_trait]
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next text message from the connection.
    ///
    /// Returns `None` if the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Send a text message to the connection.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection. Closing an already closed connection is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_ids_unique_in_tight_loop() {
        let ids: HashSet<_> = (0..1_000).map(|_| ConnectionId::generate()).collect();
        assert_eq!(ids.len(), 1_000);
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
        assert_eq!(id.to_string(), "test-id");
    }

    #[test]
    fn test_transport_error_messages() {
        assert_eq!(TransportError::ConnectionClosed.to_string(), "Connection closed");
        assert_eq!(
            TransportError::SendFailed("broken pipe".into()).to_string(),
            "Send failed: broken pipe"
        );
        assert_eq!(
            TransportError::ReceiveFailed("reset".into()).to_string(),
            "Receive failed: reset"
        );
        assert_eq!(TransportError::Other("odd".into()).to_string(), "odd");
    }
}
