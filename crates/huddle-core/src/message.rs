//! The relayed message type.

use huddle_transport::ConnectionId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A message being fanned out to a group.
///
/// One instance is shared by `Arc` across every recipient of a broadcast.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Connection that sent the message.
    pub source: ConnectionId,
    /// Group the message was sent to.
    pub group: String,
    /// Text forwarded to recipients.
    pub text: String,
    /// Milliseconds since the Unix epoch when the message was accepted.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(group: impl Into<String>, source: ConnectionId, text: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            source,
            group: group.into(),
            text: text.into(),
            timestamp: now_millis(),
        }
    }

    /// Get the text size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Check whether the text is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}
