//! Member handles for connections.
//!
//! A [`ConnectionHandle`] is what the registry stores for a member: the
//! connection's identity, its lifecycle state and the sending half of its
//! outbound queue. The transport itself stays owned by the session; dropping
//! a handle never tears a connection down.

use crate::message::Message;
use huddle_transport::ConnectionId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Receiving half of a connection's outbound queue, drained by its session.
pub type Outbox = mpsc::Receiver<Arc<Message>>;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted, not yet a member of a group.
    Connecting = 0,
    /// Joined and relaying.
    Active = 1,
    /// Terminal.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

/// Why a single delivery did not reach its recipient.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The recipient is closed or its session has gone away.
    #[error("Recipient closed")]
    Closed,

    /// The recipient's queue stayed full for the whole send timeout.
    #[error("Send timed out")]
    TimedOut,
}

struct Shared {
    id: ConnectionId,
    state: AtomicU8,
    outbox: mpsc::Sender<Arc<Message>>,
    closed: Notify,
}

/// Cheaply cloneable handle to a connection.
///
/// Equality and hashing use the connection ID only.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Shared>,
}

impl ConnectionHandle {
    /// Create a handle in the `Connecting` state with an outbound queue of
    /// `capacity` messages.
    #[must_use]
    pub fn new(id: ConnectionId, capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            inner: Arc::new(Shared {
                id,
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                outbox: tx,
                closed: Notify::new(),
            }),
        };
        (handle, rx)
    }

    /// Get the connection's ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Check if the connection is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Check if the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Move from `Connecting` to `Active`.
    ///
    /// Returns `false` if the connection is closed.
    pub(crate) fn activate(&self) -> bool {
        match self.inner.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == ConnectionState::Active as u8,
        }
    }

    /// Move to `Closed` and wake the owning session.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn close(&self) -> bool {
        let previous = self
            .inner
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return false;
        }
        self.inner.closed.notify_waiters();
        true
    }

    /// Resolve once the connection is closed.
    pub async fn closed(&self) {
        loop {
            // Registered before the state check so a concurrent close is not missed.
            let notified = self.inner.closed.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Queue a message for this connection, waiting at most `timeout` for room.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryFailure::Closed`] if the connection is closed and
    /// [`DeliveryFailure::TimedOut`] if its queue stayed full.
    pub async fn deliver(
        &self,
        message: Arc<Message>,
        timeout: Duration,
    ) -> Result<(), DeliveryFailure> {
        if self.is_closed() {
            return Err(DeliveryFailure::Closed);
        }

        self.inner
            .outbox
            .send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => DeliveryFailure::TimedOut,
                mpsc::error::SendTimeoutError::Closed(_) => DeliveryFailure::Closed,
            })
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
