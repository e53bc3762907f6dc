//! Connection lifecycle.
//!
//! A [`Session`] drives one connection through join, the relay loop and
//! leave. It owns the transport for its whole life; the registry only ever
//! sees the session's [`ConnectionHandle`].
//!
//! The outbox is drained for as long as the session is active, including
//! while the session waits on its own broadcast. Every transport write is
//! bounded by the write timeout and raced against a close request.

use crate::connection::{ConnectionHandle, ConnectionState, Outbox};
use crate::group::GroupId;
use crate::registry::{GroupRegistry, RegistryError};
use crate::router::BroadcastRouter;
use huddle_transport::{Connection, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the per-connection outbound queue.
    pub outbox_capacity: usize,
    /// Upper bound on a single write to the transport.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a session ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The join was refused; the session never became active.
    Rejected(RegistryError),
    /// The peer closed the connection.
    PeerClosed,
    /// The transport failed.
    Transport(TransportError),
    /// A write to the transport did not finish within the write timeout.
    WriteTimeout,
    /// The connection was closed through its handle.
    Shutdown,
}

impl CloseReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::PeerClosed => "peer_closed",
            Self::Transport(_) => "transport_error",
            Self::WriteTimeout => "write_timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// One connection's relay session.
pub struct Session<C: Connection> {
    connection: C,
    group_id: GroupId,
    handle: ConnectionHandle,
    outbox: Outbox,
    registry: Arc<GroupRegistry>,
    router: Arc<BroadcastRouter>,
    write_timeout: Duration,
    joined: bool,
}

impl<C: Connection> Session<C> {
    /// Create a session for an accepted connection targeting `group_id`.
    ///
    /// The session starts in the `Connecting` state.
    #[must_use]
    pub fn new(
        connection: C,
        group_id: impl Into<GroupId>,
        router: Arc<BroadcastRouter>,
        config: &SessionConfig,
    ) -> Self {
        let (handle, outbox) =
            ConnectionHandle::new(connection.id().clone(), config.outbox_capacity);
        Self {
            connection,
            group_id: group_id.into(),
            handle,
            outbox,
            registry: Arc::clone(router.registry()),
            router,
            write_timeout: config.write_timeout,
            joined: false,
        }
    }

    /// Get the handle other components use to reach this session.
    #[must_use]
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Get the group this session targets.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Run the session to completion.
    pub async fn run(mut self) -> CloseReason {
        if let Err(e) = self.registry.join(&self.group_id, &self.handle) {
            warn!(
                connection = %self.handle.id(),
                group = %self.group_id,
                error = %e,
                "Join rejected"
            );
            self.handle.close();
            self.close_transport().await;
            return CloseReason::Rejected(e);
        }
        self.joined = true;

        info!(
            connection = %self.handle.id(),
            group = %self.group_id,
            remote = ?self.connection.remote_addr(),
            "Session active"
        );

        let reason = self.relay().await;

        self.release();
        self.close_transport().await;

        info!(
            connection = %self.handle.id(),
            group = %self.group_id,
            reason = reason.as_str(),
            "Session closed"
        );

        reason
    }

    async fn relay(&mut self) -> CloseReason {
        loop {
            tokio::select! {
                biased;

                _ = self.handle.closed() => {
                    debug!(connection = %self.handle.id(), "Close requested");
                    return CloseReason::Shutdown;
                }

                Some(message) = self.outbox.recv() => {
                    let written = write(
                        &mut self.connection,
                        &self.handle,
                        message.text.clone(),
                        self.write_timeout,
                    )
                    .await;
                    if let Err(reason) = written {
                        return reason;
                    }
                }

                inbound = self.connection.recv() => match inbound {
                    Ok(Some(text)) => {
                        if let Err(reason) = self.broadcast(&text).await {
                            return reason;
                        }
                    }
                    Ok(None) => {
                        debug!(connection = %self.handle.id(), "Peer closed");
                        return CloseReason::PeerClosed;
                    }
                    Err(e) => {
                        warn!(connection = %self.handle.id(), error = %e, "Transport error");
                        return CloseReason::Transport(e);
                    }
                },
            }
        }
    }

    /// Fan `text` out to the group while still draining this session's outbox.
    ///
    /// Inbound frames are not read until the broadcast finishes, so one
    /// sender's messages reach each recipient in order.
    async fn broadcast(&mut self, text: &str) -> Result<(), CloseReason> {
        let broadcast = self.router.broadcast(&self.group_id, &self.handle, text);
        tokio::pin!(broadcast);

        loop {
            tokio::select! {
                biased;

                _ = self.handle.closed() => {
                    debug!(connection = %self.handle.id(), "Close requested during broadcast");
                    return Err(CloseReason::Shutdown);
                }

                report = &mut broadcast => {
                    trace!(
                        connection = %self.handle.id(),
                        group = %self.group_id,
                        delivered = report.delivered_count(),
                        failed = report.failed_count(),
                        "Relayed"
                    );
                    return Ok(());
                }

                Some(message) = self.outbox.recv() => {
                    write(
                        &mut self.connection,
                        &self.handle,
                        message.text.clone(),
                        self.write_timeout,
                    )
                    .await?;
                }
            }
        }
    }

    /// Mark the connection closed and leave the group, at most once.
    fn release(&mut self) {
        self.handle.close();
        if std::mem::take(&mut self.joined) {
            self.registry.leave(&self.group_id, &self.handle);
        }
    }

    async fn close_transport(&mut self) {
        match tokio::time::timeout(self.write_timeout, self.connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection = %self.handle.id(), error = %e, "Close failed"),
            Err(_) => debug!(connection = %self.handle.id(), "Close timed out"),
        }
    }
}

/// Write one message to the transport.
///
/// Gives up when the handle is closed or the write outlasts `limit`.
async fn write<C: Connection>(
    connection: &mut C,
    handle: &ConnectionHandle,
    text: String,
    limit: Duration,
) -> Result<(), CloseReason> {
    tokio::select! {
        biased;

        _ = handle.closed() => {
            debug!(connection = %handle.id(), "Close requested during write");
            Err(CloseReason::Shutdown)
        }

        written = tokio::time::timeout(limit, connection.send(text)) => match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(connection = %handle.id(), error = %e, "Send failed");
                Err(CloseReason::Transport(e))
            }
            Err(_) => {
                warn!(connection = %handle.id(), timeout = ?limit, "Write timed out");
                Err(CloseReason::WriteTimeout)
            }
        },
    }
}

impl<C: Connection> Drop for Session<C> {
    fn drop(&mut self) {
        // Covers sessions whose task was cancelled mid-run.
        self.release();
    }
}
