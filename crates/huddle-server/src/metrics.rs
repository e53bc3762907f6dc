//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use huddle_core::GroupRegistry;
use huddle_transport::{Connection, ConnectionId, TransportError};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// How often registry gauges are refreshed.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const MESSAGES_TOTAL: &str = "huddle_messages_total";
    pub const MESSAGES_BYTES: &str = "huddle_messages_bytes";
    pub const GROUPS_ACTIVE: &str = "huddle_groups_active";
    pub const SESSIONS_CLOSED_TOTAL: &str = "huddle_sessions_closed_total";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
}

/// Describe every metric to the current recorder.
///
/// Descriptions sent before a recorder is installed are lost.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages relayed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages relayed");
    metrics::describe_gauge!(names::GROUPS_ACTIVE, "Current number of groups");
    metrics::describe_counter!(
        names::SESSIONS_CLOSED_TOTAL,
        "Sessions closed, by reason"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Install the Prometheus recorder with its HTTP listener, then describe
/// every metric against it.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    init_metrics();

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Update the group count.
pub fn set_active_groups(count: usize) {
    gauge!(names::GROUPS_ACTIVE).set(count as f64);
}

/// Refresh the registry gauges from a registry.
pub fn record_registry_stats(registry: &GroupRegistry) {
    set_active_groups(registry.stats().group_count);
}

/// Refresh the registry gauges every `period` until the task is aborted.
///
/// Groups are created by joins deep inside sessions, so the gauge is sampled
/// instead of being updated at each join.
pub fn spawn_registry_sampler(registry: Arc<GroupRegistry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            record_registry_stats(&registry);
        }
    })
}

/// Record a closed session.
pub fn record_session_closed(reason: &'static str) {
    counter!(names::SESSIONS_CLOSED_TOTAL, "reason" => reason).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// A connection wrapper that counts traffic in both directions.
pub struct MeteredConnection<C> {
    inner: C,
}

impl<C: Connection> MeteredConnection<C> {
    /// Wrap a connection.
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: Connection> Connection for MeteredConnection<C> {
    fn id(&self) -> &ConnectionId {
        self.inner.id()
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        let result = self.inner.recv().await;
        match &result {
            Ok(Some(text)) => record_message(text.len(), "inbound"),
            Ok(None) => {}
            Err(_) => record_error("transport_receive"),
        }
        result
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let bytes = text.len();
        let result = self.inner.send(text).await;
        match &result {
            Ok(()) => record_message(bytes, "outbound"),
            Err(_) => record_error("transport_send"),
        }
        result
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    fn remote_addr(&self) -> Option<String> {
        self.inner.remote_addr()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}
