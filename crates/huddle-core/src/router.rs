//! Broadcast router for Huddle.
//!
//! The router fans a message out to every other member of the sender's
//! group. Membership comes from a registry snapshot taken once per
//! broadcast, so members joining or leaving mid-flight never disturb it.

use crate::connection::{ConnectionHandle, DeliveryFailure};
use crate::message::Message;
use crate::registry::GroupRegistry;
use futures_util::future::join_all;
use huddle_transport::ConnectionId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Upper bound on how long one recipient may hold up a broadcast.
    pub send_timeout: Duration,
    /// Forward text as `"<group>: <text>"` instead of verbatim.
    pub prefix_group_id: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(1),
            prefix_group_id: false,
        }
    }
}

/// A recipient that did not receive a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    /// The recipient.
    pub connection: ConnectionId,
    /// Why delivery failed.
    pub reason: DeliveryFailure,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Recipients that accepted the message.
    pub delivered: Vec<ConnectionId>,
    /// Recipients that did not.
    pub failed: Vec<FailedDelivery>,
}

impl DeliveryReport {
    /// Number of successful deliveries.
    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    /// Number of failed deliveries.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Number of recipients the broadcast was attempted for.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// Fans messages out to group members.
pub struct BroadcastRouter {
    registry: Arc<GroupRegistry>,
    config: RouterConfig,
}

impl BroadcastRouter {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new(registry: Arc<GroupRegistry>) -> Self {
        Self::with_config(registry, RouterConfig::default())
    }

    /// Create a router with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<GroupRegistry>, config: RouterConfig) -> Self {
        Self { registry, config }
    }

    /// Get the registry this router reads membership from.
    #[must_use]
    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    /// Get the router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Deliver `text` to every member of `group_id` except `origin`.
    ///
    /// Recipients are sent to concurrently, each bounded by the configured
    /// send timeout. Failures are recorded in the report and never returned
    /// as errors.
    pub async fn broadcast(
        &self,
        group_id: &str,
        origin: &ConnectionHandle,
        text: &str,
    ) -> DeliveryReport {
        let recipients: Vec<ConnectionHandle> = self
            .registry
            .snapshot(group_id)
            .into_iter()
            .filter(|member| member.id() != origin.id())
            .collect();

        if recipients.is_empty() {
            trace!(group = %group_id, connection = %origin.id(), "No recipients");
            return DeliveryReport::default();
        }

        let text = if self.config.prefix_group_id {
            format!("{}: {}", group_id, text)
        } else {
            text.to_string()
        };
        let message = Arc::new(Message::new(group_id, origin.id().clone(), text));
        let timeout = self.config.send_timeout;

        let outcomes = join_all(recipients.iter().map(|recipient| {
            let message = Arc::clone(&message);
            async move { recipient.deliver(message, timeout).await }
        }))
        .await;

        let mut report = DeliveryReport::default();
        for (recipient, outcome) in recipients.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered.push(recipient.id().clone()),
                Err(reason) => {
                    match reason {
                        DeliveryFailure::TimedOut => warn!(
                            group = %group_id,
                            recipient = %recipient.id(),
                            "Delivery timed out"
                        ),
                        DeliveryFailure::Closed => debug!(
                            group = %group_id,
                            recipient = %recipient.id(),
                            "Recipient closed during delivery"
                        ),
                    }
                    report.failed.push(FailedDelivery {
                        connection: recipient.id().clone(),
                        reason,
                    });
                }
            }
        }

        trace!(
            group = %group_id,
            connection = %origin.id(),
            message = message.id,
            delivered = report.delivered_count(),
            failed = report.failed_count(),
            "Broadcast"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbox;
    use std::collections::HashSet;
    use tokio::time::Instant;

    fn member(registry: &GroupRegistry, group: &str, id: &str) -> (ConnectionHandle, Outbox) {
        let (handle, outbox) = ConnectionHandle::new(id.into(), 16);
        registry.join(group, &handle).unwrap();
        (handle, outbox)
    }

    fn setup() -> (Arc<GroupRegistry>, BroadcastRouter) {
        let registry = Arc::new(GroupRegistry::new());
        let router = BroadcastRouter::new(Arc::clone(&registry));
        (registry, router)
    }

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let (registry, router) = setup();
        let (c1, mut rx1) = member(&registry, "g1", "conn-1");
        let (_c2, mut rx2) = member(&registry, "g1", "conn-2");

        let report = router.broadcast("g1", &c1, "hello").await;

        assert_eq!(report.delivered, vec![ConnectionId::from("conn-2")]);
        assert!(report.failed.is_empty());
        assert_eq!(rx2.try_recv().unwrap().text, "hello");
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_group_isolation() {
        let (registry, router) = setup();
        let (c1, _rx1) = member(&registry, "g1", "conn-1");
        let (_c2, mut rx2) = member(&registry, "g2", "conn-2");

        let report = router.broadcast("g1", &c1, "x").await;

        assert_eq!(report.attempted(), 0);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_after_member_left() {
        let (registry, router) = setup();
        let (c1, _rx1) = member(&registry, "g1", "conn-1");
        let (c2, mut rx2) = member(&registry, "g1", "conn-2");
        let (_c3, mut rx3) = member(&registry, "g1", "conn-3");

        c2.close();
        registry.leave("g1", &c2);

        let report = router.broadcast("g1", &c1, "m").await;

        assert_eq!(report.delivered, vec![ConnectionId::from("conn-3")]);
        assert_eq!(rx3.try_recv().unwrap().text, "m");
        assert!(rx2.try_recv().is_err());
        assert!(registry
            .snapshot("g1")
            .iter()
            .all(|c| c.id().as_str() != "conn-2"));
    }

    #[tokio::test]
    async fn test_broadcast_fresh_group_has_no_recipients() {
        let (registry, router) = setup();
        let (c1, _rx1) = member(&registry, "fresh", "conn-1");

        let report = router.broadcast("fresh", &c1, "anyone?").await;

        assert_eq!(report, DeliveryReport::default());
        assert_eq!(report.delivered_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_unknown_group() {
        let (_registry, router) = setup();
        let (origin, _rx) = ConnectionHandle::new("conn-1".into(), 1);

        let report = router.broadcast("nowhere", &origin, "x").await;
        assert_eq!(report.attempted(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_records_closed_recipient() {
        let (registry, router) = setup();
        let (c1, _rx1) = member(&registry, "g1", "conn-1");
        let (_c2, rx2) = member(&registry, "g1", "conn-2");
        let (_c3, mut rx3) = member(&registry, "g1", "conn-3");

        // Session gone but not yet deregistered.
        drop(rx2);

        let report = router.broadcast("g1", &c1, "still here").await;

        assert_eq!(report.delivered, vec![ConnectionId::from("conn-3")]);
        assert_eq!(
            report.failed,
            vec![FailedDelivery {
                connection: "conn-2".into(),
                reason: DeliveryFailure::Closed,
            }]
        );
        assert_eq!(rx3.try_recv().unwrap().text, "still here");
    }

    #[tokio::test]
    async fn test_broadcast_prefix_group_id() {
        let registry = Arc::new(GroupRegistry::new());
        let router = BroadcastRouter::with_config(
            Arc::clone(&registry),
            RouterConfig {
                prefix_group_id: true,
                ..Default::default()
            },
        );
        let (c1, _rx1) = member(&registry, "g1", "conn-1");
        let (_c2, mut rx2) = member(&registry, "g1", "conn-2");

        router.broadcast("g1", &c1, "hello").await;

        let message = rx2.try_recv().unwrap();
        assert_eq!(message.text, "g1: hello");
        assert_eq!(message.source.as_str(), "conn-1");
        assert_eq!(message.group, "g1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_recipient_is_isolated() {
        let registry = Arc::new(GroupRegistry::new());
        let timeout = Duration::from_millis(200);
        let router = BroadcastRouter::with_config(
            Arc::clone(&registry),
            RouterConfig {
                send_timeout: timeout,
                ..Default::default()
            },
        );

        let (c1, _rx1) = member(&registry, "g1", "sender");
        let (stalled, _stalled_rx) = ConnectionHandle::new("stalled".into(), 1);
        registry.join("g1", &stalled).unwrap();
        let mut healthy: Vec<_> = (0..5)
            .map(|i| member(&registry, "g1", &format!("healthy-{i}")))
            .collect();

        // Fill the stalled recipient's queue; nobody drains it.
        router.broadcast("g1", &c1, "first").await;
        for (_, rx) in &mut healthy {
            rx.try_recv().unwrap();
        }

        let start = Instant::now();
        let report = router.broadcast("g1", &c1, "second").await;
        let elapsed = start.elapsed();

        assert!(elapsed >= timeout);
        assert!(elapsed < timeout * 2);
        assert_eq!(report.delivered_count(), 5);
        assert_eq!(
            report.failed,
            vec![FailedDelivery {
                connection: "stalled".into(),
                reason: DeliveryFailure::TimedOut,
            }]
        );
        for (_, rx) in &mut healthy {
            assert_eq!(rx.try_recv().unwrap().text, "second");
        }
        // A timeout does not revoke membership.
        assert!(stalled.is_active());
        assert_eq!(registry.member_count("g1"), 7);
    }

    #[tokio::test]
    async fn test_single_sender_fifo() {
        let (registry, router) = setup();
        let (c1, _rx1) = member(&registry, "g1", "conn-1");
        let (_c2, mut rx2) = member(&registry, "g1", "conn-2");

        for i in 0..10 {
            router.broadcast("g1", &c1, &format!("m{i}")).await;
        }

        for i in 0..10 {
            assert_eq!(rx2.recv().await.unwrap().text, format!("m{i}"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_then_broadcast() {
        let (registry, router) = setup();

        let joins: Vec<_> = (0..100)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let (handle, outbox) = ConnectionHandle::new(format!("conn-{i}").into(), 4);
                    registry.join("load", &handle).unwrap();
                    (handle, outbox)
                })
            })
            .collect();

        let mut members = Vec::new();
        for join in joins {
            members.push(join.await.unwrap());
        }

        let (origin, _) = &members[0];
        let report = router.broadcast("load", origin, "hi all").await;

        assert_eq!(report.delivered_count(), 99);
        assert!(report.failed.is_empty());
        let unique: HashSet<_> = report.delivered.iter().collect();
        assert_eq!(unique.len(), 99);
        assert!(!unique.contains(origin.id()));

        for (handle, outbox) in &mut members[1..] {
            assert_eq!(outbox.try_recv().unwrap().text, "hi all", "{}", handle.id());
            assert!(outbox.try_recv().is_err());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_broadcast_during_membership_churn() {
        let (registry, router) = setup();
        let router = Arc::new(router);
        let (origin, _rx) = member(&registry, "busy", "origin");
        let mut stable: Vec<_> = (0..10)
            .map(|i| member(&registry, "busy", &format!("stable-{i}")))
            .collect();

        let churn = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..500 {
                    let (handle, _outbox) = ConnectionHandle::new(format!("churn-{i}").into(), 1);
                    registry.join("busy", &handle).unwrap();
                    tokio::task::yield_now().await;
                    handle.close();
                    registry.leave("busy", &handle);
                }
            })
        };

        for i in 0..10 {
            let report = router.broadcast("busy", &origin, &format!("m{i}")).await;
            let stable_delivered = report
                .delivered
                .iter()
                .filter(|id| id.as_str().starts_with("stable-"))
                .count();
            assert_eq!(stable_delivered, 10);
        }

        churn.await.unwrap();

        for (_, rx) in &mut stable {
            for i in 0..10 {
                assert_eq!(rx.try_recv().unwrap().text, format!("m{i}"));
            }
        }
    }
}
