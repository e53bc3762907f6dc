//! Latency benchmarks for Huddle.
//!
//! These benchmarks measure sender-to-recipient latency through full sessions.

use criterion::{criterion_group, criterion_main, Criterion};
use huddle_core::{BroadcastRouter, GroupRegistry, Session, SessionConfig};
use huddle_transport::memory::{self, MemoryPeer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

async fn spawn_members(router: &Arc<BroadcastRouter>, group: &str, count: usize) -> Vec<MemoryPeer> {
    let config = SessionConfig::default();
    let mut peers = Vec::with_capacity(count);
    for i in 0..count {
        let (connection, peer) = memory::pair(format!("{}-{}", group, i));
        let session = Session::new(connection, group, Arc::clone(router), &config);
        tokio::spawn(session.run());
        peers.push(peer);
    }
    while router.registry().member_count(group) < count {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    peers
}

/// Benchmark one message from one member to every other member.
fn bench_session_relay(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_relay");
    let runtime = Runtime::new().unwrap();

    for size in [2usize, 10, 100] {
        group.bench_function(format!("{}_members", size), |b| {
            let registry = Arc::new(GroupRegistry::new());
            let router = Arc::new(BroadcastRouter::new(registry));
            let mut peers = runtime.block_on(spawn_members(&router, "bench", size));

            b.iter_custom(|iters| {
                runtime.block_on(async {
                    let start = Instant::now();
                    for _ in 0..iters {
                        peers[0].send("ping");
                        for peer in &mut peers[1..] {
                            let _ = peer.recv().await;
                        }
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_session_relay);
criterion_main!(benches);
