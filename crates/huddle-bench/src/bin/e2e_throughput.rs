//! End-to-end fan-out throughput benchmark for Huddle.
//!
//! This benchmark measures actual WebSocket relay throughput with real network I/O.
//! Every client joins the same group and sends continuously; each relayed
//! message received by any client is counted.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws/benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| SERVER_URL.to_string());

    println!("Huddle end-to-end fan-out benchmark");
    println!("  Make sure the server is running: cargo run --release --bin huddle");
    println!();

    run_fanout_benchmark(num_clients, url).await;
}

async fn run_fanout_benchmark(num_clients: usize, url: String) {
    println!("{} clients -> {}", num_clients, url);
    println!("Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to connect
    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    // Reset counter and start measurement
    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("Results");
    println!("  Clients:         {:>10}", num_clients);
    println!("  Duration:        {:>10.2}s", elapsed.as_secs_f64());
    println!("  Relayed:         {:>10}", total_messages);
    println!("  Throughput:      {:>10.0} msg/s", msgs_per_sec);
    println!("  Per-Client:      {:>10.0} msg/s", msgs_per_sec_per_client);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    // Wait for all clients to be ready
    barrier.wait().await;

    let payload = Message::Text(format!("client-{}:{}", client_id, "x".repeat(48)));

    // Spawn separate receiver task for full-duplex operation
    let recv_count = Arc::clone(&message_count);
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(_)) = result {
                recv_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    loop {
        if sender.send(payload.clone()).await.is_err() {
            break;
        }
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
