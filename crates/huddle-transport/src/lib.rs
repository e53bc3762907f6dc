//! # huddle-transport
//!
//! Connection abstraction layer for the Huddle group relay.
//!
//! This crate provides a unified interface over the duplex channels a
//! session drives:
//!
//! - **WebSocket** - upgraded axum sockets (feature `websocket`, on by default)
//! - **Memory** - in-process pairs for tests and benchmarks
//!
//! ## Connection Abstraction
//!
//! All adapters implement the `Connection` trait, so the relay core never
//! depends on a concrete protocol.
//!
//! ```rust,ignore
//! use huddle_transport::Connection;
//!
//! async fn echo(mut conn: impl Connection) {
//!     while let Ok(Some(text)) = conn.recv().await {
//!         let _ = conn.send(text).await;
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnection, MemoryPeer};
pub use traits::{Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
