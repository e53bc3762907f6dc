//! # huddle-core
//!
//! Group membership, broadcast routing and session lifecycle for the Huddle
//! relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Owns group membership and hands out snapshots
//! - **Router** - Fans a message out to the other members of a group
//! - **Session** - Drives one connection from join to leave
//! - **Connection handle** - The non-owning member entry the registry stores
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Router    │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐
//! │ Connection  │     │   Handles   │
//! └─────────────┘     └─────────────┘
//! ```

pub mod connection;
pub mod group;
pub mod message;
pub mod registry;
pub mod router;
pub mod session;

pub use connection::{ConnectionHandle, ConnectionState, DeliveryFailure, Outbox};
pub use group::{validate_group_id, Group, GroupId};
pub use message::Message;
pub use registry::{GroupRegistry, RegistryConfig, RegistryError, RegistryStats};
pub use router::{BroadcastRouter, DeliveryReport, FailedDelivery, RouterConfig};
pub use session::{CloseReason, Session, SessionConfig};
