//! # huddle-server
//!
//! HTTP/WebSocket front end for the Huddle group relay.
//!
//! Clients connect to `/ws/{group_id}`; every text message a client sends is
//! relayed to the other clients connected to the same group.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{app, run_server, serve, AppState};
