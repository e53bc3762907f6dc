//! # Huddle Server
//!
//! Group broadcast relay over WebSockets.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! huddle
//!
//! # Run with custom config
//! huddle --config /path/to/huddle.toml
//!
//! # Run with environment variables
//! HUDDLE_PORT=8080 HUDDLE_HOST=0.0.0.0 huddle
//! ```

use anyhow::Result;
use clap::Parser;
use huddle_server::{config::Config, run_server};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "huddle", version, about = "Group broadcast relay over WebSockets")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to, overriding the configuration.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overriding the configuration.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "huddle=debug,huddle_core=debug,huddle_server=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    tracing::info!("Starting Huddle server on {}:{}", config.host, config.port);

    run_server(config).await?;

    Ok(())
}
