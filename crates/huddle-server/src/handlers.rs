//! HTTP and WebSocket handlers for the Huddle server.
//!
//! Each upgraded socket gets its own task running a [`Session`]. The
//! registry and router are created once per process and shared by every
//! session through [`AppState`].

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, MeteredConnection};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use huddle_core::{validate_group_id, BroadcastRouter, GroupRegistry, Session, SessionConfig};
use huddle_transport::WebSocketConnection;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Group membership.
    pub registry: Arc<GroupRegistry>,
    /// Fan-out over the registry.
    pub router: Arc<BroadcastRouter>,
    /// Per-session settings.
    pub session: SessionConfig,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create the process-wide state: an empty registry plus any preset groups.
    ///
    /// # Errors
    ///
    /// Returns an error if a preset group is invalid or exceeds the group limit.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(GroupRegistry::with_config(config.registry_config()));
        for group in &config.groups.preset {
            validate_group_id(group)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid preset group {:?}", group))?;
            registry
                .declare(group)
                .with_context(|| format!("Failed to declare preset group {:?}", group))?;
        }

        let router = Arc::new(BroadcastRouter::with_config(
            Arc::clone(&registry),
            config.router_config(),
        ));

        Ok(Self {
            registry,
            router,
            session: config.session_config(),
            config,
        })
    }
}

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.websocket_route(), get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/groups/:group_id", get(group_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until `shutdown` resolves.
///
/// On shutdown every open session is closed and deregistered.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(
    state: Arc<AppState>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr,
        state.config.websocket_route()
    );

    let registry = Arc::clone(&state.registry);
    let app = app(state).into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down, closing sessions");
            registry.close_all();
        })
        .await
        .context("Server error")?;

    Ok(())
}

/// Bind and run the server with process signals as the shutdown trigger.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config)?);

    let sampler = if state.config.metrics.enabled {
        match metrics::start_metrics_server(state.config.metrics.port) {
            Ok(()) => Some(metrics::spawn_registry_sampler(
                Arc::clone(&state.registry),
                metrics::SAMPLE_INTERVAL,
            )),
            Err(e) => {
                error!("Failed to start metrics server: {}", e);
                None
            }
        }
    } else {
        None
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let result = serve(state, listener, shutdown_signal()).await;
    if let Some(sampler) = sampler {
        sampler.abort();
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Registry statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    Json(serde_json::json!({
        "groups": stats.group_count,
        "connections": stats.connection_count,
    }))
}

/// Single group handler.
async fn group_handler(
    Path(group_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "group": group_id,
        "members": state.registry.member_count(&group_id),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(group_id): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(reason) = validate_group_id(&group_id) {
        warn!(group = %group_id, remote = %remote, "Rejecting upgrade: {}", reason);
        return (StatusCode::BAD_REQUEST, reason).into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, group_id, remote, state))
}

/// Drive one upgraded WebSocket through its session.
async fn handle_websocket(
    socket: WebSocket,
    group_id: String,
    remote: SocketAddr,
    state: Arc<AppState>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = MeteredConnection::new(WebSocketConnection::new(socket).with_remote_addr(remote));
    debug!(group = %group_id, remote = %remote, "WebSocket connected");

    let session = Session::new(connection, group_id, Arc::clone(&state.router), &state.session);
    let reason = session.run().await;

    metrics::record_session_closed(reason.as_str());
    metrics::record_registry_stats(&state.registry);
}
