//! Host HTTP server: admin API plus the observer WebSocket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument};

use plugbus_supervisor::PluginManager;

use crate::api;
use crate::session::FanoutGateway;
use crate::ws_server::ws_handler;

/// Application state shared across routes.
#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<PluginManager>,
    pub gateway: FanoutGateway,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self {
            gateway: FanoutGateway::new(manager.clone()),
            manager,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/plugins", get(api::list_plugins))
        .route("/api/plugins/telemetry/summary", get(api::telemetry_summary))
        .route("/api/plugins/:name", get(api::get_plugin))
        .route("/api/plugins/:name/status", get(api::plugin_status))
        .route("/api/plugins/:name/capabilities", get(api::plugin_capabilities))
        .route("/api/plugins/:name/start", post(api::start_plugin))
        .route("/api/plugins/:name/stop", post(api::stop_plugin))
        .route("/api/plugins/:name/restart", post(api::restart_plugin))
        .route("/api/plugins/:name/config", post(api::update_config))
        .route(
            "/api/plugins/:name/invoke/:capability",
            post(api::invoke_capability),
        )
        .route("/api/plugins/:name/logs", get(api::plugin_logs))
        .route("/api/plugins/:name/telemetry", get(api::plugin_telemetry))
        .route("/ws/plugins", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router on `addr` until `shutdown` resolves.
#[instrument(skip(state, shutdown))]
pub async fn start_server<F>(addr: SocketAddr, state: GatewayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server on {addr}"))?;
    info!("API server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
