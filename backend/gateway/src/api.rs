//! Admin HTTP handlers under `/api`.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::error;

use plugbus_core::{BusError, LogEntry, PluginConfig, PluginRuntimeState, TelemetrySnapshot};

use crate::auth::BearerToken;
use crate::server::GatewayState;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Bus(BusError),
}

impl From<BusError> for ApiError {
    fn from(e: BusError) -> Self {
        ApiError::Bus(e)
    }
}

fn status_for(e: &BusError) -> StatusCode {
    match e {
        BusError::ConfigMissing(_) => StatusCode::NOT_FOUND,
        BusError::EntrypointMissing(_)
        | BusError::NameMismatch { .. }
        | BusError::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
        BusError::AlreadyRunning(_) => StatusCode::CONFLICT,
        BusError::NotConnected(_) | BusError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        BusError::RequestTimeout(_) | BusError::RegistrationTimeout(_) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        BusError::Remote(_) => StatusCode::BAD_GATEWAY,
        BusError::Process { .. } | BusError::Storage(_) | BusError::Other(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Bus(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    error!(error = %e, "Request failed");
                }
                (status, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn find_plugin(state: &GatewayState, name: &str) -> Result<PluginRuntimeState, ApiError> {
    state
        .manager
        .get_plugin(name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Plugin {name} not found")))
}

/// `GET /api/health`
pub async fn health(State(state): State<GatewayState>) -> Json<Value> {
    let plugins = state.manager.list_plugins().await;
    Json(json!({
        "status": "ok",
        "service": "plugbus",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "busPort": state.manager.hub().port().ok(),
        "plugins": plugins.len(),
    }))
}

/// `GET /api/plugins`
pub async fn list_plugins(State(state): State<GatewayState>) -> Json<Vec<PluginRuntimeState>> {
    Json(state.manager.list_plugins().await)
}

/// `GET /api/plugins/:name`
pub async fn get_plugin(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<PluginRuntimeState> {
    Ok(Json(find_plugin(&state, &name).await?))
}

/// `GET /api/plugins/:name/status`
pub async fn plugin_status(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<Value> {
    let plugin = find_plugin(&state, &name).await?;
    Ok(Json(json!({
        "name": plugin.name,
        "status": plugin.status,
        "pid": plugin.pid,
        "port": plugin.port,
    })))
}

/// `GET /api/plugins/:name/capabilities`
pub async fn plugin_capabilities(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<Vec<String>> {
    Ok(Json(find_plugin(&state, &name).await?.capabilities))
}

/// `POST /api/plugins/:name/start`
pub async fn start_plugin(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<PluginRuntimeState> {
    Ok(Json(state.manager.start_plugin(&name).await?))
}

/// `POST /api/plugins/:name/stop`
pub async fn stop_plugin(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<Value> {
    state.manager.stop_plugin(&name).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

/// `POST /api/plugins/:name/restart`
pub async fn restart_plugin(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<PluginRuntimeState> {
    Ok(Json(state.manager.restart_plugin(&name).await?))
}

/// `POST /api/plugins/:name/config`
pub async fn update_config(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    Json(config): Json<PluginConfig>,
) -> ApiResult<PluginRuntimeState> {
    Ok(Json(state.manager.update_config(&name, config).await?))
}

/// `POST /api/plugins/:name/invoke/:capability`
///
/// The JSON body is the capability payload (`{}` when absent).
pub async fn invoke_capability(
    State(state): State<GatewayState>,
    Path((name, capability)): Path<(String, String)>,
    BearerToken(token): BearerToken,
    body: Option<Json<Value>>,
) -> ApiResult<Value> {
    let payload = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let data = state
        .manager
        .invoke_capability(&name, &capability, payload, token)
        .await?;
    Ok(Json(json!({ "success": true, "data": data })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    limit: Option<String>,
}

/// `GET /api/plugins/:name/logs?limit=N`
pub async fn plugin_logs(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Json<Vec<LogEntry>> {
    // Unparseable or non-positive limits fall back to the default.
    let limit = query
        .limit
        .as_deref()
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(0);
    Json(state.manager.get_logs(&name, limit).await)
}

/// `GET /api/plugins/:name/telemetry`
pub async fn plugin_telemetry(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<TelemetrySnapshot> {
    state
        .manager
        .get_telemetry(&name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No telemetry for {name}")))
}

/// `GET /api/plugins/telemetry/summary`
pub async fn telemetry_summary(State(state): State<GatewayState>) -> Json<Vec<TelemetrySnapshot>> {
    Json(state.manager.telemetry_summary().await)
}
