//! Transport Hub
//!
//! Owns every live plugin connection together with the runtime-state,
//! pending-request, log and telemetry tables. All mutation happens here;
//! other components go through `update_state`, `set_config` and
//! `ensure_state`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use plugbus_core::{
    BusError, BusMessage, BusResult, HealthMessage, HealthStatus, HubEvent, LogEntry, LogMessage,
    PluginConfig, PluginRuntimeState, PluginStatus, Registration, RequestMessage,
    ResponseMessage, TelemetryMessage, TelemetrySnapshot,
};

use crate::connection::PluginConnection;
use crate::log_buffer::{LOG_CAPACITY, LogBuffer};

/// How long a capability request may wait for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub request_timeout: Duration,
    pub log_capacity: usize,
    pub event_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            log_capacity: LOG_CAPACITY,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

struct PendingRequest {
    plugin: String,
    responder: oneshot::Sender<BusResult<Value>>,
}

struct HubInner {
    config: HubConfig,
    connections: RwLock<HashMap<String, PluginConnection>>,
    states: RwLock<HashMap<String, PluginRuntimeState>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    logs: RwLock<HashMap<String, LogBuffer>>,
    telemetry: RwLock<HashMap<String, TelemetrySnapshot>>,
    events: broadcast::Sender<HubEvent>,
    port: OnceLock<u16>,
    shutdown: watch::Sender<bool>,
}

/// Cheaply cloneable handle to the hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(HubInner {
                config,
                connections: RwLock::new(HashMap::new()),
                states: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                logs: RwLock::new(HashMap::new()),
                telemetry: RwLock::new(HashMap::new()),
                events,
                port: OnceLock::new(),
                shutdown,
            }),
        }
    }

    /// Receiver for every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    /// Live event receivers (observer sessions, pending starts).
    pub fn subscriber_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    fn publish(&self, event: HubEvent) {
        debug!(event = %event, "Publishing hub event");
        // No listeners is not an error.
        let _ = self.inner.events.send(event);
    }

    /// Port the bus listener is bound to.
    pub fn port(&self) -> BusResult<u16> {
        self.inner
            .port
            .get()
            .copied()
            .ok_or_else(|| BusError::Other(anyhow!("Plugin bus has not been initialized")))
    }

    /// Record the bus port. Used by `listen`, or by embedders that serve
    /// `server::router` on a listener of their own. First call wins.
    pub fn set_port(&self, port: u16) {
        let _ = self.inner.port.set(port);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    // --- handshake ---------------------------------------------------------

    /// Process the first frame of a fresh connection. Anything but a
    /// registration closes the connection and creates no state.
    pub async fn accept(
        &self,
        connection: &PluginConnection,
        raw: &str,
    ) -> BusResult<PluginRuntimeState> {
        let message = match serde_json::from_str::<BusMessage>(raw) {
            Ok(message) => message,
            Err(e) => {
                connection.close();
                return Err(BusError::ProtocolViolation(format!(
                    "invalid first message: {e}"
                )));
            }
        };
        match message {
            BusMessage::Register(registration) => {
                Ok(self.register(connection.clone(), registration).await)
            }
            other => {
                connection.close();
                Err(BusError::ProtocolViolation(format!(
                    "First message must be register, got {}",
                    other.kind()
                )))
            }
        }
    }

    /// Bind `connection` to the registering plugin and mark it running.
    pub async fn register(
        &self,
        connection: PluginConnection,
        registration: Registration,
    ) -> PluginRuntimeState {
        let name = registration.plugin.clone();
        // Connection table first, then states: the same order `disconnect`
        // uses, so a closing socket never interleaves with a new registration.
        let mut connections = self.inner.connections.write().await;
        let state = {
            let mut states = self.inner.states.write().await;
            let previous = states.get(&name);
            let config = previous
                .map(|s| s.config.clone())
                .unwrap_or_else(|| {
                    PluginConfig::synthesized(&name, registration.capabilities.clone())
                });
            let capabilities = if registration.capabilities.is_empty() {
                config.capabilities.clone()
            } else {
                registration.capabilities.clone()
            };
            let state = PluginRuntimeState {
                name: name.clone(),
                status: PluginStatus::Running,
                pid: previous.and_then(|s| s.pid),
                port: Some(registration.port),
                last_heartbeat: Some(Utc::now()),
                capabilities,
                config,
                config_schema: registration
                    .config_schema
                    .or_else(|| previous.and_then(|s| s.config_schema.clone())),
                error: None,
            };
            states.insert(name.clone(), state.clone());
            state
        };

        let replaced = connections.insert(name.clone(), connection.clone());
        drop(connections);
        if let Some(old) = replaced.filter(|old| old.id() != connection.id()) {
            debug!(plugin = %name, "Closing replaced plugin connection");
            old.close();
        }

        info!(plugin = %name, port = %registration.port, "Plugin registered");
        self.publish(HubEvent::Registered(state.clone()));
        state
    }

    /// Drop the plugin's connection and mark it stopped.
    pub async fn unregister(&self, plugin: &str) {
        let mut connections = self.inner.connections.write().await;
        connections.remove(plugin);
        self.mark_unregistered(plugin).await;
        drop(connections);
        self.finish_unregister(plugin).await;
    }

    /// Connection close/error hook. Only the currently registered
    /// connection may unregister the plugin.
    pub async fn disconnect(&self, plugin: &str, connection_id: Uuid) {
        let mut connections = self.inner.connections.write().await;
        if connections.get(plugin).map(|c| c.id()) != Some(connection_id) {
            debug!(plugin = %plugin, "Stale connection closed; ignoring");
            return;
        }
        connections.remove(plugin);
        self.mark_unregistered(plugin).await;
        drop(connections);
        self.finish_unregister(plugin).await;
    }

    /// Caller holds the connection table lock.
    async fn mark_unregistered(&self, plugin: &str) {
        let mut states = self.inner.states.write().await;
        if let Some(state) = states.get_mut(plugin) {
            state.status = PluginStatus::Stopped;
        }
    }

    /// Fail the plugin's in-flight requests and announce the disconnect.
    async fn finish_unregister(&self, plugin: &str) {
        let failed: Vec<_> = {
            let mut pending = self.inner.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, request)| request.plugin == plugin)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .collect()
        };
        for (request_id, request) in failed {
            debug!(plugin = %plugin, request_id = %request_id, "Failing request to disconnected plugin");
            let _ = request
                .responder
                .send(Err(BusError::NotConnected(plugin.to_string())));
        }
        warn!(plugin = %plugin, "Plugin disconnected");
        self.publish(HubEvent::Unregistered(plugin.to_string()));
    }

    // --- inbound -----------------------------------------------------------

    /// Parse and dispatch one frame from a registered plugin.
    pub async fn handle_frame(&self, plugin: &str, raw: &str) {
        match serde_json::from_str::<BusMessage>(raw) {
            Ok(message) => self.handle_inbound(plugin, message).await,
            Err(e) => error!(plugin = %plugin, error = %e, "Failed to process message"),
        }
    }

    pub async fn handle_inbound(&self, plugin: &str, message: BusMessage) {
        match message {
            BusMessage::Log(log) => self.record_log(plugin, log).await,
            BusMessage::Health(health) => self.record_health(plugin, health).await,
            BusMessage::Telemetry(telemetry) => self.record_telemetry(plugin, telemetry).await,
            BusMessage::Response(response) => self.resolve(response).await,
            BusMessage::Register(_) => {
                warn!(plugin = %plugin, "Ignoring repeated registration on live connection")
            }
            BusMessage::Request(_) => {
                warn!(plugin = %plugin, "Ignoring request envelope sent by plugin")
            }
        }
    }

    async fn record_log(&self, plugin: &str, log: LogMessage) {
        let timestamp = log
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let entry = LogEntry {
            plugin: plugin.to_string(),
            level: log.level,
            message: log.message,
            timestamp,
        };
        {
            let mut logs = self.inner.logs.write().await;
            logs.entry(plugin.to_string())
                .or_insert_with(|| LogBuffer::new(self.inner.config.log_capacity))
                .push(entry.clone());
        }
        self.publish(HubEvent::Log(entry));
    }

    async fn record_health(&self, plugin: &str, health: HealthMessage) {
        let up = health.status == HealthStatus::Up;
        let detail = health.detail.clone();
        self.update_state(plugin, |state| {
            state.last_heartbeat = Some(Utc::now());
            state.status = if up {
                PluginStatus::Running
            } else {
                PluginStatus::Degraded
            };
            state.error = if up { None } else { detail };
        })
        .await;
        self.publish(HubEvent::Health {
            plugin: plugin.to_string(),
            status: health.status,
            detail: health.detail,
        });
    }

    async fn record_telemetry(&self, plugin: &str, telemetry: TelemetryMessage) {
        let snapshot = TelemetrySnapshot {
            plugin: plugin.to_string(),
            cpu: telemetry.cpu,
            mem_bytes: telemetry.mem_bytes,
            models_loaded: telemetry.models_loaded,
            datasets: telemetry.datasets,
            entries: telemetry.entries,
            timestamp: Utc::now(),
        };
        self.inner
            .telemetry
            .write()
            .await
            .insert(plugin.to_string(), snapshot.clone());
        self.publish(HubEvent::Telemetry(snapshot));
    }

    async fn resolve(&self, response: ResponseMessage) {
        let pending = self.inner.pending.lock().await.remove(&response.request_id);
        let Some(pending) = pending else {
            warn!(request_id = %response.request_id, "No pending request for response");
            return;
        };
        let result = if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(BusError::Remote(
                response.error.unwrap_or_else(|| "Unknown error".to_string()),
            ))
        };
        if pending.responder.send(result).is_err() {
            debug!(
                plugin = %pending.plugin,
                request_id = %response.request_id,
                "Caller gone before response arrived"
            );
        }
    }

    // --- outbound RPC ------------------------------------------------------

    /// Invoke `capability` on `plugin` and wait for its response.
    pub async fn request(
        &self,
        plugin: &str,
        capability: &str,
        payload: Value,
        token: Option<String>,
    ) -> BusResult<Value> {
        let connection = self
            .inner
            .connections
            .read()
            .await
            .get(plugin)
            .filter(|c| c.is_open())
            .cloned();
        let Some(connection) = connection else {
            return Err(BusError::NotConnected(plugin.to_string()));
        };

        let request_id = Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&BusMessage::Request(RequestMessage {
            request_id: request_id.clone(),
            capability: capability.to_string(),
            payload,
            token,
        }))
        .map_err(anyhow::Error::from)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(
            request_id.clone(),
            PendingRequest {
                plugin: plugin.to_string(),
                responder: tx,
            },
        );

        if !connection.send_text(frame) {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(BusError::NotConnected(plugin.to_string()));
        }
        debug!(plugin = %plugin, capability = %capability, request_id = %request_id, "Request sent");

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Responder dropped without an answer: the pending table was cleared.
            Ok(Err(_)) => Err(BusError::ShuttingDown),
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                warn!(plugin = %plugin, capability = %capability, request_id = %request_id, "Request timed out");
                Err(BusError::RequestTimeout(plugin.to_string()))
            }
        }
    }

    // --- sanctioned state mutation -----------------------------------------

    /// Apply `mutation` to an existing state and publish the result.
    /// Unknown plugins are left alone.
    pub async fn update_state<F>(&self, plugin: &str, mutation: F) -> Option<PluginRuntimeState>
    where
        F: FnOnce(&mut PluginRuntimeState),
    {
        let updated = {
            let mut states = self.inner.states.write().await;
            let state = states.get_mut(plugin)?;
            mutation(state);
            state.clone()
        };
        self.publish(HubEvent::Updated(updated.clone()));
        Some(updated)
    }

    pub async fn set_config(&self, plugin: &str, config: PluginConfig) {
        if let Some(state) = self.inner.states.write().await.get_mut(plugin) {
            state.config = config;
        }
    }

    /// Seed a `stopped` entry unless one already exists.
    pub async fn ensure_state(&self, plugin: &str, config: &PluginConfig) {
        let mut states = self.inner.states.write().await;
        states.entry(plugin.to_string()).or_insert_with(|| {
            let mut state = PluginRuntimeState::stopped(config.clone());
            state.name = plugin.to_string();
            state
        });
    }

    // --- read access -------------------------------------------------------

    pub async fn plugins(&self) -> Vec<PluginRuntimeState> {
        let mut states: Vec<_> = self.inner.states.read().await.values().cloned().collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    pub async fn plugin(&self, name: &str) -> Option<PluginRuntimeState> {
        self.inner.states.read().await.get(name).cloned()
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.inner
            .connections
            .read()
            .await
            .get(name)
            .is_some_and(|c| c.is_open())
    }

    pub async fn logs(&self, plugin: &str, limit: usize) -> Vec<LogEntry> {
        self.inner
            .logs
            .read()
            .await
            .get(plugin)
            .map(|buffer| buffer.tail(limit))
            .unwrap_or_default()
    }

    pub async fn telemetry(&self, plugin: &str) -> Option<TelemetrySnapshot> {
        self.inner.telemetry.read().await.get(plugin).cloned()
    }

    pub async fn all_telemetry(&self) -> Vec<TelemetrySnapshot> {
        let mut snapshots: Vec<_> = self.inner.telemetry.read().await.values().cloned().collect();
        snapshots.sort_by(|a, b| a.plugin.cmp(&b.plugin));
        snapshots
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    // --- shutdown ----------------------------------------------------------

    /// Close every connection, stop the listener and fail all pending
    /// requests.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = self.inner.connections.write().await.drain().collect();
        for (name, connection) in connections {
            debug!(plugin = %name, "Closing plugin connection");
            connection.close();
        }

        let _ = self.inner.shutdown.send(true);

        let pending: Vec<_> = self.inner.pending.lock().await.drain().collect();
        for (request_id, request) in pending {
            debug!(plugin = %request.plugin, request_id = %request_id, "Failing pending request");
            let _ = request.responder.send(Err(BusError::ShuttingDown));
        }
        info!("Plugin bus shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use plugbus_core::{LogLevel, PluginPort};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_hub() -> Hub {
        Hub::new(HubConfig {
            request_timeout: Duration::from_millis(200),
            ..HubConfig::default()
        })
    }

    fn registration(name: &str, capabilities: &[&str]) -> Registration {
        Registration {
            plugin: name.into(),
            port: PluginPort::Internal,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            config_schema: None,
            meta: None,
        }
    }

    async fn connect(
        hub: &Hub,
        name: &str,
        capabilities: &[&str],
    ) -> (PluginConnection, mpsc::UnboundedReceiver<Outbound>) {
        let (conn, rx) = PluginConnection::new();
        hub.register(conn.clone(), registration(name, capabilities)).await;
        (conn, rx)
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> RequestMessage {
        match rx.recv().await {
            Some(Outbound::Text(text)) => match serde_json::from_str(&text).unwrap() {
                BusMessage::Request(request) => request,
                other => panic!("expected request, got {other:?}"),
            },
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn response(request_id: &str, success: bool, data: Value) -> BusMessage {
        BusMessage::Response(ResponseMessage {
            request_id: request_id.into(),
            success,
            data: Some(data),
            error: if success { None } else { Some("model not loaded".into()) },
        })
    }

    #[tokio::test]
    async fn test_first_message_must_register() {
        let hub = test_hub();
        let (conn, mut rx) = PluginConnection::new();
        let raw = json!({"type": "log", "plugin": "x", "level": "info", "message": "hi"}).to_string();

        let err = hub.accept(&conn, &raw).await.unwrap_err();
        assert!(matches!(err, BusError::ProtocolViolation(_)));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(hub.plugins().await.is_empty());
        assert!(!hub.is_connected("x").await);
    }

    #[tokio::test]
    async fn test_garbage_first_message_closes_connection() {
        let hub = test_hub();
        let (conn, mut rx) = PluginConnection::new();
        assert!(hub.accept(&conn, "not json").await.is_err());
        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn test_register_marks_running_and_emits() {
        let hub = test_hub();
        let mut events = hub.subscribe();
        let (conn, _rx) = PluginConnection::new();
        let raw = json!({
            "type": "register",
            "plugin": "llmserver",
            "port": 4100,
            "capabilities": ["llm.chat"]
        })
        .to_string();

        let state = hub.accept(&conn, &raw).await.unwrap();
        assert_eq!(state.status, PluginStatus::Running);
        assert_eq!(state.port, Some(PluginPort::Tcp(4100)));
        assert!(state.last_heartbeat.is_some());
        assert_eq!(state.config.name, "llmserver");

        match events.recv().await.unwrap() {
            HubEvent::Registered(s) => assert_eq!(s.name, "llmserver"),
            other => panic!("unexpected event {other}"),
        }
    }

    #[tokio::test]
    async fn test_register_keeps_config_and_pid() {
        let hub = test_hub();
        let mut config = PluginConfig::new("candle", "candle");
        config.capabilities = vec!["candle.stats".into()];
        hub.ensure_state("candle", &config).await;
        hub.update_state("candle", |s| {
            s.status = PluginStatus::Starting;
            s.pid = Some(4242);
        })
        .await;

        let (_conn, _rx) = connect(&hub, "candle", &[]).await;
        let state = hub.plugin("candle").await.unwrap();
        assert_eq!(state.pid, Some(4242));
        assert_eq!(state.config, config);
        // Empty registration list falls back to config.
        assert_eq!(state.capabilities, vec!["candle.stats".to_string()]);
    }

    #[tokio::test]
    async fn test_request_without_connection_fails_immediately() {
        let hub = test_hub();
        let err = hub
            .request("ghost", "llm.chat", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected(ref p) if p == "ghost"));
        assert_eq!(hub.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_to_closed_connection_is_not_connected() {
        let hub = test_hub();
        let (_conn, rx) = connect(&hub, "apikeys", &["auth.validate"]).await;
        drop(rx);
        let err = hub
            .request("apikeys", "auth.validate", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected(_)));
        assert_eq!(hub.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_end_to_end_chat_round_trip() {
        let hub = test_hub();
        let (_conn, mut rx) = connect(&hub, "llmserver", &["llm.chat"]).await;

        let plugin_side = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let request = next_request(&mut rx).await;
                assert_eq!(request.capability, "llm.chat");
                assert_eq!(request.payload, json!({"messages": []}));
                assert_eq!(request.token.as_deref(), Some("bearer-1"));
                hub.handle_inbound(
                    "llmserver",
                    response(&request.request_id, true, json!({"id": "abc"})),
                )
                .await;
            })
        };

        let result = hub
            .request(
                "llmserver",
                "llm.chat",
                json!({"messages": []}),
                Some("bearer-1".into()),
            )
            .await
            .unwrap();
        plugin_side.await.unwrap();
        assert_eq!(result, json!({"id": "abc"}));
        assert_eq!(hub.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_remote_failure_propagates_message() {
        let hub = test_hub();
        let (_conn, mut rx) = connect(&hub, "candle", &["candle.model.run"]).await;
        let hub_clone = hub.clone();
        tokio::spawn(async move {
            let request = next_request(&mut rx).await;
            hub_clone
                .handle_inbound("candle", response(&request.request_id, false, Value::Null))
                .await;
        });

        let err = hub
            .request("candle", "candle.model.run", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Remote(ref m) if m == "model not loaded"));
    }

    #[tokio::test]
    async fn test_duplicate_response_only_first_resolves() {
        let hub = test_hub();
        let (_conn, mut rx) = connect(&hub, "brainml", &["brainml.query"]).await;
        let hub_clone = hub.clone();
        let plugin_side = tokio::spawn(async move {
            let request = next_request(&mut rx).await;
            hub_clone
                .handle_inbound("brainml", response(&request.request_id, true, json!(1)))
                .await;
            hub_clone
                .handle_inbound("brainml", response(&request.request_id, true, json!(2)))
                .await;
        });

        let result = hub
            .request("brainml", "brainml.query", json!({}), None)
            .await
            .unwrap();
        plugin_side.await.unwrap();
        assert_eq!(result, json!(1));
        assert_eq!(hub.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_timeout_discards_late_response() {
        let hub = test_hub();
        let (_conn, mut rx) = connect(&hub, "goose", &["goose.run"]).await;

        let err = hub
            .request("goose", "goose.run", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RequestTimeout(_)));
        assert_eq!(hub.pending_count().await, 0);

        let request = next_request(&mut rx).await;
        hub.handle_inbound("goose", response(&request.request_id, true, json!("late")))
            .await;
        assert_eq!(hub.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_log_ring_buffer_keeps_500() {
        let hub = test_hub();
        let (_conn, _rx) = connect(&hub, "repoagent", &[]).await;
        for i in 1..=501 {
            hub.handle_inbound(
                "repoagent",
                BusMessage::Log(LogMessage {
                    plugin: "repoagent".into(),
                    level: LogLevel::Info,
                    message: format!("entry #{i}"),
                    timestamp: None,
                }),
            )
            .await;
        }
        let logs = hub.logs("repoagent", 1000).await;
        assert_eq!(logs.len(), 500);
        assert!(logs.iter().all(|l| l.message != "entry #1"));
        assert_eq!(logs.last().unwrap().message, "entry #501");
    }

    #[tokio::test]
    async fn test_log_keeps_plugin_timestamp() {
        let hub = test_hub();
        hub.handle_frame(
            "goose",
            &json!({
                "type": "log",
                "plugin": "goose",
                "level": "warn",
                "message": "slow",
                "timestamp": "2024-05-01T10:00:00Z"
            })
            .to_string(),
        )
        .await;
        let logs = hub.logs("goose", 10).await;
        assert_eq!(logs[0].level, LogLevel::Warn);
        assert_eq!(logs[0].timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[tokio::test]
    async fn test_health_transitions() {
        let hub = test_hub();
        let (_conn, _rx) = connect(&hub, "brainml", &[]).await;

        let degraded = BusMessage::Health(HealthMessage {
            plugin: "brainml".into(),
            status: HealthStatus::Degraded,
            detail: Some("index rebuilding".into()),
        });
        hub.handle_inbound("brainml", degraded).await;
        let state = hub.plugin("brainml").await.unwrap();
        assert_eq!(state.status, PluginStatus::Degraded);
        assert_eq!(state.error.as_deref(), Some("index rebuilding"));
        let before = state.last_heartbeat.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let up = BusMessage::Health(HealthMessage {
            plugin: "brainml".into(),
            status: HealthStatus::Up,
            detail: None,
        });
        hub.handle_inbound("brainml", up).await;
        let state = hub.plugin("brainml").await.unwrap();
        assert_eq!(state.status, PluginStatus::Running);
        assert!(state.last_heartbeat.unwrap() > before);
        assert_eq!(state.error, None);

        hub.handle_frame(
            "brainml",
            &json!({"type": "health", "plugin": "brainml", "status": "down"}).to_string(),
        )
        .await;
        assert_eq!(
            hub.plugin("brainml").await.unwrap().status,
            PluginStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_telemetry_overwrites_snapshot() {
        let hub = test_hub();
        for mem in [100, 200] {
            hub.handle_inbound(
                "candle",
                BusMessage::Telemetry(TelemetryMessage {
                    plugin: "candle".into(),
                    cpu: 1.0,
                    mem_bytes: mem,
                    models_loaded: Some(1),
                    datasets: None,
                    entries: None,
                }),
            )
            .await;
        }
        assert_eq!(hub.telemetry("candle").await.unwrap().mem_bytes, 200);
        assert_eq!(hub.all_telemetry().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_only_for_current_connection() {
        let hub = test_hub();
        let (first, mut first_rx) = connect(&hub, "goose", &[]).await;
        let (second, _second_rx) = connect(&hub, "goose", &[]).await;
        // Replaced connection gets closed.
        assert_eq!(first_rx.recv().await, Some(Outbound::Close));

        hub.disconnect("goose", first.id()).await;
        assert!(hub.is_connected("goose").await);
        assert_eq!(hub.plugin("goose").await.unwrap().status, PluginStatus::Running);

        let mut events = hub.subscribe();
        hub.disconnect("goose", second.id()).await;
        assert!(!hub.is_connected("goose").await);
        assert_eq!(hub.plugin("goose").await.unwrap().status, PluginStatus::Stopped);
        assert!(matches!(events.recv().await.unwrap(), HubEvent::Unregistered(n) if n == "goose"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disconnect_racing_reregistration_keeps_new_connection() {
        let hub = test_hub();
        for _ in 0..200 {
            let (old, _old_rx) = connect(&hub, "goose", &[]).await;
            let (new, _new_rx) = PluginConnection::new();
            let new_id = new.id();

            let closing = {
                let hub = hub.clone();
                let old_id = old.id();
                tokio::spawn(async move { hub.disconnect("goose", old_id).await })
            };
            let registering = {
                let hub = hub.clone();
                tokio::spawn(async move { hub.register(new, registration("goose", &[])).await })
            };
            closing.await.unwrap();
            registering.await.unwrap();

            let current = hub.inner.connections.read().await.get("goose").map(|c| c.id());
            assert_eq!(current, Some(new_id));
            assert_eq!(hub.plugin("goose").await.unwrap().status, PluginStatus::Running);
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let hub = Hub::new(HubConfig::default());
        let (conn, mut rx) = connect(&hub, "llmserver", &["llm.chat"]).await;

        let caller = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.request("llmserver", "llm.chat", json!({}), None).await })
        };
        let _ = next_request(&mut rx).await;
        hub.disconnect("llmserver", conn.id()).await;

        let err = tokio::time::timeout(Duration::from_secs(1), caller)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected(ref n) if n == "llmserver"));
        assert_eq!(hub.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_ensure_state_is_noop_when_present() {
        let hub = test_hub();
        let config = PluginConfig::new("demo", "run.sh");
        hub.ensure_state("demo", &config).await;
        hub.update_state("demo", |s| s.status = PluginStatus::Error).await;
        hub.ensure_state("demo", &config).await;
        assert_eq!(hub.plugin("demo").await.unwrap().status, PluginStatus::Error);

        let mut changed = config.clone();
        changed.description = "changed".into();
        hub.set_config("demo", changed.clone()).await;
        assert_eq!(hub.plugin("demo").await.unwrap().config, changed);
        assert!(hub.update_state("missing", |_| {}).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_requests() {
        let hub = Hub::new(HubConfig::default());
        let (_conn, mut rx) = connect(&hub, "llmserver", &["llm.chat"]).await;

        let caller = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.request("llmserver", "llm.chat", json!({}), None).await })
        };
        let _ = next_request(&mut rx).await;
        hub.shutdown().await;

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::ShuttingDown));
        assert_eq!(hub.pending_count().await, 0);
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(!hub.is_connected("llmserver").await);
    }
}
