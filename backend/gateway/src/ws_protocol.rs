//! Observer WebSocket protocol for `/ws/plugins`.

use serde::{Deserialize, Serialize};

use plugbus_core::{LogEntry, PluginRuntimeState, TelemetrySnapshot};

/// Event stream an observer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Status,
    Logs,
    Telemetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Sub,
    Unsub,
}

/// Client -> Server: `{"action":"SUB","topic":"logs","pluginId":"candle"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub action: Action,
    pub topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapPayload {
    pub plugins: Vec<PluginRuntimeState>,
    pub telemetry: Vec<TelemetrySnapshot>,
}

/// Server -> Client envelope: `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum OutboundEvent {
    Bootstrap(BootstrapPayload),
    Status(PluginRuntimeState),
    Logs(LogEntry),
    Telemetry(TelemetrySnapshot),
}

impl OutboundEvent {
    /// Topic this event is delivered under; `None` for the bootstrap.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            OutboundEvent::Bootstrap(_) => None,
            OutboundEvent::Status(_) => Some(Topic::Status),
            OutboundEvent::Logs(_) => Some(Topic::Logs),
            OutboundEvent::Telemetry(_) => Some(Topic::Telemetry),
        }
    }

    pub fn plugin(&self) -> Option<&str> {
        match self {
            OutboundEvent::Bootstrap(_) => None,
            OutboundEvent::Status(state) => Some(&state.name),
            OutboundEvent::Logs(entry) => Some(&entry.plugin),
            OutboundEvent::Telemetry(snapshot) => Some(&snapshot.plugin),
        }
    }
}
