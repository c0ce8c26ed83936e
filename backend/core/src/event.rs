use serde::Serialize;

use crate::message::HealthStatus;
use crate::types::{LogEntry, PluginRuntimeState, TelemetrySnapshot};

/// Structured events the hub publishes to in-process listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum HubEvent {
    /// A plugin completed the registration handshake
    Registered(PluginRuntimeState),
    /// The registered connection of a plugin went away
    Unregistered(String),
    /// Runtime state was mutated
    Updated(PluginRuntimeState),
    /// A plugin emitted a log line
    Log(LogEntry),
    /// A plugin reported its health
    Health {
        plugin: String,
        status: HealthStatus,
        detail: Option<String>,
    },
    /// A plugin reported resource usage
    Telemetry(TelemetrySnapshot),
}

impl HubEvent {
    /// Name of the plugin the event concerns.
    pub fn plugin(&self) -> &str {
        match self {
            HubEvent::Registered(state) | HubEvent::Updated(state) => &state.name,
            HubEvent::Unregistered(name) => name,
            HubEvent::Log(entry) => &entry.plugin,
            HubEvent::Health { plugin, .. } => plugin,
            HubEvent::Telemetry(snapshot) => &snapshot.plugin,
        }
    }
}

impl std::fmt::Display for HubEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            HubEvent::Registered(_) => "registered",
            HubEvent::Unregistered(_) => "unregistered",
            HubEvent::Updated(_) => "updated",
            HubEvent::Log(_) => "log",
            HubEvent::Health { .. } => "health",
            HubEvent::Telemetry(_) => "telemetry",
        };
        write!(f, "{}({})", kind, self.plugin())
    }
}
