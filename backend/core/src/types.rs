use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted description of how to run a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Executable path, relative to the plugin's own directory.
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Healthcheck {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, entrypoint: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            entrypoint: entrypoint.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            autostart: false,
            capabilities: Vec::new(),
            settings: None,
            healthcheck: None,
        }
    }

    /// Placeholder config for a plugin that registered without one on file.
    pub fn synthesized(name: &str, capabilities: Vec<String>) -> Self {
        Self {
            capabilities,
            ..Self::new(name, "")
        }
    }
}

/// Liveness of a plugin as seen by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Degraded,
    Error,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginStatus::Stopped => "stopped",
            PluginStatus::Starting => "starting",
            PluginStatus::Running => "running",
            PluginStatus::Degraded => "degraded",
            PluginStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Where a plugin can be reached: its own TCP port, or only over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPort", into = "RawPort")]
pub enum PluginPort {
    Tcp(u16),
    Internal,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u16),
    Text(String),
}

impl TryFrom<RawPort> for PluginPort {
    type Error = String;

    fn try_from(raw: RawPort) -> Result<Self, Self::Error> {
        match raw {
            RawPort::Number(port) => Ok(PluginPort::Tcp(port)),
            RawPort::Text(text) if text == "internal" => Ok(PluginPort::Internal),
            RawPort::Text(text) => text
                .parse()
                .map(PluginPort::Tcp)
                .map_err(|_| format!("invalid plugin port: {text}")),
        }
    }
}

impl From<PluginPort> for RawPort {
    fn from(port: PluginPort) -> Self {
        match port {
            PluginPort::Tcp(port) => RawPort::Number(port),
            PluginPort::Internal => RawPort::Text("internal".into()),
        }
    }
}

impl fmt::Display for PluginPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginPort::Tcp(port) => write!(f, "{port}"),
            PluginPort::Internal => f.write_str("internal"),
        }
    }
}

/// The hub's view of one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRuntimeState {
    pub name: String,
    pub status: PluginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<PluginPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub capabilities: Vec<String>,
    pub config: PluginConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginRuntimeState {
    /// A never-started plugin: `stopped`, no pid, capabilities from config.
    pub fn stopped(config: PluginConfig) -> Self {
        Self {
            name: config.name.clone(),
            status: PluginStatus::Stopped,
            pid: None,
            port: None,
            last_heartbeat: None,
            capabilities: config.capabilities.clone(),
            config,
            config_schema: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One line of plugin log history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub plugin: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Most recent resource report of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub plugin: String,
    pub cpu: f64,
    pub mem_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models_loaded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<u64>,
    pub timestamp: DateTime<Utc>,
}
