use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{LogLevel, PluginPort};

/// Envelopes exchanged between the host and plugin processes over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusMessage {
    /// Plugin → Host: mandatory first message of a connection
    Register(Registration),
    /// Plugin → Host: a log line
    Log(LogMessage),
    /// Plugin → Host: liveness report
    Health(HealthMessage),
    /// Plugin → Host: resource usage report
    Telemetry(TelemetryMessage),
    /// Host → Plugin: invoke a capability
    Request(RequestMessage),
    /// Plugin → Host: answer to a request
    Response(ResponseMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub plugin: String,
    pub port: PluginPort,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub plugin: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMessage {
    pub plugin: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Field names follow the snake_case the plugins emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub plugin: String,
    pub cpu: f64,
    pub mem_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_loaded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasets: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub request_id: String,
    pub capability: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BusMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::Register(_) => "register",
            BusMessage::Log(_) => "log",
            BusMessage::Health(_) => "health",
            BusMessage::Telemetry(_) => "telemetry",
            BusMessage::Request(_) => "request",
            BusMessage::Response(_) => "response",
        }
    }
}
