//! Shared data model, wire envelopes, events and errors of the plugin bus.

pub mod error;
pub mod event;
pub mod message;
pub mod types;

pub use error::{BusError, BusResult};
pub use event::HubEvent;
pub use message::{
    BusMessage, HealthMessage, HealthStatus, LogMessage, Registration, RequestMessage,
    ResponseMessage, TelemetryMessage,
};
pub use types::{
    Healthcheck, LogEntry, LogLevel, PluginConfig, PluginPort, PluginRuntimeState, PluginStatus,
    TelemetrySnapshot,
};
