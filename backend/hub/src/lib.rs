//! Plugin bus transport hub.
//!
//! Accepts plugin connections, tracks runtime state and correlates
//! capability requests with their responses.

pub mod connection;
pub mod hub;
pub mod log_buffer;
pub mod server;

pub use connection::{Outbound, PluginConnection};
pub use hub::{DEFAULT_REQUEST_TIMEOUT, Hub, HubConfig};
pub use log_buffer::{LOG_CAPACITY, LogBuffer};
