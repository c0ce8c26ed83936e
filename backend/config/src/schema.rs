//! Host configuration schema.
//!
//! ```yaml
//! server:
//!   bind_address: 0.0.0.0
//!   port: 8080
//! bus:
//!   port: 0
//!   request_timeout_secs: 30
//!   registration_timeout_secs: 30
//! plugins:
//!   dir: core/plugins
//!   database_path: data/plugbus.db
//! logging:
//!   level: info
//!   dir: logs
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::*;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub plugins: PluginsConfig,
    pub logging: LoggingConfig,
}

/// Admin API / observer listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_API_PORT,
        }
    }
}

/// Plugin bus listener. Port `0` picks a free port at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub port: u16,
    pub request_timeout_secs: u64,
    pub registration_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_BUS_PORT,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            registration_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub dir: PathBuf,
    pub database_path: PathBuf,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_PLUGINS_DIR),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Rolling JSON logs are written here when set.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            dir: None,
        }
    }
}
