//! Default values for the host configuration.

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

pub const DEFAULT_API_PORT: u16 = 8080;

/// `0`: let the OS choose.
pub const DEFAULT_BUS_PORT: u16 = 0;

pub const DEFAULT_PLUGINS_DIR: &str = "core/plugins";

pub const DEFAULT_DATABASE_PATH: &str = "data/plugbus.db";

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Capability request and registration timeouts.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
