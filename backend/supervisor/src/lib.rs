//! Plugin lifecycle manager.
//!
//! Launches plugin processes, waits for them to register on the bus, and
//! keeps plugin configuration in memory, in `plugins.json` and in SQLite.

pub mod config_file;
pub mod manager;
pub mod process;
pub mod store;

pub use manager::{
    DEFAULT_LOG_LIMIT, DEFAULT_REGISTRATION_TIMEOUT, ENV_BUS_PORT, ENV_DATABASE_PATH,
    ENV_PLUGIN_NAME, MAX_LOG_LIMIT, ManagerOptions, PluginManager, clamp_log_limit,
};
pub use process::{NativeLauncher, PluginProcess, ProcessEvent, ProcessLauncher, SpawnSpec};
pub use store::{ConfigStore, SqliteConfigStore};
