//! `plugbus-config`: host configuration.
//!
//! Provides:
//! - Typed schema with defaults for every field
//! - YAML loading with `${ENV_VAR}` substitution
//! - `PLUGBUS_*` environment overrides
//! - Validation with field paths

pub mod defaults;
pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use env::{apply_env_overrides, process_env, substitute_env_refs};
pub use io::{CONFIG_FILE_NAME, load_config};
pub use schema::{BusConfig, HostConfig, LoggingConfig, PluginsConfig, ServerConfig};
pub use validation::{ConfigValidationError, ValidationReport, validate};

use anyhow::{Result, bail};
use std::collections::HashMap;
use std::path::Path;

/// Load the file, apply env overrides, and validate.
///
/// Warnings are logged; any error fails the load.
pub async fn load_and_prepare(path: &Path, env: &HashMap<String, String>) -> Result<HostConfig> {
    let config = load_config(path, env).await?;
    let config = apply_env_overrides(config, env)?;

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    if !report.is_valid() {
        let errors: Vec<String> = report.errors.iter().map(|e| e.to_string()).collect();
        bail!("Invalid configuration:\n  {}", errors.join("\n  "));
    }
    Ok(config)
}
