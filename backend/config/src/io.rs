//! Config file loading.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, info};

use crate::env::substitute_env_refs;
use crate::schema::HostConfig;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "plugbus.yaml";

/// Load and parse the config from disk.
///
/// Returns `Ok(Default::default())` if the file doesn't exist (first run).
pub async fn load_config(path: &Path, env: &HashMap<String, String>) -> Result<HostConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        return Ok(HostConfig::default());
    }

    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let raw = substitute_env_refs(&raw, env)
        .with_context(|| format!("Failed to resolve env vars in {}", path.display()))?;

    // An empty file parses as YAML null.
    if raw.trim().is_empty() {
        return Ok(HostConfig::default());
    }
    let config: HostConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config YAML at: {}", path.display()))?;

    info!(path = %path.display(), "Loaded config");
    Ok(config)
}
