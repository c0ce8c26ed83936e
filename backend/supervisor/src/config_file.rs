//! `plugins.json`: the full plugin configuration list as a JSON file.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;
use tracing::debug;

use plugbus_core::PluginConfig;

/// File name of the config list inside the plugins directory.
pub const CONFIG_FILE_NAME: &str = "plugins.json";

/// Create the file with an empty list if it does not exist yet.
pub async fn ensure_config_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    write_configs(path, &[]).await
}

pub async fn read_configs(path: &Path) -> Result<Vec<PluginConfig>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse plugin configuration file {}", path.display()))
}

/// Write the list atomically (temp file, then rename).
pub async fn write_configs(path: &Path, configs: &[PluginConfig]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(configs)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes())
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to rename {} to {}", tmp.display(), path.display()))?;
    debug!(path = %path.display(), count = configs.len(), "Wrote plugin configs");
    Ok(())
}
