use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

use plugbus_core::PluginConfig;

/// Durable plugin configuration table, keyed by plugin name.
pub trait ConfigStore: Send + Sync {
    /// Insert or replace the row for `config.name`.
    fn upsert(&self, config: &PluginConfig) -> Result<()>;
    fn get(&self, name: &str) -> Result<Option<PluginConfig>>;
    fn load_all(&self) -> Result<Vec<PluginConfig>>;
}

/// SQLite-backed config store.
pub struct SqliteConfigStore {
    conn: Mutex<Connection>,
}

impl SqliteConfigStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("Failed to enable WAL journal")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        info!(path = %path.display(), "Config store opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("config store lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS plugins (
                name TEXT PRIMARY KEY,
                description TEXT,
                capabilities TEXT,
                autostart INTEGER DEFAULT 0,
                config TEXT
            );",
        )?;
        Ok(())
    }

    /// Count all stored configs.
    pub fn count(&self) -> Result<usize> {
        let count: usize = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM plugins", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl ConfigStore for SqliteConfigStore {
    fn upsert(&self, config: &PluginConfig) -> Result<()> {
        let capabilities = serde_json::to_string(&config.capabilities)?;
        let blob = serde_json::to_string(config)?;
        self.lock()?.execute(
            "INSERT INTO plugins (name, description, capabilities, autostart, config)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
               description = excluded.description,
               capabilities = excluded.capabilities,
               autostart = excluded.autostart,
               config = excluded.config",
            params![
                config.name,
                config.description,
                capabilities,
                config.autostart as i64,
                blob,
            ],
        )?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<PluginConfig>> {
        let blob: Option<String> = self
            .lock()?
            .query_row(
                "SELECT config FROM plugins WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|raw| serde_json::from_str(&raw).context("parse stored plugin config"))
            .transpose()
    }

    fn load_all(&self) -> Result<Vec<PluginConfig>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name, config FROM plugins ORDER BY name ASC")?;
        let configs = stmt
            .query_map([], |row| {
                let name: String = row.get(0)?;
                let config: String = row.get(1)?;
                Ok((name, config))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(name, raw)| match serde_json::from_str(&raw) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Skipping unreadable stored config");
                    None
                }
            })
            .collect();
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> PluginConfig {
        let mut config = PluginConfig::new(name, "bin/run");
        config.capabilities = vec!["llm.chat".into()];
        config
    }

    #[test]
    fn test_upsert_and_get() {
        let store = SqliteConfigStore::in_memory().unwrap();
        let cfg = config("llmserver");
        store.upsert(&cfg).unwrap();
        assert_eq!(store.get("llmserver").unwrap(), Some(cfg));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_upsert_replaces_by_name() {
        let store = SqliteConfigStore::in_memory().unwrap();
        let mut cfg = config("candle");
        store.upsert(&cfg).unwrap();
        cfg.autostart = true;
        cfg.description = "Candle inference".into();
        store.upsert(&cfg).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let loaded = store.get("candle").unwrap().unwrap();
        assert!(loaded.autostart);
        assert_eq!(loaded.description, "Candle inference");
    }

    #[test]
    fn test_load_all_ordered() {
        let store = SqliteConfigStore::in_memory().unwrap();
        for name in ["repoagent", "apikeys", "goose"] {
            store.upsert(&config(name)).unwrap();
        }
        let names: Vec<_> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["apikeys", "goose", "repoagent"]);
    }

    #[test]
    fn test_open_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("plugbus.db");
        let store = SqliteConfigStore::open(&path).unwrap();
        store.upsert(&config("apikeys")).unwrap();
        drop(store);

        let reopened = SqliteConfigStore::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
