//! Plugin lifecycle manager.
//!
//! Owns plugin configuration (memory, `plugins.json`, SQLite) and the child
//! processes. All runtime-state changes go through the hub so observers see
//! them as events.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use plugbus_core::{
    BusError, BusResult, HubEvent, LogEntry, PluginConfig, PluginRuntimeState, PluginStatus,
    TelemetrySnapshot,
};
use plugbus_hub::Hub;
use plugbus_logging::redact_sensitive_data;

use crate::config_file::{self, CONFIG_FILE_NAME};
use crate::process::{OutputStream, PluginProcess, ProcessEvent, ProcessLauncher, SpawnSpec};
use crate::store::ConfigStore;

pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOG_LIMIT: usize = 200;
pub const MAX_LOG_LIMIT: usize = 500;

/// Bus port the plugin must connect to.
pub const ENV_BUS_PORT: &str = "PLUGBUS_BUS_PORT";
/// Name the plugin must register under.
pub const ENV_PLUGIN_NAME: &str = "PLUGBUS_PLUGIN_NAME";
pub const ENV_DATABASE_PATH: &str = "PLUGBUS_DATABASE_PATH";

/// `0` means the default; anything above the ring size is capped.
pub fn clamp_log_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_LOG_LIMIT,
        n => n.min(MAX_LOG_LIMIT),
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Root holding one directory per plugin plus `plugins.json`.
    pub plugins_dir: PathBuf,
    /// Exposed to plugins through `PLUGBUS_DATABASE_PATH`.
    pub database_path: PathBuf,
    pub registration_timeout: Duration,
}

impl ManagerOptions {
    pub fn new(plugins_dir: impl Into<PathBuf>, database_path: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            database_path: database_path.into(),
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.plugins_dir.join(CONFIG_FILE_NAME)
    }
}

struct TrackedProcess {
    process: Box<dyn PluginProcess>,
    /// Fired when this exact process is released; wakes a pending start.
    released: Option<oneshot::Sender<()>>,
}

pub struct PluginManager {
    hub: Hub,
    launcher: Arc<dyn ProcessLauncher>,
    store: Arc<dyn ConfigStore>,
    options: ManagerOptions,
    configs: RwLock<BTreeMap<String, PluginConfig>>,
    processes: Mutex<HashMap<String, TrackedProcess>>,
    process_events: mpsc::UnboundedSender<ProcessEvent>,
}

impl PluginManager {
    /// Build a manager and start its process-event watcher. Requires a
    /// running tokio runtime.
    pub fn new(
        hub: Hub,
        launcher: Arc<dyn ProcessLauncher>,
        store: Arc<dyn ConfigStore>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            hub,
            launcher,
            store,
            options,
            configs: RwLock::new(BTreeMap::new()),
            processes: Mutex::new(HashMap::new()),
            process_events: tx,
        });
        tokio::spawn(watch_processes(Arc::downgrade(&manager), rx));
        manager
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    // --- startup / shutdown --------------------------------------------------

    /// Load configuration and kick off autostart plugins.
    ///
    /// The store is authoritative; `plugins.json` is read only when the store
    /// is empty. Every known plugin gets a `stopped` runtime entry before any
    /// autostart begins. Autostart failures are logged, not returned.
    pub async fn init(self: &Arc<Self>) -> BusResult<()> {
        tokio::fs::create_dir_all(&self.options.plugins_dir)
            .await
            .map_err(|e| BusError::Storage(format!("create plugins dir: {e}")))?;
        let config_path = self.options.config_file();
        config_file::ensure_config_file(&config_path)
            .await
            .map_err(|e| BusError::Storage(format!("{e:#}")))?;

        let mut configs = self.store.load_all().map_err(storage_error)?;
        if configs.is_empty() {
            configs = match config_file::read_configs(&config_path).await {
                Ok(configs) => configs,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Failed to read plugin configuration");
                    Vec::new()
                }
            };
        }

        {
            let mut table = self.configs.write().await;
            for config in &configs {
                table.insert(config.name.clone(), config.clone());
            }
        }

        for config in &configs {
            self.hub.ensure_state(&config.name, config).await;
            self.hub.set_config(&config.name, config.clone()).await;
            self.store.upsert(config).map_err(storage_error)?;
        }
        info!(count = configs.len(), "Loaded plugin configurations");

        for config in configs.into_iter().filter(|c| c.autostart) {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = manager.start_plugin(&config.name).await {
                    error!(plugin = %config.name, error = %e, "Failed to auto-start plugin");
                }
            });
        }
        Ok(())
    }

    /// Stop every tracked process.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_plugin(&name).await {
                warn!(plugin = %name, error = %e, "Failed to stop plugin during shutdown");
            }
        }
        info!("Plugin manager shut down");
    }

    // --- queries -------------------------------------------------------------

    /// Runtime states merged with configs that have no runtime entry yet.
    pub async fn list_plugins(&self) -> Vec<PluginRuntimeState> {
        let mut states: BTreeMap<String, PluginRuntimeState> = self
            .hub
            .plugins()
            .await
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        for (name, config) in self.configs.read().await.iter() {
            states
                .entry(name.clone())
                .or_insert_with(|| PluginRuntimeState::stopped(config.clone()));
        }
        states.into_values().collect()
    }

    pub async fn get_plugin(&self, name: &str) -> Option<PluginRuntimeState> {
        if let Some(state) = self.hub.plugin(name).await {
            return Some(state);
        }
        self.configs
            .read()
            .await
            .get(name)
            .map(|config| PluginRuntimeState::stopped(config.clone()))
    }

    pub async fn get_config(&self, name: &str) -> Option<PluginConfig> {
        self.configs.read().await.get(name).cloned()
    }

    /// Pid of the process currently tracked for `name`.
    pub async fn tracked_pid(&self, name: &str) -> Option<u32> {
        self.processes
            .lock()
            .await
            .get(name)
            .map(|t| t.process.pid())
    }

    pub async fn get_logs(&self, name: &str, limit: usize) -> Vec<LogEntry> {
        self.hub.logs(name, clamp_log_limit(limit)).await
    }

    pub async fn get_telemetry(&self, name: &str) -> Option<TelemetrySnapshot> {
        self.hub.telemetry(name).await
    }

    pub async fn telemetry_summary(&self) -> Vec<TelemetrySnapshot> {
        self.hub.all_telemetry().await
    }

    // --- lifecycle -----------------------------------------------------------

    /// Launch the plugin and wait for it to register on the bus.
    ///
    /// On any failure the process is killed and the runtime state is left
    /// `stopped`.
    pub async fn start_plugin(&self, name: &str) -> BusResult<PluginRuntimeState> {
        // Subscribe before spawning so an early registration is not missed.
        let mut events = self.hub.subscribe();

        let (pid, mut released) = {
            let mut processes = self.processes.lock().await;
            if processes.contains_key(name) {
                return Err(BusError::AlreadyRunning(name.to_string()));
            }
            let config = self
                .get_config(name)
                .await
                .ok_or_else(|| BusError::ConfigMissing(name.to_string()))?;

            let plugin_dir = self.options.plugins_dir.join(name);
            let entrypoint = plugin_dir.join(&config.entrypoint);
            if !entrypoint.exists() {
                return Err(BusError::EntrypointMissing(entrypoint));
            }

            let spec = SpawnSpec {
                plugin: name.to_string(),
                program: entrypoint,
                args: config.args.clone(),
                cwd: plugin_dir,
                env: self.spawn_env(name, &config)?,
            };

            self.hub.ensure_state(name, &config).await;
            self.hub.set_config(name, config).await;

            let process = match self.launcher.spawn(spec, self.process_events.clone()) {
                Ok(process) => process,
                Err(e) => {
                    let message = format!("{e:#}");
                    error!(plugin = %name, error = %message, "Failed to launch plugin");
                    self.reset_stopped(name, None).await;
                    return Err(BusError::Process {
                        plugin: name.to_string(),
                        message,
                    });
                }
            };
            let pid = process.pid();
            let (released_tx, released_rx) = oneshot::channel();
            processes.insert(
                name.to_string(),
                TrackedProcess {
                    process,
                    released: Some(released_tx),
                },
            );
            (pid, released_rx)
        };

        self.hub
            .update_state(name, |state| {
                state.status = PluginStatus::Starting;
                state.pid = Some(pid);
                state.error = None;
            })
            .await;
        info!(plugin = %name, pid, "Started plugin process");

        match self
            .wait_for_registration(name, pid, &mut events, &mut released)
            .await
        {
            Ok(registered) => {
                // A registration racing the `starting` update must not leave
                // the plugin looking half started.
                if self.hub.is_connected(name).await {
                    self.hub
                        .update_state(name, |state| {
                            state.status = PluginStatus::Running;
                            state.pid = Some(pid);
                        })
                        .await;
                }
                Ok(self.hub.plugin(name).await.unwrap_or(registered))
            }
            Err(e) => {
                error!(plugin = %name, pid, error = %e, "Plugin failed to come up");
                self.release(name, pid, true).await;
                Err(e)
            }
        }
    }

    async fn wait_for_registration(
        &self,
        name: &str,
        pid: u32,
        events: &mut broadcast::Receiver<HubEvent>,
        released: &mut oneshot::Receiver<()>,
    ) -> BusResult<PluginRuntimeState> {
        let wait = async {
            loop {
                let event = tokio::select! {
                    outcome = &mut *released => {
                        let message = match outcome {
                            Ok(()) => format!("process {pid} exited before registering"),
                            Err(_) => format!("process {pid} was stopped before registering"),
                        };
                        return Err(BusError::Process {
                            plugin: name.to_string(),
                            message,
                        });
                    }
                    event = events.recv() => event,
                };
                match event {
                    Ok(HubEvent::Registered(state)) if state.name == name => return Ok(state),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(plugin = %name, skipped, "Missed hub events while starting");
                        if self.hub.is_connected(name).await {
                            if let Some(state) = self.hub.plugin(name).await {
                                return Ok(state);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BusError::ShuttingDown);
                    }
                }
            }
        };
        tokio::time::timeout(self.options.registration_timeout, wait)
            .await
            .unwrap_or_else(|_| Err(BusError::RegistrationTimeout(name.to_string())))
    }

    /// Signal the tracked process (if any) and mark the plugin stopped.
    pub async fn stop_plugin(&self, name: &str) -> BusResult<()> {
        let tracked = self.processes.lock().await.remove(name);
        let Some(tracked) = tracked else {
            debug!(plugin = %name, "Stop requested for plugin with no process");
            return Ok(());
        };
        let pid = tracked.process.pid();
        tracked.process.terminate();
        self.reset_stopped(name, Some(pid)).await;
        info!(plugin = %name, pid, "Stopped plugin");
        Ok(())
    }

    /// Stop then start. A failed start leaves the plugin stopped.
    pub async fn restart_plugin(&self, name: &str) -> BusResult<PluginRuntimeState> {
        self.stop_plugin(name).await?;
        self.start_plugin(name).await
    }

    pub async fn invoke_capability(
        &self,
        name: &str,
        capability: &str,
        payload: Value,
        token: Option<String>,
    ) -> BusResult<Value> {
        self.hub.request(name, capability, payload, token).await
    }

    // --- configuration -------------------------------------------------------

    /// Replace a plugin's configuration everywhere it lives.
    pub async fn save_config(&self, config: PluginConfig) -> BusResult<()> {
        let name = config.name.clone();
        let all: Vec<PluginConfig> = {
            let mut table = self.configs.write().await;
            table.insert(name.clone(), config.clone());
            table.values().cloned().collect()
        };

        self.hub.ensure_state(&name, &config).await;
        self.hub.set_config(&name, config.clone()).await;

        config_file::write_configs(&self.options.config_file(), &all)
            .await
            .map_err(|e| BusError::Storage(format!("{e:#}")))?;
        self.store.upsert(&config).map_err(storage_error)?;
        info!(plugin = %name, "Saved plugin configuration");
        Ok(())
    }

    /// `save_config` for an existing name; the body's name must match.
    pub async fn update_config(
        &self,
        name: &str,
        config: PluginConfig,
    ) -> BusResult<PluginRuntimeState> {
        if config.name != name {
            return Err(BusError::NameMismatch {
                expected: name.to_string(),
                found: config.name,
            });
        }
        self.save_config(config).await?;
        self.get_plugin(name)
            .await
            .ok_or_else(|| BusError::ConfigMissing(name.to_string()))
    }

    // --- internals -----------------------------------------------------------

    fn spawn_env(&self, name: &str, config: &PluginConfig) -> BusResult<BTreeMap<String, String>> {
        let mut env = config.env.clone();
        // Bus variables always win over plugin-specific values.
        env.insert(ENV_BUS_PORT.to_string(), self.hub.port()?.to_string());
        env.insert(ENV_PLUGIN_NAME.to_string(), name.to_string());
        env.insert(
            ENV_DATABASE_PATH.to_string(),
            self.options.database_path.display().to_string(),
        );
        Ok(env)
    }

    /// Mark `name` stopped, unless its state already belongs to another pid.
    async fn reset_stopped(&self, name: &str, pid: Option<u32>) {
        let Some(current) = self.hub.plugin(name).await else {
            return;
        };
        if current.pid.is_some() && pid.is_some() && current.pid != pid {
            debug!(plugin = %name, ?pid, current = ?current.pid, "State belongs to a newer process");
            return;
        }
        self.hub
            .update_state(name, |state| {
                state.status = PluginStatus::Stopped;
                state.pid = None;
            })
            .await;
    }

    /// Forget the process with `pid` (killing it if asked) and reset state.
    async fn release(&self, name: &str, pid: u32, kill: bool) {
        let tracked = {
            let mut processes = self.processes.lock().await;
            match processes.get(name) {
                Some(t) if t.process.pid() == pid => processes.remove(name),
                Some(_) => {
                    debug!(plugin = %name, pid, "Ignoring stale process");
                    return;
                }
                None => None,
            }
        };
        if let Some(mut tracked) = tracked {
            if kill {
                tracked.process.kill();
            }
            if let Some(released) = tracked.released.take() {
                let _ = released.send(());
            }
        }
        self.reset_stopped(name, Some(pid)).await;
    }

    async fn on_process_event(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Output {
                plugin,
                stream,
                line,
            } => {
                let line = redact_sensitive_data(line.trim_end());
                match stream {
                    OutputStream::Stdout => info!(plugin = %plugin, "{line}"),
                    OutputStream::Stderr => warn!(plugin = %plugin, "{line}"),
                }
            }
            ProcessEvent::Exited { plugin, pid, code } => {
                warn!(plugin = %plugin, pid, ?code, "Plugin exited");
                self.release(&plugin, pid, false).await;
            }
            ProcessEvent::Failed { plugin, pid, error } => {
                error!(plugin = %plugin, pid, error = %error, "Plugin process error");
                self.release(&plugin, pid, true).await;
            }
        }
    }
}

async fn watch_processes(
    manager: Weak<PluginManager>,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.on_process_event(event).await;
    }
}

fn storage_error(e: anyhow::Error) -> BusError {
    BusError::Storage(format!("{e:#}"))
}
