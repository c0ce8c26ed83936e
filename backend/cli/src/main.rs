mod client;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use plugbus_config::{HostConfig, load_and_prepare, process_env};
use plugbus_gateway::{GatewayState, start_server};
use plugbus_hub::{Hub, HubConfig};
use plugbus_logging::init_logger;
use plugbus_supervisor::{ManagerOptions, NativeLauncher, PluginManager, SqliteConfigStore};

use client::ApiClient;

#[derive(Parser)]
#[command(name = "plugbus")]
#[command(about = "plugbus: plugin orchestration bus")]
#[command(version)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, global = true, default_value = plugbus_config::CONFIG_FILE_NAME)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the plugin bus, lifecycle manager and admin API
    Serve {
        /// Port for the admin API and observer socket
        #[arg(short, long)]
        port: Option<u16>,
        /// Port plugins connect to (0 picks a free port)
        #[arg(long)]
        bus_port: Option<u16>,
    },
    /// Query a running host's health endpoint
    Status,
    /// Manage plugins on a running host
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },
}

#[derive(Subcommand)]
enum PluginAction {
    /// List plugins and their runtime state
    List,
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    /// Show recent log entries
    Logs {
        name: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Invoke a capability with a JSON payload
    Invoke {
        name: String,
        capability: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Bearer token forwarded to the plugin
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_and_prepare(&cli.config, &process_env()).await?;

    match cli.command {
        Commands::Serve { port, bus_port } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bus_port) = bus_port {
                config.bus.port = bus_port;
            }
            run_server(config).await?;
        }
        Commands::Status => {
            let client = ApiClient::local(config.server.port);
            match client.get("/api/health").await {
                Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
                Err(_) => println!("plugbus is not running on port {}", config.server.port),
            }
        }
        Commands::Plugins { action } => {
            let client = ApiClient::local(config.server.port);
            let body = match action {
                PluginAction::List => client.get("/api/plugins").await?,
                PluginAction::Start { name } => {
                    client.post(&format!("/api/plugins/{name}/start"), None, None).await?
                }
                PluginAction::Stop { name } => {
                    client.post(&format!("/api/plugins/{name}/stop"), None, None).await?
                }
                PluginAction::Restart { name } => {
                    client.post(&format!("/api/plugins/{name}/restart"), None, None).await?
                }
                PluginAction::Logs { name, limit } => {
                    let path = match limit {
                        Some(limit) => format!("/api/plugins/{name}/logs?limit={limit}"),
                        None => format!("/api/plugins/{name}/logs"),
                    };
                    client.get(&path).await?
                }
                PluginAction::Invoke {
                    name,
                    capability,
                    payload,
                    token,
                } => {
                    let payload: serde_json::Value =
                        serde_json::from_str(&payload).context("--payload must be valid JSON")?;
                    client
                        .post(
                            &format!("/api/plugins/{name}/invoke/{capability}"),
                            Some(payload),
                            token.as_deref(),
                        )
                        .await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}

async fn run_server(config: HostConfig) -> Result<()> {
    init_logger(config.logging.dir.as_deref(), &config.logging.level);
    info!(
        port = config.server.port,
        bind = %config.server.bind_address,
        bus_port = config.bus.port,
        plugins_dir = %config.plugins.dir.display(),
        db = %config.plugins.database_path.display(),
        "Starting plugbus"
    );

    let ip: IpAddr = config
        .server
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind_address))?;

    let store = Arc::new(SqliteConfigStore::open(&config.plugins.database_path)?);

    let hub = Hub::new(HubConfig {
        request_timeout: config.bus.request_timeout(),
        ..HubConfig::default()
    });
    let (bus_addr, bus_task) = hub.listen(SocketAddr::new(ip, config.bus.port)).await?;
    info!(addr = %bus_addr, "Plugin bus ready");

    let options = ManagerOptions {
        registration_timeout: config.bus.registration_timeout(),
        ..ManagerOptions::new(&config.plugins.dir, &config.plugins.database_path)
    };
    let manager = PluginManager::new(hub.clone(), Arc::new(NativeLauncher), store, options);
    manager.init().await?;

    let state = GatewayState::new(manager.clone());
    let served = start_server(SocketAddr::new(ip, config.server.port), state, shutdown_signal()).await;

    info!("Shutting down");
    manager.shutdown().await;
    hub.shutdown().await;
    if let Err(e) = bus_task.await {
        error!(error = %e, "Plugin bus task failed");
    }
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
}
