//! Environment handling for the host configuration.
//!
//! - `${VAR_NAME}` references in the YAML text are substituted at load time
//!   (`$${VAR}` escapes to a literal `${VAR}`).
//! - `PLUGBUS_*` variables override individual settings after parsing.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::schema::HostConfig;

/// `${VAR}` or the escaped form `$${VAR}`.
static ENV_REF_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$?\$\{([A-Z_][A-Z0-9_]*)\}").unwrap());

pub const ENV_BIND_ADDRESS: &str = "PLUGBUS_BIND_ADDRESS";
pub const ENV_API_PORT: &str = "PLUGBUS_API_PORT";
pub const ENV_BUS_PORT: &str = "PLUGBUS_BUS_PORT";
pub const ENV_PLUGINS_DIR: &str = "PLUGBUS_PLUGINS_DIR";
pub const ENV_DATABASE_PATH: &str = "PLUGBUS_DATABASE_PATH";
pub const ENV_LOG_LEVEL: &str = "PLUGBUS_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "PLUGBUS_LOG_DIR";
pub const ENV_REQUEST_TIMEOUT: &str = "PLUGBUS_REQUEST_TIMEOUT_SECS";
pub const ENV_REGISTRATION_TIMEOUT: &str = "PLUGBUS_REGISTRATION_TIMEOUT_SECS";

/// Snapshot of the process environment.
pub fn process_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

/// Substitute `${VAR}` references. Unset or empty variables are an error.
pub fn substitute_env_refs(text: &str, env: &HashMap<String, String>) -> Result<String> {
    let mut missing = Vec::new();
    let out = ENV_REF_PATTERN.replace_all(text, |caps: &Captures<'_>| {
        let whole = &caps[0];
        let name = &caps[1];
        if whole.starts_with("$$") {
            return format!("${{{name}}}");
        }
        match env.get(name).filter(|v| !v.is_empty()) {
            Some(value) => value.clone(),
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        bail!("Missing env var(s) referenced in config: {}", missing.join(", "));
    }
    Ok(out.into_owned())
}

fn parse_var<T: std::str::FromStr>(env: &HashMap<String, String>, name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env.get(name)
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().parse::<T>().with_context(|| format!("Invalid value for {name}: {v}")))
        .transpose()
}

/// Apply `PLUGBUS_*` overrides on top of a parsed config.
pub fn apply_env_overrides(
    mut config: HostConfig,
    env: &HashMap<String, String>,
) -> Result<HostConfig> {
    if let Some(bind) = parse_var::<String>(env, ENV_BIND_ADDRESS)? {
        config.server.bind_address = bind;
    }
    if let Some(port) = parse_var::<u16>(env, ENV_API_PORT)? {
        config.server.port = port;
    }
    if let Some(port) = parse_var::<u16>(env, ENV_BUS_PORT)? {
        config.bus.port = port;
    }
    if let Some(secs) = parse_var::<u64>(env, ENV_REQUEST_TIMEOUT)? {
        config.bus.request_timeout_secs = secs;
    }
    if let Some(secs) = parse_var::<u64>(env, ENV_REGISTRATION_TIMEOUT)? {
        config.bus.registration_timeout_secs = secs;
    }
    if let Some(dir) = parse_var::<PathBuf>(env, ENV_PLUGINS_DIR)? {
        config.plugins.dir = dir;
    }
    if let Some(path) = parse_var::<PathBuf>(env, ENV_DATABASE_PATH)? {
        config.plugins.database_path = path;
    }
    if let Some(level) = parse_var::<String>(env, ENV_LOG_LEVEL)? {
        config.logging.level = level;
    }
    if let Some(dir) = parse_var::<PathBuf>(env, ENV_LOG_DIR)? {
        config.logging.dir = Some(dir);
    }
    Ok(config)
}
