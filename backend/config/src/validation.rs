//! Config validation with field paths in every message.

use std::net::IpAddr;

use thiserror::Error;

use crate::schema::HostConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A config validation problem at a field path.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

pub fn validate(config: &HostConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.server.bind_address.parse::<IpAddr>().is_err() {
        report.error(
            "server.bind_address",
            format!("'{}' is not an IP address", config.server.bind_address),
        );
    }
    if config.server.port != 0 && config.server.port == config.bus.port {
        report.error(
            "bus.port",
            format!("conflicts with server.port ({})", config.server.port),
        );
    }
    if config.bus.request_timeout_secs == 0 {
        report.error("bus.request_timeout_secs", "must be greater than 0");
    }
    if config.bus.registration_timeout_secs == 0 {
        report.error("bus.registration_timeout_secs", "must be greater than 0");
    }
    if config.plugins.dir.as_os_str().is_empty() {
        report.error("plugins.dir", "must not be empty");
    }
    if config.plugins.database_path.as_os_str().is_empty() {
        report.error("plugins.database_path", "must not be empty");
    }
    // Full EnvFilter directives are allowed; only bare words are checked.
    let level = config.logging.level.trim();
    if !level.contains(['=', ',']) && !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        report.warn(
            "logging.level",
            format!("unknown level '{level}'; expected one of {}", LOG_LEVELS.join(", ")),
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_defaults_are_valid() {
        let report = validate(&HostConfig::default());
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_zero_timeouts_and_empty_paths() {
        let mut config = HostConfig::default();
        config.bus.request_timeout_secs = 0;
        config.bus.registration_timeout_secs = 0;
        config.plugins.dir = PathBuf::new();
        let report = validate(&config);
        let paths: Vec<_> = report.errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["bus.request_timeout_secs", "bus.registration_timeout_secs", "plugins.dir"]
        );
    }

    #[test]
    fn test_bind_address_must_be_ip() {
        let mut config = HostConfig::default();
        config.server.bind_address = "localhost".into();
        let report = validate(&config);
        assert_eq!(report.errors[0].path, "server.bind_address");
    }

    #[test]
    fn test_port_conflict() {
        let mut config = HostConfig::default();
        config.bus.port = config.server.port;
        assert!(!validate(&config).is_valid());
    }

    #[test]
    fn test_log_level_warning() {
        let mut config = HostConfig::default();
        config.logging.level = "loud".into();
        let report = validate(&config);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);

        config.logging.level = "info,plugbus_hub=debug".into();
        assert!(validate(&config).warnings.is_empty());
    }
}
