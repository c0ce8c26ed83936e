use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the plugin bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Plugin {0} is not connected")]
    NotConnected(String),

    #[error("Request to {0} timed out")]
    RequestTimeout(String),

    #[error("Plugin {0} did not register before timeout")]
    RegistrationTimeout(String),

    #[error("Server shutting down")]
    ShuttingDown,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("No configuration for plugin {0}")]
    ConfigMissing(String),

    #[error("Entrypoint {} does not exist", .0.display())]
    EntrypointMissing(PathBuf),

    #[error("Plugin name mismatch: expected {expected}, got {found}")]
    NameMismatch { expected: String, found: String },

    #[error("Plugin {0} already running")]
    AlreadyRunning(String),

    #[error("Plugin {plugin} process error: {message}")]
    Process { plugin: String, message: String },

    /// The plugin answered with `success: false`.
    #[error("{0}")]
    Remote(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BusError {
    /// True for failures caused by a caller-supplied configuration rather
    /// than by the runtime.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BusError::ConfigMissing(_)
                | BusError::EntrypointMissing(_)
                | BusError::NameMismatch { .. }
                | BusError::AlreadyRunning(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BusError::RequestTimeout(_) | BusError::RegistrationTimeout(_)
        )
    }
}

pub type BusResult<T> = Result<T, BusError>;
