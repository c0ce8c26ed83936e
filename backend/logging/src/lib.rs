//! Structured logging for the plugin bus.
//!
//! Console output, optional rolling NDJSON files, and redaction of secrets
//! found in plugin output.

pub mod logger;
pub mod redact;

pub use logger::init_logger;
pub use redact::redact_sensitive_data;
