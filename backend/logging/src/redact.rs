//! Log Redaction
//!
//! Scrubs bearer tokens, API keys and passwords from plugin output before it
//! reaches the logs.

use regex::Regex;
use std::sync::LazyLock;

static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Bearer\s+[a-zA-Z0-9\-\._~+/]+=*").unwrap());
static API_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(sk-[a-zA-Z0-9]{32,})|((?i)api[_-]?key[=:]\s*)[^\s&,;]+").unwrap()
});
static PASSWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"((?i)password[=:]\s*)[^\s&,;]+").unwrap());

/// Redacts sensitive patterns in a string.
pub fn redact_sensitive_data(input: &str) -> String {
    let redacted = BEARER_RE.replace_all(input, "Bearer [REDACTED_TOKEN]");
    let redacted = API_KEY_RE.replace_all(&redacted, |caps: &regex::Captures<'_>| {
        match caps.get(2) {
            Some(prefix) => format!("{}[REDACTED_KEY]", prefix.as_str()),
            None => "[REDACTED_KEY]".to_string(),
        }
    });
    PASSWORD_RE
        .replace_all(&redacted, "${1}[REDACTED]")
        .into_owned()
}
