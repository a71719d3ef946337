//! Pure input validation — no I/O, no async.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;

use crate::domain::error::AgentError;

/// Checked before the name is interpolated into any path or service
/// identifier, so a hostile name can never escape the registry directory.
pub static AGENT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Safety: this is a compile-time constant pattern — cannot fail.
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*$").expect("valid regex")
});

/// Upper bound on agent name length. Keeps every derived identifier well
/// under systemd's unit-name limit.
pub const MAX_NAME_LEN: usize = 64;

/// Lowest port the facade accepts; everything below is privileged.
pub const MIN_PORT: u16 = 1024;

/// Returns `true` if `name` is a valid agent name: alphanumeric start,
/// alphanumeric-or-hyphen tail, 1–64 characters.
#[must_use]
pub fn is_valid_agent_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN && AGENT_NAME_RE.is_match(name)
}

/// Validate an agent name.
///
/// # Errors
///
/// Returns [`AgentError::InvalidName`] if the name fails the charset or
/// length rule.
pub fn validate_name(name: &str) -> Result<()> {
    if is_valid_agent_name(name) {
        Ok(())
    } else {
        Err(AgentError::InvalidName(name.to_string()).into())
    }
}

/// Validate an optional agent port against the registered/ephemeral band.
///
/// # Errors
///
/// Returns [`AgentError::InvalidPort`] for privileged ports.
pub fn validate_port(port: Option<u16>) -> Result<()> {
    match port {
        Some(p) if p < MIN_PORT => Err(AgentError::InvalidPort(p).into()),
        _ => Ok(()),
    }
}
