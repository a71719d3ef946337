//! Archon — lifecycle supervision for long-lived AI agent processes.
//!
//! One platform-independent contract for installing, starting, stopping,
//! restarting, inspecting, and tailing a background agent process, translated
//! into the native primitives of whichever service manager the host provides:
//! launchd user agents on macOS, systemd user units on Linux, or an isolated
//! pm2 instance everywhere else (including WSL).
//!
//! Callers build an [`AgentSpec`] and go through the `agent_*` verbs below;
//! everything under them is backend plumbing. The generic forms in
//! [`application::services::agents`] accept any [`application::ports::ProcessManager`]
//! for testing.

#![cfg_attr(test, allow(clippy::expect_used))]

pub mod application;
pub mod domain;
pub mod infra;

use anyhow::Result;

use application::services::agents;
pub use domain::agent::{
    AgentHandle, AgentSpec, AgentState, AgentStatus, Backend, LogChannel, LogRequest,
};
pub use infra::manager::{PlatformManager, manager};

/// Install (or re-install) and start an agent on this host's backend.
///
/// # Errors
///
/// Returns a validation error for a bad name, port, or missing script, a
/// detection error if no interpreter is found, or a backend error.
pub async fn agent_start(spec: &AgentSpec) -> Result<AgentHandle> {
    agents::start(&manager()?, spec).await
}

/// Stop a running agent. Stopping an already-stopped agent is not an error.
///
/// # Errors
///
/// Returns a validation error for a bad name or a backend error.
pub async fn agent_stop(name: &str) -> Result<()> {
    agents::stop(&manager()?, name).await
}

/// Restart an agent in place.
///
/// # Errors
///
/// Returns a validation error for a bad name or a backend error.
pub async fn agent_restart(name: &str) -> Result<()> {
    agents::restart(&manager()?, name).await
}

/// Fresh status snapshot for one agent; `Unknown` if it was never installed.
///
/// # Errors
///
/// Returns a validation error for a bad name or a backend error.
pub async fn agent_status(name: &str) -> Result<AgentStatus> {
    agents::status(&manager()?, name).await
}

/// Status for every installed agent in the archon namespace on this host.
///
/// # Errors
///
/// Returns a backend error if the fleet listing cannot be obtained.
pub async fn agent_fleet() -> Result<Vec<AgentStatus>> {
    agents::fleet(&manager()?).await
}

/// Tail or follow an agent's logs, streaming to this process's stdio.
///
/// # Errors
///
/// Returns a validation error for a bad name or a backend error.
pub async fn agent_logs(name: &str, request: &LogRequest) -> Result<()> {
    agents::logs(&manager()?, name, request).await
}

/// Stop (tolerantly) and remove an agent's installed config.
///
/// # Errors
///
/// Returns a validation error for a bad name or a backend error.
pub async fn agent_uninstall(name: &str) -> Result<()> {
    agents::uninstall(&manager()?, name).await
}
