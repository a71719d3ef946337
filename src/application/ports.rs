//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain`.

use std::process::{ExitStatus, Output};
use std::time::Duration;

use anyhow::Result;

use crate::domain::agent::{AgentHandle, AgentSpec, AgentStatus, Backend, LogRequest};

// ── Command Runner Port ───────────────────────────────────────────────────────

/// Abstracts process execution so infrastructure can be swapped or mocked.
///
/// Every control-plane call a manager makes goes through this port: one
/// spawned command, captured output, bounded timeout. On timeout the child
/// must be killed, not left orphaned.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run a program and capture its output.
    ///
    /// Implementations should delegate to `run_with_timeout` using the
    /// instance's configured default timeout.
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;

    /// Run a program with a custom timeout override.
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output>;

    /// Run a program with extra environment variables. Needed by backends
    /// whose control command is scoped by environment (pm2's `PM2_HOME`).
    async fn run_with_env(
        &self,
        program: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<Output>;

    /// Run a program with inherited stdio and no timeout, returning only its
    /// exit status. Used for streaming output directly to the caller (log
    /// follow mode); the child ends when the caller interrupts it.
    async fn run_status(
        &self,
        program: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<ExitStatus>;
}

// ── Health Probe Port ─────────────────────────────────────────────────────────

/// Optional fields an agent's health endpoint may report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub uptime_secs: Option<u64>,
    pub memory_mb: Option<f64>,
}

/// Short-timeout liveness probe against an agent's registered port. Probe
/// failure is not an error — it only leaves status fields unset.
#[allow(async_fn_in_trait)]
pub trait HealthProbe {
    async fn probe(&self, port: u16) -> Option<HealthReport>;
}

// ── Process Manager Port ──────────────────────────────────────────────────────

/// The one contract all three platform managers implement: install,
/// uninstall, start, stop, restart, status, fleet, logs.
///
/// Selected by the factory keyed on the detected backend — composition over
/// a shared interface, no inheritance hierarchy.
#[allow(async_fn_in_trait)]
pub trait ProcessManager {
    /// Which backend this manager drives.
    fn backend(&self) -> Backend;

    /// Render the spec into the backend's declarative config and register it.
    /// Safe to re-run; overwrites the previous config.
    async fn install(&self, spec: &AgentSpec) -> Result<()>;

    /// Stop (tolerating "not running") and remove the installed config.
    async fn uninstall(&self, name: &str) -> Result<()>;

    /// Launch an installed agent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::domain::AgentError::NotInstalled`] if no config
    /// exists for `name` — starting is never an implicit install.
    async fn start(&self, name: &str) -> Result<AgentHandle>;

    /// Stop a running agent, tolerating "not running".
    async fn stop(&self, name: &str) -> Result<()>;

    /// Kill and relaunch in one backend operation where the backend has one,
    /// avoiding a window where the service is unregistered.
    async fn restart(&self, name: &str) -> Result<()>;

    /// Fresh status snapshot. Never fails for an unknown name — that is the
    /// `Unknown` state.
    async fn status(&self, name: &str) -> Result<AgentStatus>;

    /// Status for every agent in the archon namespace on this host.
    async fn fleet(&self) -> Result<Vec<AgentStatus>>;

    /// Tail or follow the agent's logs, streaming to the caller's stdio.
    async fn logs(&self, name: &str, request: &LogRequest) -> Result<()>;
}
