//! The agent lifecycle verbs.
//!
//! Each verb validates caller input before any backend command is spawned,
//! then dispatches to the supplied [`ProcessManager`]. The crate root wraps
//! these with convenience functions that resolve the host's real manager.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::application::ports::ProcessManager;
use crate::domain::agent::{AgentHandle, AgentSpec, AgentStatus, LogRequest};
use crate::domain::error::AgentError;
use crate::domain::validate::{validate_name, validate_port};

/// Install (or re-install) and start an agent.
///
/// Install-then-start makes re-running this verb idempotent from the
/// caller's perspective: the config is rewritten and the process relaunched.
///
/// # Errors
///
/// Returns a validation error for a bad name, port, or missing script, or a
/// backend error from install/start.
pub async fn start(manager: &impl ProcessManager, spec: &AgentSpec) -> Result<AgentHandle> {
    let spec = validated(spec)?;
    manager.install(&spec).await?;
    let handle = manager.start(&spec.name).await?;
    info!(name = %spec.name, backend = %handle.backend, pid = ?handle.pid, "agent started");
    Ok(handle)
}

/// Stop a running agent. Stopping an already-stopped agent is not an error.
///
/// # Errors
///
/// Returns a validation error for a bad name or a backend error.
pub async fn stop(manager: &impl ProcessManager, name: &str) -> Result<()> {
    validate_name(name)?;
    manager.stop(name).await
}

/// Restart an agent in place.
///
/// # Errors
///
/// Returns a validation error for a bad name or a backend error.
pub async fn restart(manager: &impl ProcessManager, name: &str) -> Result<()> {
    validate_name(name)?;
    manager.restart(name).await
}

/// Fresh status snapshot for one agent. A name that was never installed
/// reports the `Unknown` state — this verb is safe to call speculatively.
///
/// # Errors
///
/// Returns a validation error for a bad name or a backend error.
pub async fn status(manager: &impl ProcessManager, name: &str) -> Result<AgentStatus> {
    validate_name(name)?;
    manager.status(name).await
}

/// Status for every installed agent in the archon namespace.
///
/// # Errors
///
/// Returns a backend error if the fleet listing cannot be obtained.
pub async fn fleet(manager: &impl ProcessManager) -> Result<Vec<AgentStatus>> {
    manager.fleet().await
}

/// Tail or follow an agent's logs, streaming to the caller's stdio.
///
/// # Errors
///
/// Returns a validation error for a bad name or a backend error.
pub async fn logs(manager: &impl ProcessManager, name: &str, request: &LogRequest) -> Result<()> {
    validate_name(name)?;
    manager.logs(name, request).await
}

/// Stop (tolerantly) and remove an agent's installed config.
///
/// # Errors
///
/// Returns a validation error for a bad name or a backend error.
pub async fn uninstall(manager: &impl ProcessManager, name: &str) -> Result<()> {
    validate_name(name)?;
    manager.uninstall(name).await?;
    info!(name, "agent uninstalled");
    Ok(())
}

/// Validate a spec and normalize its script to an absolute path.
fn validated(spec: &AgentSpec) -> Result<AgentSpec> {
    validate_name(&spec.name)?;
    validate_port(spec.port)?;
    let script = resolve_script(spec)?;
    let mut normalized = spec.clone();
    normalized.script = script;
    Ok(normalized)
}

/// Resolve the script relative to the spec's working directory (or the
/// caller's directory) and require that it exists.
fn resolve_script(spec: &AgentSpec) -> Result<PathBuf> {
    let resolved = if spec.script.is_absolute() {
        spec.script.clone()
    } else {
        let base = match &spec.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("resolving current directory")?,
        };
        base.join(&spec.script)
    };
    if !resolved.exists() {
        return Err(AgentError::ScriptNotFound(resolved).into());
    }
    // Canonicalize so the rendered config survives the caller's cwd changing.
    Ok(resolved.canonicalize().unwrap_or(resolved))
}
