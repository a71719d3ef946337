//! Backend factory — resolves the `ProcessManager` for this host.
//!
//! One interface, three implementations, selected by the detector. The
//! `ProcessManager` port uses native `async fn`s and so is not dyn-safe;
//! an enum with match-delegation does the strategy dispatch instead of a
//! trait object.

use anyhow::Result;
use tracing::debug;

use crate::application::ports::ProcessManager;
use crate::domain::agent::{AgentHandle, AgentSpec, AgentStatus, Backend, LogRequest};
use crate::infra::command_runner::TokioCommandRunner;
use crate::infra::detect::detect_backend;
use crate::infra::launchd::LaunchdManager;
use crate::infra::paths::BasePaths;
use crate::infra::pm2::Pm2Manager;
use crate::infra::probe::UreqHealthProbe;
use crate::infra::systemd::SystemdManager;

/// The manager for whichever backend the host provides.
pub enum PlatformManager {
    Launchd(LaunchdManager<TokioCommandRunner, UreqHealthProbe>),
    Systemd(SystemdManager<TokioCommandRunner>),
    Pm2(Pm2Manager<TokioCommandRunner>),
}

/// Construct the manager for this host. Cheap — no memoization needed.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn manager() -> Result<PlatformManager> {
    let paths = BasePaths::resolve()?;
    let backend = detect_backend();
    debug!(%backend, "selected process-manager backend");
    Ok(match backend {
        Backend::Launchd => PlatformManager::Launchd(LaunchdManager::with_defaults(paths)),
        Backend::Systemd => PlatformManager::Systemd(SystemdManager::with_defaults(paths)),
        Backend::Pm2 => PlatformManager::Pm2(Pm2Manager::with_defaults(paths)),
    })
}

impl ProcessManager for PlatformManager {
    fn backend(&self) -> Backend {
        match self {
            Self::Launchd(m) => m.backend(),
            Self::Systemd(m) => m.backend(),
            Self::Pm2(m) => m.backend(),
        }
    }

    async fn install(&self, spec: &AgentSpec) -> Result<()> {
        match self {
            Self::Launchd(m) => m.install(spec).await,
            Self::Systemd(m) => m.install(spec).await,
            Self::Pm2(m) => m.install(spec).await,
        }
    }

    async fn uninstall(&self, name: &str) -> Result<()> {
        match self {
            Self::Launchd(m) => m.uninstall(name).await,
            Self::Systemd(m) => m.uninstall(name).await,
            Self::Pm2(m) => m.uninstall(name).await,
        }
    }

    async fn start(&self, name: &str) -> Result<AgentHandle> {
        match self {
            Self::Launchd(m) => m.start(name).await,
            Self::Systemd(m) => m.start(name).await,
            Self::Pm2(m) => m.start(name).await,
        }
    }

    async fn stop(&self, name: &str) -> Result<()> {
        match self {
            Self::Launchd(m) => m.stop(name).await,
            Self::Systemd(m) => m.stop(name).await,
            Self::Pm2(m) => m.stop(name).await,
        }
    }

    async fn restart(&self, name: &str) -> Result<()> {
        match self {
            Self::Launchd(m) => m.restart(name).await,
            Self::Systemd(m) => m.restart(name).await,
            Self::Pm2(m) => m.restart(name).await,
        }
    }

    async fn status(&self, name: &str) -> Result<AgentStatus> {
        match self {
            Self::Launchd(m) => m.status(name).await,
            Self::Systemd(m) => m.status(name).await,
            Self::Pm2(m) => m.status(name).await,
        }
    }

    async fn fleet(&self) -> Result<Vec<AgentStatus>> {
        match self {
            Self::Launchd(m) => m.fleet().await,
            Self::Systemd(m) => m.fleet().await,
            Self::Pm2(m) => m.fleet().await,
        }
    }

    async fn logs(&self, name: &str, request: &LogRequest) -> Result<()> {
        match self {
            Self::Launchd(m) => m.logs(name, request).await,
            Self::Systemd(m) => m.logs(name, request).await,
            Self::Pm2(m) => m.logs(name, request).await,
        }
    }
}
