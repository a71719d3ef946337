//! Agent data model: start specification, handle, status snapshot.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix for launchd labels, e.g. `com.archon.scout`.
pub const LAUNCHD_LABEL_PREFIX: &str = "com.archon.";

/// Prefix for systemd unit names and pm2 process names, e.g. `archon-scout`.
pub const SERVICE_NAME_PREFIX: &str = "archon-";

/// Everything needed to install and launch one agent process.
///
/// Supplied once at install time; immutable thereafter except by
/// re-installing. The rendered backend config is the durable record of this
/// spec — there is no separate registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique name within the archon namespace.
    pub name: String,
    /// Path to the agent script, resolved to an absolute path at install.
    pub script: PathBuf,
    /// Port the agent listens on, injected as `ARCHON_PORT`.
    pub port: Option<u16>,
    /// Extra environment variables for the agent process. A `BTreeMap` so
    /// rendered configs are deterministic across installs.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory; the caller's current directory when `None`.
    pub cwd: Option<PathBuf>,
    /// Restart the process when it exits unsuccessfully.
    pub restart: bool,
    /// Restart budget before the backend gives up.
    pub max_restarts: u32,
    /// Delay between automatic restarts.
    pub restart_backoff: Duration,
    /// Memory ceiling in megabytes, where the backend supports one.
    pub memory_limit_mb: Option<u64>,
    /// Log directory override; `<data_dir>/logs` when `None`.
    pub log_dir: Option<PathBuf>,
}

impl AgentSpec {
    /// A spec with the default policy: restart on failure, up to 10 times,
    /// 5 seconds apart.
    #[must_use]
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            port: None,
            env: BTreeMap::new(),
            cwd: None,
            restart: true,
            max_restarts: 10,
            restart_backoff: Duration::from_secs(5),
            memory_limit_mb: None,
            log_dir: None,
        }
    }
}

/// Which host service manager a manager instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    Launchd,
    Systemd,
    Pm2,
}

impl Backend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launchd => "launchd",
            Self::Systemd => "systemd",
            Self::Pm2 => "pm2",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by `start`. Transient — if the process later dies this handle is
/// stale; re-query status instead of holding onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHandle {
    pub name: String,
    /// `None` when the backend had not reported a PID before the start poll
    /// timed out (the service may still be warming up).
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub backend: Backend,
}

/// Observed liveness of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Online,
    Stopped,
    Errored,
    Unknown,
}

impl AgentState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time status snapshot, computed fresh on every query. The backend
/// is the sole source of truth; nothing here is cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub name: String,
    pub state: AgentState,
    pub pid: Option<u32>,
    /// Human-scaled, e.g. `"42.3 MiB"`. Absent when the backend does not
    /// report memory.
    pub memory: Option<String>,
    pub uptime: Option<String>,
    pub restarts: Option<u32>,
    pub backend: Backend,
}

impl AgentStatus {
    /// Snapshot for a name with no installed config.
    #[must_use]
    pub fn unknown(name: impl Into<String>, backend: Backend) -> Self {
        Self {
            name: name.into(),
            state: AgentState::Unknown,
            pid: None,
            memory: None,
            uptime: None,
            restarts: None,
            backend,
        }
    }
}

/// Which log stream(s) a log request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogChannel {
    Stdout,
    Stderr,
    #[default]
    Both,
}

/// Parameters for a `logs` call.
#[derive(Debug, Clone, Copy)]
pub struct LogRequest {
    /// How many trailing lines to show before (optionally) following.
    pub lines: usize,
    /// Stream continuously until the caller interrupts.
    pub follow: bool,
    pub channel: LogChannel,
}

impl Default for LogRequest {
    fn default() -> Self {
        Self {
            lines: 50,
            follow: false,
            channel: LogChannel::Both,
        }
    }
}

/// launchd label for an agent name: `com.archon.<name>`.
#[must_use]
pub fn launchd_label(name: &str) -> String {
    format!("{LAUNCHD_LABEL_PREFIX}{name}")
}

/// systemd unit name for an agent name: `archon-<name>.service`.
#[must_use]
pub fn unit_name(name: &str) -> String {
    format!("{SERVICE_NAME_PREFIX}{name}.service")
}

/// pm2 process name for an agent name: `archon-<name>`.
#[must_use]
pub fn pm2_name(name: &str) -> String {
    format!("{SERVICE_NAME_PREFIX}{name}")
}

/// Recover the agent name from a namespaced service identifier, or `None`
/// for identifiers outside the archon namespace.
#[must_use]
pub fn agent_name_from_identifier(identifier: &str, backend: Backend) -> Option<String> {
    match backend {
        Backend::Launchd => identifier
            .strip_prefix(LAUNCHD_LABEL_PREFIX)
            .map(ToOwned::to_owned),
        Backend::Systemd => identifier
            .strip_prefix(SERVICE_NAME_PREFIX)
            .and_then(|rest| rest.strip_suffix(".service"))
            .map(ToOwned::to_owned),
        Backend::Pm2 => identifier
            .strip_prefix(SERVICE_NAME_PREFIX)
            .map(ToOwned::to_owned),
    }
}
