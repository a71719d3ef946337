//! Filesystem layout for everything archon touches.
//!
//! The data directory defaults to `~/.archon` and honors the `ARCHON_HOME`
//! override (used by tests and by callers that sandbox their state). The
//! launchd and systemd config directories are fixed by those backends and
//! are not overridable.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::domain::agent::{launchd_label, pm2_name, unit_name};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "ARCHON_HOME";

/// Resolved directory layout for one process run.
#[derive(Debug, Clone)]
pub struct BasePaths {
    home: PathBuf,
    data_dir: PathBuf,
}

impl BasePaths {
    /// Resolve from the environment: `ARCHON_HOME` if set, else
    /// `~/.archon`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn resolve() -> Result<Self> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        let data_dir = std::env::var_os(DATA_DIR_ENV)
            .map_or_else(|| home.join(".archon"), PathBuf::from);
        Ok(Self { home, data_dir })
    }

    /// Explicit layout (used in tests).
    #[must_use]
    pub fn with_dirs(home: PathBuf, data_dir: PathBuf) -> Self {
        Self { home, data_dir }
    }

    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Default log directory for agents without a custom one.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Private state directory for the isolated pm2 instance (`PM2_HOME`).
    #[must_use]
    pub fn pm2_home(&self) -> PathBuf {
        self.data_dir.join("pm2")
    }

    /// pm2 app-config file for one agent.
    #[must_use]
    pub fn pm2_app_config(&self, name: &str) -> PathBuf {
        self.data_dir.join("apps").join(format!("{}.json", pm2_name(name)))
    }

    /// Per-agent side-metadata file (port, custom log directory).
    #[must_use]
    pub fn agent_meta_file(&self) -> PathBuf {
        self.data_dir.join("agents.json")
    }

    /// Per-user launch-agent registry.
    #[must_use]
    pub fn launch_agents_dir(&self) -> PathBuf {
        self.home.join("Library").join("LaunchAgents")
    }

    /// Property-list path for one agent.
    #[must_use]
    pub fn plist_path(&self, name: &str) -> PathBuf {
        self.launch_agents_dir()
            .join(format!("{}.plist", launchd_label(name)))
    }

    /// Per-user systemd unit directory.
    #[must_use]
    pub fn systemd_user_dir(&self) -> PathBuf {
        self.home.join(".config").join("systemd").join("user")
    }

    /// Unit-file path for one agent.
    #[must_use]
    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.systemd_user_dir().join(unit_name(name))
    }

    /// stdout/stderr log files for one agent, honoring a custom log
    /// directory from the spec.
    #[must_use]
    pub fn agent_log_files(&self, custom_dir: Option<&Path>, name: &str) -> (PathBuf, PathBuf) {
        let dir = custom_dir.map_or_else(|| self.log_dir(), Path::to_path_buf);
        (
            dir.join(format!("{name}.out.log")),
            dir.join(format!("{name}.err.log")),
        )
    }
}
