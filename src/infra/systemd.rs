//! systemd platform manager — per-user service units on Linux.
//!
//! Unit files live under `~/.config/systemd/user` and are driven with
//! `systemctl --user`. Status is read through `systemctl show`, which prints
//! `KEY=VALUE` lines and exits zero even for units it has never heard of —
//! the parsing here leans on that instead of exit codes.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::application::ports::{CommandRunner, ProcessManager};
use crate::domain::agent::{
    AgentHandle, AgentSpec, AgentState, AgentStatus, Backend, LogRequest,
    agent_name_from_identifier, unit_name,
};
use crate::domain::error::AgentError;
use crate::domain::format::format_memory_bytes;
use crate::infra::agent_meta::AgentMetaStore;
use crate::infra::command_runner::TokioCommandRunner;
use crate::infra::detect::{managed_path, resolve_interpreter};
use crate::infra::paths::BasePaths;

/// Stderr fragments tolerated when stopping a unit that is already gone.
const NOT_LOADED_MARKERS: &[&str] = &["not loaded", "could not be found", "Unit is not loaded"];

pub struct SystemdManager<R: CommandRunner> {
    runner: R,
    paths: BasePaths,
}

impl SystemdManager<TokioCommandRunner> {
    /// Production manager over the real runner.
    #[must_use]
    pub fn with_defaults(paths: BasePaths) -> Self {
        Self::new(TokioCommandRunner::default(), paths)
    }
}

impl<R: CommandRunner> SystemdManager<R> {
    #[must_use]
    pub fn new(runner: R, paths: BasePaths) -> Self {
        Self { runner, paths }
    }

    fn meta(&self) -> AgentMetaStore {
        AgentMetaStore::new(self.paths.agent_meta_file())
    }

    async fn systemctl(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut full = vec!["--user"];
        full.extend_from_slice(args);
        self.runner
            .run("systemctl", &full)
            .await
            .with_context(|| format!("systemctl --user {}", args.join(" ")))
    }

    async fn daemon_reload(&self) -> Result<()> {
        let output = self.systemctl(&["daemon-reload"]).await?;
        anyhow::ensure!(
            output.status.success(),
            "systemctl daemon-reload failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(())
    }

    /// Per-user units are killed at logout unless lingering is enabled for
    /// the account. Detection failures stay silent — this is advice, not a
    /// precondition.
    async fn warn_unless_lingering(&self) {
        let Ok(user) = std::env::var("USER") else {
            return;
        };
        let Ok(output) = self
            .runner
            .run("loginctl", &["show-user", &user, "--property=Linger"])
            .await
        else {
            return;
        };
        if output.status.success()
            && String::from_utf8_lossy(&output.stdout).trim() == "Linger=no"
        {
            warn!(
                %user,
                "lingering is disabled; agents stop at logout. Enable with: loginctl enable-linger {user}",
            );
        }
    }

    async fn read_main_pid(&self, unit: &str) -> Result<Option<u32>> {
        let output = self
            .systemctl(&["show", unit, "--property=MainPID", "--value"])
            .await?;
        let pid = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|pid| *pid > 0);
        Ok(pid)
    }
}

impl<R: CommandRunner> ProcessManager for SystemdManager<R> {
    fn backend(&self) -> Backend {
        Backend::Systemd
    }

    async fn install(&self, spec: &AgentSpec) -> Result<()> {
        let interpreter = resolve_interpreter()?;
        let unit_dir = self.paths.systemd_user_dir();
        std::fs::create_dir_all(&unit_dir)
            .with_context(|| format!("creating {}", unit_dir.display()))?;

        let cwd = match &spec.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("resolving working directory")?,
        };
        let unit = render_unit(spec, &interpreter, self.paths.home(), &cwd);
        let path = self.paths.unit_path(&spec.name);
        std::fs::write(&path, unit).with_context(|| format!("writing {}", path.display()))?;

        // The unit cache predates the new file; reload so systemd sees it.
        self.daemon_reload().await?;
        self.warn_unless_lingering().await;

        self.meta()
            .record(&spec.name, spec.port, spec.log_dir.as_deref())?;
        info!(name = %spec.name, path = %path.display(), "installed user unit");
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<()> {
        let unit = unit_name(name);
        // Disable-and-stop in one command; the unit may not exist.
        let output = self.systemctl(&["disable", "--now", &unit]).await?;
        if !output.status.success() {
            debug!(
                %unit,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "disable --now failed (ignored)"
            );
        }
        let path = self.paths.unit_path(name);
        if path.exists() {
            std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        self.daemon_reload().await?;
        self.meta().remove(name)?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<AgentHandle> {
        if !self.paths.unit_path(name).exists() {
            return Err(AgentError::NotInstalled(name.to_string()).into());
        }
        let unit = unit_name(name);
        // enable --now so the agent also survives the next login.
        let output = self.systemctl(&["enable", "--now", &unit]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("failed to start agent '{name}': {}", stderr.trim());
        }
        Ok(AgentHandle {
            name: name.to_string(),
            pid: self.read_main_pid(&unit).await?,
            port: self.meta().port(name),
            backend: Backend::Systemd,
        })
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let unit = unit_name(name);
        let output = self.systemctl(&["stop", &unit]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if NOT_LOADED_MARKERS.iter().any(|m| stderr.contains(m)) {
                debug!(%unit, "agent was not running");
                return Ok(());
            }
            anyhow::bail!("failed to stop agent '{name}': {}", stderr.trim());
        }
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        let unit = unit_name(name);
        let output = self.systemctl(&["restart", &unit]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("failed to restart agent '{name}': {}", stderr.trim());
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<AgentStatus> {
        if !self.paths.unit_path(name).exists() {
            return Ok(AgentStatus::unknown(name, Backend::Systemd));
        }
        let unit = unit_name(name);
        let output = self
            .systemctl(&[
                "show",
                &unit,
                "--property=ActiveState,MainPID,MemoryCurrent",
            ])
            .await?;
        let properties = parse_show_output(&String::from_utf8_lossy(&output.stdout));
        Ok(status_from_properties(name, &properties))
    }

    async fn fleet(&self) -> Result<Vec<AgentStatus>> {
        let output = self
            .systemctl(&[
                "list-units",
                "--all",
                "--plain",
                "--no-legend",
                "archon-*.service",
            ])
            .await?;
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(parse_list_units(&listing)
            .into_iter()
            .filter_map(|(unit, active)| {
                agent_name_from_identifier(&unit, Backend::Systemd).map(|name| AgentStatus {
                    name,
                    state: active_state_to_agent_state(&active),
                    pid: None,
                    memory: None,
                    uptime: None,
                    restarts: None,
                    backend: Backend::Systemd,
                })
            })
            .collect())
    }

    async fn logs(&self, name: &str, request: &LogRequest) -> Result<()> {
        let unit = unit_name(name);
        let lines = request.lines.to_string();
        let mut args: Vec<&str> = vec!["--user", "-u", &unit, "-n", &lines];
        if request.follow {
            args.push("-f");
        }
        // The journal interleaves stdout and stderr; the channel filter only
        // applies to backends with separate streams.
        let status = self.runner.run_status("journalctl", &args, &[]).await?;
        if !request.follow && !status.success() {
            anyhow::bail!("journalctl exited with {status}");
        }
        Ok(())
    }
}

// ── Unit rendering ───────────────────────────────────────────────────────────

/// The restart-rate-limit window. An under-sized window makes systemd refuse
/// further restarts for good after one burst, so it must be strictly greater
/// than `backoff × max_restarts` for every input, including a zero backoff.
#[must_use]
pub fn start_limit_interval_secs(backoff_secs: u64, max_restarts: u32) -> u64 {
    backoff_secs.max(1) * (u64::from(max_restarts) + 1)
}

/// Render the user unit for one spec.
#[must_use]
pub fn render_unit(spec: &AgentSpec, interpreter: &Path, home: &Path, cwd: &Path) -> String {
    let backoff_secs = spec.restart_backoff.as_secs();
    let restart = if spec.restart { "on-failure" } else { "no" };

    let mut env: BTreeMap<String, String> = spec.env.clone();
    env.insert("PATH".to_string(), managed_path(interpreter));
    env.insert("HOME".to_string(), home.display().to_string());
    if let Some(port) = spec.port {
        env.insert("ARCHON_PORT".to_string(), port.to_string());
    }
    let mut env_lines = String::new();
    for (key, value) in &env {
        env_lines.push_str(&format!(
            "Environment=\"{key}={}\"\n",
            env_escape(value)
        ));
    }

    let memory_line = spec
        .memory_limit_mb
        .map_or_else(String::new, |mb| format!("MemoryMax={mb}M\n"));

    format!(
        "[Unit]\n\
         Description=Archon agent {name}\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         StartLimitBurst={burst}\n\
         StartLimitIntervalSec={window}\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={interpreter} {script}\n\
         WorkingDirectory={cwd}\n\
         Restart={restart}\n\
         RestartSec={backoff}\n\
         {memory_line}\
         {env_lines}\
         StandardOutput=journal\n\
         StandardError=journal\n\
         SyslogIdentifier={identifier}\n\
         KillSignal=SIGTERM\n\
         TimeoutStopSec=10\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        name = spec.name,
        burst = spec.max_restarts,
        window = start_limit_interval_secs(backoff_secs, spec.max_restarts),
        interpreter = interpreter.display(),
        script = spec.script.display(),
        cwd = cwd.display(),
        backoff = backoff_secs,
        identifier = format!("archon-{}", spec.name),
    )
}

/// Escape a value for a quoted systemd `Environment=` assignment.
#[must_use]
pub fn env_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

// ── `systemctl` output parsing ───────────────────────────────────────────────

/// Parse `systemctl show` `KEY=VALUE` lines.
#[must_use]
pub fn parse_show_output(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Map systemd's `ActiveState` onto the agent state model.
#[must_use]
pub fn active_state_to_agent_state(active: &str) -> AgentState {
    match active {
        "active" => AgentState::Online,
        "inactive" => AgentState::Stopped,
        "failed" => AgentState::Errored,
        _ => AgentState::Unknown,
    }
}

/// Build a status snapshot from `show` properties.
#[must_use]
pub fn status_from_properties(name: &str, properties: &BTreeMap<String, String>) -> AgentStatus {
    let state = properties
        .get("ActiveState")
        .map_or(AgentState::Unknown, |active| {
            active_state_to_agent_state(active)
        });
    let pid = properties
        .get("MainPID")
        .and_then(|pid| pid.parse::<u32>().ok())
        .filter(|pid| *pid > 0);
    let memory = properties
        .get("MemoryCurrent")
        .and_then(|bytes| bytes.parse::<u64>().ok())
        .map(format_memory_bytes);
    AgentStatus {
        name: name.to_string(),
        state,
        pid,
        memory,
        uptime: None,
        restarts: None,
        backend: Backend::Systemd,
    }
}

/// Parse `list-units --plain --no-legend` rows into `(unit, active)` pairs.
#[must_use]
pub fn parse_list_units(listing: &str) -> Vec<(String, String)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let unit = fields.next()?;
            let _load = fields.next()?;
            let active = fields.next()?;
            Some((unit.to_string(), active.to_string()))
        })
        .collect()
}
