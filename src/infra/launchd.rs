//! launchd platform manager — per-user launch agents on macOS.
//!
//! The rendered property list under `~/Library/LaunchAgents` is the durable
//! record of the agent; `launchctl` drives it. launchd's textual output is
//! parsed defensively — a row that does not look like a job line is skipped,
//! never trusted.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::application::ports::{CommandRunner, HealthProbe, ProcessManager};
use crate::domain::agent::{
    AgentHandle, AgentSpec, AgentState, AgentStatus, Backend, LogChannel, LogRequest,
    agent_name_from_identifier, launchd_label,
};
use crate::domain::error::AgentError;
use crate::domain::format::format_duration_secs;
use crate::infra::agent_meta::AgentMetaStore;
use crate::infra::command_runner::TokioCommandRunner;
use crate::infra::detect::{managed_path, resolve_interpreter};
use crate::infra::paths::BasePaths;
use crate::infra::probe::UreqHealthProbe;

/// launchd refuses sub-second restart throttling, so the backoff is clamped.
const MIN_THROTTLE_SECS: u64 = 1;

/// Start polls `launchctl list` for a PID this many times, this far apart.
/// A poll timeout is not an error — the job may still be warming up.
const START_POLL_ATTEMPTS: u32 = 20;
const START_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pause between booting out a stale registration and the fresh bootstrap.
/// launchd tears jobs down asynchronously; bootstrapping into the teardown
/// window fails with an I/O error.
const RELOAD_PAUSE: Duration = Duration::from_millis(500);

/// Stderr fragments that mean "the job was not loaded" — tolerated wherever
/// stopping an already-stopped agent must not fail.
const NOT_LOADED_MARKERS: &[&str] = &[
    "No such process",
    "not currently loaded",
    "Could not find service",
];

pub struct LaunchdManager<R: CommandRunner, H: HealthProbe = UreqHealthProbe> {
    runner: R,
    probe: H,
    paths: BasePaths,
}

impl LaunchdManager<TokioCommandRunner, UreqHealthProbe> {
    /// Production manager over the real runner and probe.
    #[must_use]
    pub fn with_defaults(paths: BasePaths) -> Self {
        Self::new(TokioCommandRunner::default(), UreqHealthProbe, paths)
    }
}

impl<R: CommandRunner, H: HealthProbe> LaunchdManager<R, H> {
    #[must_use]
    pub fn new(runner: R, probe: H, paths: BasePaths) -> Self {
        Self {
            runner,
            probe,
            paths,
        }
    }

    fn meta(&self) -> AgentMetaStore {
        AgentMetaStore::new(self.paths.agent_meta_file())
    }

    /// The per-user launchd domain uid, from `id -u`.
    async fn uid(&self) -> Result<String> {
        let output = self
            .runner
            .run("id", &["-u"])
            .await
            .context("resolving user id")?;
        anyhow::ensure!(output.status.success(), "id -u failed");
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Raw `launchctl list` output. A non-zero exit degrades to an empty
    /// listing so status/fleet stay safe to call speculatively.
    async fn list_output(&self) -> Result<String> {
        let output = self
            .runner
            .run("launchctl", &["list"])
            .await
            .context("launchctl list")?;
        if !output.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "launchctl list failed; treating as empty"
            );
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn find_row(&self, label: &str) -> Result<Option<ListRow>> {
        let listing = self.list_output().await?;
        Ok(parse_list_output(&listing)
            .into_iter()
            .find(|row| row.label == label))
    }

    async fn snapshot(&self, name: &str) -> Result<AgentStatus> {
        let label = launchd_label(name);
        let row = self.find_row(&label).await?;
        let (state, pid) = match &row {
            Some(row) => (row.state(), row.pid),
            // Installed but launchd prints no row for the label: the job is
            // not loaded and launchd can say nothing more about it.
            None => (AgentState::Unknown, None),
        };
        let mut status = AgentStatus {
            name: name.to_string(),
            state,
            pid,
            memory: None,
            uptime: None,
            restarts: None,
            backend: Backend::Launchd,
        };
        if let Some(port) = self.meta().port(name)
            && let Some(report) = self.probe.probe(port).await
        {
            status.uptime = report.uptime_secs.map(format_duration_secs);
            status.memory = report.memory_mb.map(|mb| format!("{mb:.1} MiB"));
        }
        Ok(status)
    }
}

impl<R: CommandRunner, H: HealthProbe> ProcessManager for LaunchdManager<R, H> {
    fn backend(&self) -> Backend {
        Backend::Launchd
    }

    async fn install(&self, spec: &AgentSpec) -> Result<()> {
        let interpreter = resolve_interpreter()?;
        let registry = self.paths.launch_agents_dir();
        std::fs::create_dir_all(&registry)
            .with_context(|| format!("creating {}", registry.display()))?;

        let (out_log, err_log) = self.paths.agent_log_files(spec.log_dir.as_deref(), &spec.name);
        if let Some(log_parent) = out_log.parent() {
            std::fs::create_dir_all(log_parent)
                .with_context(|| format!("creating {}", log_parent.display()))?;
        }

        let cwd = match &spec.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("resolving working directory")?,
        };
        let plist = render_plist(
            spec,
            &interpreter,
            self.paths.home(),
            &cwd,
            &out_log,
            &err_log,
        );
        let path = self.paths.plist_path(&spec.name);
        std::fs::write(&path, plist).with_context(|| format!("writing {}", path.display()))?;

        // Lint immediately; a malformed plist must never stay installed.
        let lint = self
            .runner
            .run("plutil", &["-lint", &path.display().to_string()])
            .await
            .context("plutil -lint")?;
        if !lint.status.success() {
            let detail = String::from_utf8_lossy(&lint.stdout).trim().to_string();
            let _ = std::fs::remove_file(&path);
            anyhow::bail!(
                "generated launch agent for '{}' failed plist validation: {detail}",
                spec.name
            );
        }

        self.meta()
            .record(&spec.name, spec.port, spec.log_dir.as_deref())?;
        info!(name = %spec.name, path = %path.display(), "installed launch agent");
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<()> {
        self.stop(name).await?;
        let path = self.paths.plist_path(name);
        if path.exists() {
            std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        self.meta().remove(name)?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<AgentHandle> {
        let path = self.paths.plist_path(name);
        if !path.exists() {
            return Err(AgentError::NotInstalled(name.to_string()).into());
        }
        let label = launchd_label(name);
        let uid = self.uid().await?;
        let target = format!("gui/{uid}/{label}");

        // A stale registration (crash recovery, previous run) makes bootstrap
        // fail with "already bootstrapped". Unload it first and give launchd
        // a moment to finish the teardown.
        if self.find_row(&label).await?.is_some() {
            debug!(%label, "label already loaded; booting out stale registration");
            let _ = self.runner.run("launchctl", &["bootout", &target]).await;
            tokio::time::sleep(RELOAD_PAUSE).await;
        }

        let output = self
            .runner
            .run(
                "launchctl",
                &["bootstrap", &format!("gui/{uid}"), &path.display().to_string()],
            )
            .await
            .context("launchctl bootstrap")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("failed to start agent '{name}': {}", stderr.trim());
        }

        for _ in 0..START_POLL_ATTEMPTS {
            tokio::time::sleep(START_POLL_INTERVAL).await;
            if let Some(row) = self.find_row(&label).await?
                && row.pid.is_some()
            {
                return Ok(AgentHandle {
                    name: name.to_string(),
                    pid: row.pid,
                    port: self.meta().port(name),
                    backend: Backend::Launchd,
                });
            }
        }
        warn!(%label, "no PID reported before poll timeout; agent may still be starting");
        Ok(AgentHandle {
            name: name.to_string(),
            pid: None,
            port: self.meta().port(name),
            backend: Backend::Launchd,
        })
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let label = launchd_label(name);
        let uid = self.uid().await?;
        let output = self
            .runner
            .run("launchctl", &["bootout", &format!("gui/{uid}/{label}")])
            .await
            .context("launchctl bootout")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if NOT_LOADED_MARKERS.iter().any(|m| stderr.contains(m)) {
                debug!(%label, "agent was not running");
                return Ok(());
            }
            anyhow::bail!("failed to stop agent '{name}': {}", stderr.trim());
        }
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        // kickstart kills and relaunches in one launchd operation, so there
        // is no window where the job is unregistered.
        let label = launchd_label(name);
        let uid = self.uid().await?;
        let output = self
            .runner
            .run("launchctl", &["kickstart", "-kp", &format!("gui/{uid}/{label}")])
            .await
            .context("launchctl kickstart")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("failed to restart agent '{name}': {}", stderr.trim());
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<AgentStatus> {
        if !self.paths.plist_path(name).exists() {
            return Ok(AgentStatus::unknown(name, Backend::Launchd));
        }
        self.snapshot(name).await
    }

    async fn fleet(&self) -> Result<Vec<AgentStatus>> {
        let listing = self.list_output().await?;
        Ok(parse_list_output(&listing)
            .into_iter()
            .filter_map(|row| {
                agent_name_from_identifier(&row.label, Backend::Launchd).map(|name| AgentStatus {
                    name,
                    state: row.state(),
                    pid: row.pid,
                    memory: None,
                    uptime: None,
                    restarts: None,
                    backend: Backend::Launchd,
                })
            })
            .collect())
    }

    async fn logs(&self, name: &str, request: &LogRequest) -> Result<()> {
        let custom_dir = self.meta().log_dir(name);
        let (out_log, err_log) = self.paths.agent_log_files(custom_dir.as_deref(), name);
        let selected = match request.channel {
            LogChannel::Stdout => vec![out_log],
            LogChannel::Stderr => vec![err_log],
            LogChannel::Both => vec![out_log, err_log],
        };
        let existing: Vec<String> = selected
            .iter()
            .filter(|path| path.exists())
            .map(|path| path.display().to_string())
            .collect();
        if existing.is_empty() {
            anyhow::bail!(
                "no logs for agent '{name}' yet (looked in {})",
                selected
                    .first()
                    .and_then(|p| p.parent())
                    .map_or_else(String::new, |p| p.display().to_string())
            );
        }

        let lines = request.lines.to_string();
        let mut args: Vec<&str> = vec!["-n", &lines];
        if request.follow {
            args.push("-f");
        }
        args.extend(existing.iter().map(String::as_str));

        // Streams straight to the caller's stdio; in follow mode the tail
        // child ends when the caller interrupts.
        let status = self.runner.run_status("tail", &args, &[]).await?;
        if !request.follow && !status.success() {
            anyhow::bail!("tail exited with {status}");
        }
        Ok(())
    }
}

// ── Plist rendering ──────────────────────────────────────────────────────────

/// Render the launch-agent property list for one spec.
///
/// `KeepAlive` is the structured "restart unless the process exited
/// successfully" form when restart is enabled — a bare `<true/>` would also
/// relaunch after a clean exit.
#[must_use]
pub fn render_plist(
    spec: &AgentSpec,
    interpreter: &Path,
    home: &Path,
    cwd: &Path,
    out_log: &Path,
    err_log: &Path,
) -> String {
    let mut env: BTreeMap<String, String> = spec.env.clone();
    env.insert("PATH".to_string(), managed_path(interpreter));
    env.insert("HOME".to_string(), home.display().to_string());
    if let Some(port) = spec.port {
        env.insert("ARCHON_PORT".to_string(), port.to_string());
    }

    let mut env_entries = String::new();
    for (key, value) in &env {
        env_entries.push_str(&format!(
            "        <key>{}</key>\n        <string>{}</string>\n",
            xml_escape(key),
            xml_escape(value)
        ));
    }

    let keep_alive = if spec.restart {
        "    <key>KeepAlive</key>\n    <dict>\n        <key>SuccessfulExit</key>\n        <false/>\n    </dict>\n"
            .to_string()
    } else {
        "    <key>KeepAlive</key>\n    <false/>\n".to_string()
    };

    let throttle = spec.restart_backoff.as_secs().max(MIN_THROTTLE_SECS);

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n\
         <dict>\n\
         \x20   <key>Label</key>\n\
         \x20   <string>{label}</string>\n\
         \x20   <key>ProgramArguments</key>\n\
         \x20   <array>\n\
         \x20       <string>{interpreter}</string>\n\
         \x20       <string>{script}</string>\n\
         \x20   </array>\n\
         \x20   <key>WorkingDirectory</key>\n\
         \x20   <string>{cwd}</string>\n\
         \x20   <key>EnvironmentVariables</key>\n\
         \x20   <dict>\n\
         {env_entries}\
         \x20   </dict>\n\
         \x20   <key>RunAtLoad</key>\n\
         \x20   <true/>\n\
         {keep_alive}\
         \x20   <key>ThrottleInterval</key>\n\
         \x20   <integer>{throttle}</integer>\n\
         \x20   <key>StandardOutPath</key>\n\
         \x20   <string>{out_log}</string>\n\
         \x20   <key>StandardErrorPath</key>\n\
         \x20   <string>{err_log}</string>\n\
         </dict>\n\
         </plist>\n",
        label = xml_escape(&launchd_label(&spec.name)),
        interpreter = xml_escape(&interpreter.display().to_string()),
        script = xml_escape(&spec.script.display().to_string()),
        cwd = xml_escape(&cwd.display().to_string()),
        out_log = xml_escape(&out_log.display().to_string()),
        err_log = xml_escape(&err_log.display().to_string()),
    )
}

/// Escape the five XML-reserved characters.
#[must_use]
pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// ── `launchctl list` parsing ─────────────────────────────────────────────────

/// One job row from `launchctl list`: `PID\tLastExitStatus\tLabel`, with `-`
/// for an absent PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRow {
    pub pid: Option<u32>,
    pub last_exit: Option<i32>,
    pub label: String,
}

impl ListRow {
    /// Map a job row onto the agent state model.
    #[must_use]
    pub fn state(&self) -> AgentState {
        if self.pid.is_some() {
            AgentState::Online
        } else if self.last_exit.is_some_and(|code| code != 0) {
            AgentState::Errored
        } else {
            AgentState::Stopped
        }
    }
}

/// Parse `launchctl list` output, skipping the header and anything that does
/// not look like a job row.
#[must_use]
pub fn parse_list_output(listing: &str) -> Vec<ListRow> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid_field = fields.next()?;
            let exit_field = fields.next()?;
            let label = fields.next()?;
            if pid_field == "PID" {
                return None; // header
            }
            let pid = pid_field.parse::<u32>().ok();
            if pid.is_none() && pid_field != "-" {
                return None;
            }
            let last_exit = exit_field.parse::<i32>().ok();
            Some(ListRow {
                pid,
                last_exit,
                label: label.to_string(),
            })
        })
        .collect()
}
