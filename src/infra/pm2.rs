//! pm2 platform manager — the fallback supervisor for hosts with neither
//! launchd nor usable per-user systemd (WSL included).
//!
//! pm2 runs as an isolated instance: every invocation pins `PM2_HOME` to a
//! private directory under the archon data dir, so it can never collide with
//! a pm2 the user runs for their own projects.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use crate::application::ports::{CommandRunner, ProcessManager};
use crate::domain::agent::{
    AgentHandle, AgentSpec, AgentState, AgentStatus, Backend, LogChannel, LogRequest,
    agent_name_from_identifier, pm2_name,
};
use crate::domain::error::AgentError;
use crate::domain::format::{format_duration_secs, format_memory_bytes};
use crate::infra::agent_meta::AgentMetaStore;
use crate::infra::command_runner::TokioCommandRunner;
use crate::infra::detect::{managed_path, resolve_interpreter};
use crate::infra::paths::BasePaths;

/// Stderr fragments tolerated when stopping or deleting an unknown process.
const NOT_FOUND_MARKERS: &[&str] = &["not found", "doesn't exist"];

pub struct Pm2Manager<R: CommandRunner> {
    runner: R,
    paths: BasePaths,
}

impl Pm2Manager<TokioCommandRunner> {
    /// Production manager over the real runner.
    #[must_use]
    pub fn with_defaults(paths: BasePaths) -> Self {
        Self::new(TokioCommandRunner::default(), paths)
    }
}

impl<R: CommandRunner> Pm2Manager<R> {
    #[must_use]
    pub fn new(runner: R, paths: BasePaths) -> Self {
        Self { runner, paths }
    }

    fn meta(&self) -> AgentMetaStore {
        AgentMetaStore::new(self.paths.agent_meta_file())
    }

    async fn pm2(&self, args: &[&str]) -> Result<std::process::Output> {
        let home = self.paths.pm2_home();
        std::fs::create_dir_all(&home).with_context(|| format!("creating {}", home.display()))?;
        let home = home.display().to_string();
        self.runner
            .run_with_env("pm2", args, &[("PM2_HOME", &home)])
            .await
            .with_context(|| format!("pm2 {}", args.join(" ")))
    }

    /// The supervisor's JSON process listing, parsed defensively.
    async fn jlist(&self) -> Result<Vec<Pm2Process>> {
        let output = self.pm2(&["jlist"]).await?;
        anyhow::ensure!(
            output.status.success(),
            "pm2 jlist failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        parse_jlist(&String::from_utf8_lossy(&output.stdout))
    }

    async fn find_process(&self, process_name: &str) -> Result<Option<Pm2Process>> {
        Ok(self
            .jlist()
            .await?
            .into_iter()
            .find(|process| process.name == process_name))
    }
}

impl<R: CommandRunner> ProcessManager for Pm2Manager<R> {
    fn backend(&self) -> Backend {
        Backend::Pm2
    }

    async fn install(&self, spec: &AgentSpec) -> Result<()> {
        let interpreter = resolve_interpreter()?;
        let cwd = match &spec.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("resolving working directory")?,
        };
        let config = render_app_config(spec, &interpreter, self.paths.home(), &cwd);

        let path = self.paths.pm2_app_config(&spec.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&path, config).with_context(|| format!("writing {}", path.display()))?;

        self.meta()
            .record(&spec.name, spec.port, spec.log_dir.as_deref())?;
        info!(name = %spec.name, path = %path.display(), "installed pm2 app config");
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<()> {
        let process_name = pm2_name(name);
        let output = self.pm2(&["delete", &process_name]).await?;
        if !output.status.success() {
            debug!(
                %process_name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "pm2 delete failed (ignored)"
            );
        }
        let path = self.paths.pm2_app_config(name);
        if path.exists() {
            std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        self.meta().remove(name)?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<AgentHandle> {
        let path = self.paths.pm2_app_config(name);
        if !path.exists() {
            return Err(AgentError::NotInstalled(name.to_string()).into());
        }
        let output = self.pm2(&["start", &path.display().to_string()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("failed to start agent '{name}': {}", stderr.trim());
        }
        let process = self.find_process(&pm2_name(name)).await?;
        Ok(AgentHandle {
            name: name.to_string(),
            pid: process.and_then(|process| process.pid),
            port: self.meta().port(name),
            backend: Backend::Pm2,
        })
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let process_name = pm2_name(name);
        let output = self.pm2(&["stop", &process_name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m)) {
                debug!(%process_name, "agent was not running");
                return Ok(());
            }
            anyhow::bail!("failed to stop agent '{name}': {}", stderr.trim());
        }
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        let process_name = pm2_name(name);
        let output = self.pm2(&["restart", &process_name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("failed to restart agent '{name}': {}", stderr.trim());
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<AgentStatus> {
        if !self.paths.pm2_app_config(name).exists() {
            return Ok(AgentStatus::unknown(name, Backend::Pm2));
        }
        let process = self.find_process(&pm2_name(name)).await?;
        Ok(match process {
            Some(process) => {
                status_from_process(name, &process, chrono::Utc::now().timestamp_millis())
            }
            // Installed but the supervisor has no record of it (never started
            // or deleted out-of-band).
            None => AgentStatus::unknown(name, Backend::Pm2),
        })
    }

    async fn fleet(&self) -> Result<Vec<AgentStatus>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        Ok(self
            .jlist()
            .await?
            .into_iter()
            .filter_map(|process| {
                agent_name_from_identifier(&process.name, Backend::Pm2)
                    .map(|name| status_from_process(&name, &process, now_ms))
            })
            .collect())
    }

    async fn logs(&self, name: &str, request: &LogRequest) -> Result<()> {
        let process_name = pm2_name(name);
        let lines = request.lines.to_string();
        let mut args: Vec<&str> = vec!["logs", &process_name, "--lines", &lines];
        if !request.follow {
            args.push("--nostream");
        }
        match request.channel {
            LogChannel::Stdout => args.push("--out"),
            LogChannel::Stderr => args.push("--err"),
            LogChannel::Both => {}
        }
        let home = self.paths.pm2_home().display().to_string();
        let status = self
            .runner
            .run_status("pm2", &args, &[("PM2_HOME", &home)])
            .await?;
        if !request.follow && !status.success() {
            anyhow::bail!("pm2 logs exited with {status}");
        }
        Ok(())
    }
}

// ── App-config rendering ─────────────────────────────────────────────────────

/// Render the one-app pm2 config for a spec, pretty-printed JSON.
#[must_use]
pub fn render_app_config(spec: &AgentSpec, interpreter: &Path, home: &Path, cwd: &Path) -> String {
    let mut env = serde_json::Map::new();
    for (key, value) in &spec.env {
        env.insert(key.clone(), json!(value));
    }
    env.insert("PATH".to_string(), json!(managed_path(interpreter)));
    env.insert("HOME".to_string(), json!(home.display().to_string()));
    if let Some(port) = spec.port {
        env.insert("ARCHON_PORT".to_string(), json!(port.to_string()));
    }

    let mut app = serde_json::Map::new();
    app.insert("name".to_string(), json!(pm2_name(&spec.name)));
    app.insert("script".to_string(), json!(spec.script.display().to_string()));
    app.insert(
        "interpreter".to_string(),
        json!(interpreter.display().to_string()),
    );
    app.insert("cwd".to_string(), json!(cwd.display().to_string()));
    app.insert("env".to_string(), serde_json::Value::Object(env));
    app.insert("autorestart".to_string(), json!(spec.restart));
    app.insert("max_restarts".to_string(), json!(spec.max_restarts));
    app.insert(
        "exp_backoff_restart_delay".to_string(),
        json!(u64::try_from(spec.restart_backoff.as_millis()).unwrap_or(u64::MAX)),
    );
    if let Some(mb) = spec.memory_limit_mb {
        app.insert("max_memory_restart".to_string(), json!(format!("{mb}M")));
    }

    let config = json!({ "apps": [serde_json::Value::Object(app)] });
    // json! output is valid by construction.
    serde_json::to_string_pretty(&config).unwrap_or_else(|_| config.to_string())
}

// ── `pm2 jlist` parsing ──────────────────────────────────────────────────────

/// The fields archon reads from one `pm2 jlist` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pm2Process {
    pub name: String,
    pub pid: Option<u32>,
    pub status: String,
    pub restarts: Option<u32>,
    pub memory_bytes: Option<u64>,
    /// Epoch milliseconds of the last (re)start.
    pub started_at_ms: Option<i64>,
}

/// Parse the supervisor's JSON process listing. Entries missing a name are
/// skipped rather than trusted.
///
/// # Errors
///
/// Returns an error if the listing is not valid JSON.
pub fn parse_jlist(listing: &str) -> Result<Vec<Pm2Process>> {
    let trimmed = listing.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value =
        serde_json::from_str(trimmed).context("parsing pm2 jlist output")?;
    let entries = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("pm2 jlist output is not an array"))?;
    Ok(entries.iter().filter_map(process_from_value).collect())
}

fn process_from_value(value: &serde_json::Value) -> Option<Pm2Process> {
    let name = value.get("name")?.as_str()?.to_string();
    let pid = value
        .get("pid")
        .and_then(serde_json::Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok())
        .filter(|pid| *pid > 0);
    let pm2_env = value.get("pm2_env");
    let status = pm2_env
        .and_then(|env| env.get("status"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let restarts = pm2_env
        .and_then(|env| env.get("restart_time"))
        .and_then(serde_json::Value::as_u64)
        .and_then(|count| u32::try_from(count).ok());
    let started_at_ms = pm2_env
        .and_then(|env| env.get("pm_uptime"))
        .and_then(serde_json::Value::as_i64);
    let memory_bytes = value
        .get("monit")
        .and_then(|monit| monit.get("memory"))
        .and_then(serde_json::Value::as_u64);
    Some(Pm2Process {
        name,
        pid,
        status,
        restarts,
        memory_bytes,
        started_at_ms,
    })
}

/// Map pm2's status enum onto the agent state model.
#[must_use]
pub fn pm2_status_to_state(status: &str) -> AgentState {
    match status {
        "online" => AgentState::Online,
        "stopped" => AgentState::Stopped,
        "errored" => AgentState::Errored,
        _ => AgentState::Unknown,
    }
}

/// Build a status snapshot from a jlist entry. `now_ms` is passed in so the
/// uptime arithmetic is testable.
#[must_use]
pub fn status_from_process(name: &str, process: &Pm2Process, now_ms: i64) -> AgentStatus {
    let state = pm2_status_to_state(&process.status);
    let uptime = (state == AgentState::Online)
        .then(|| {
            process.started_at_ms.and_then(|started| {
                let elapsed_ms = now_ms.saturating_sub(started);
                u64::try_from(elapsed_ms / 1000).ok().map(format_duration_secs)
            })
        })
        .flatten();
    AgentStatus {
        name: name.to_string(),
        state,
        pid: process.pid,
        memory: process.memory_bytes.map(format_memory_bytes),
        uptime,
        restarts: process.restarts,
        backend: Backend::Pm2,
    }
}
