//! Shared mock infrastructure for unit tests.
//!
//! Provides a scripted [`CommandRunner`], a canned [`HealthProbe`], and
//! output helpers so each test file doesn't have to re-define the same
//! boilerplate.

#![allow(clippy::expect_used)]
#![allow(dead_code)] // not every test file uses every helper

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use archon::application::ports::{CommandRunner, HealthProbe, HealthReport};
use archon::infra::paths::BasePaths;

// ── Output helpers ────────────────────────────────────────────────────────────

pub fn ok_output(stdout: &[u8]) -> Output {
    Output {
        status: ExitStatus::from_raw(0),
        stdout: stdout.to_vec(),
        stderr: Vec::new(),
    }
}

pub fn err_output(stderr: &[u8]) -> Output {
    Output {
        status: ExitStatus::from_raw(1 << 8),
        stdout: Vec::new(),
        stderr: stderr.to_vec(),
    }
}

// ── Scripted runner ───────────────────────────────────────────────────────────

struct Script {
    prefix: String,
    queue: VecDeque<Output>,
}

#[derive(Default)]
struct RunnerState {
    calls: Vec<String>,
    envs: Vec<Vec<(String, String)>>,
    scripts: Vec<Script>,
}

/// Answers commands from scripted responses matched by command-line prefix,
/// recording every invocation. Responses for one prefix play in order; the
/// last one repeats. Unscripted commands succeed with empty output.
///
/// Clones share state, so a test can hand one clone to a manager and keep
/// another for assertions.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Rc<RefCell<RunnerState>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for every command line starting with `prefix`.
    #[must_use]
    pub fn respond(self, prefix: &str, output: Output) -> Self {
        {
            let mut state = self.state.borrow_mut();
            if let Some(script) = state.scripts.iter_mut().find(|s| s.prefix == prefix) {
                script.queue.push_back(output);
            } else {
                state.scripts.push(Script {
                    prefix: prefix.to_string(),
                    queue: VecDeque::from([output]),
                });
            }
        }
        self
    }

    /// Every command line this runner saw, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    /// Environment pairs recorded for each call, aligned with `calls()`.
    pub fn envs(&self) -> Vec<Vec<(String, String)>> {
        self.state.borrow().envs.clone()
    }

    pub fn saw_call_starting(&self, prefix: &str) -> bool {
        self.state
            .borrow()
            .calls
            .iter()
            .any(|c| c.starts_with(prefix))
    }

    fn record(&self, program: &str, args: &[&str], env: &[(&str, &str)]) -> String {
        let line = if args.is_empty() {
            program.to_string()
        } else {
            format!("{program} {}", args.join(" "))
        };
        let mut state = self.state.borrow_mut();
        state.calls.push(line.clone());
        state.envs.push(
            env.iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
        line
    }

    fn lookup(&self, line: &str) -> Output {
        let mut state = self.state.borrow_mut();
        for script in &mut state.scripts {
            if line.starts_with(&script.prefix) {
                return if script.queue.len() > 1 {
                    script.queue.pop_front().expect("non-empty queue")
                } else {
                    script.queue.front().expect("non-empty queue").clone()
                };
            }
        }
        ok_output(b"")
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        let line = self.record(program, args, &[]);
        Ok(self.lookup(&line))
    }

    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> Result<Output> {
        self.run(program, args).await
    }

    async fn run_with_env(
        &self,
        program: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<Output> {
        let line = self.record(program, args, env);
        Ok(self.lookup(&line))
    }

    async fn run_status(
        &self,
        program: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<ExitStatus> {
        let line = self.record(program, args, env);
        Ok(self.lookup(&line).status)
    }
}

// ── Canned health probe ───────────────────────────────────────────────────────

/// Probe that always answers with the given report (or nothing).
pub struct StubProbe(pub Option<HealthReport>);

impl HealthProbe for StubProbe {
    async fn probe(&self, _port: u16) -> Option<HealthReport> {
        self.0.clone()
    }
}

// ── Sandboxed paths ───────────────────────────────────────────────────────────

/// A `BasePaths` rooted entirely inside a temp dir.
pub fn sandbox_paths(dir: &tempfile::TempDir) -> BasePaths {
    let home = dir.path().join("home");
    std::fs::create_dir_all(&home).expect("create sandbox home");
    let data = home.join(".archon");
    BasePaths::with_dirs(home, data)
}

/// A fake interpreter on disk, for tests that exercise `install`.
pub fn fake_interpreter(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let bin = dir.path().join("bin");
    std::fs::create_dir_all(&bin).expect("create sandbox bin");
    let node = bin.join("node");
    std::fs::write(&node, "#!/bin/sh\n").expect("write fake node");
    node
}
