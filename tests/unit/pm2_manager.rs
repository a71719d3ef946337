//! Unit tests for the pm2 fallback manager.
//!
//! IMPORTANT: tests that exercise `install` prepend a fake interpreter
//! directory to `PATH` and are marked `#[serial]`.

#![allow(clippy::expect_used, clippy::unwrap_used, unsafe_code)]

use archon::application::ports::ProcessManager;
use archon::domain::agent::{AgentSpec, AgentState, LogChannel, LogRequest};
use archon::infra::pm2::Pm2Manager;
use serial_test::serial;

use crate::mocks::{ScriptedRunner, err_output, fake_interpreter, ok_output, sandbox_paths};

fn spec(dir: &tempfile::TempDir) -> AgentSpec {
    let script = dir.path().join("scout.js");
    std::fs::write(&script, "setInterval(() => {}, 1000)\n").unwrap();
    let mut spec = AgentSpec::new("scout", script);
    spec.port = Some(4100);
    spec.cwd = Some(dir.path().to_path_buf());
    spec
}

fn prepend_fake_interpreter(dir: &tempfile::TempDir) {
    let node = fake_interpreter(dir);
    let bin = node.parent().unwrap().display().to_string();
    let original = std::env::var("PATH").unwrap_or_default();
    // SAFETY: callers are #[serial]; the sandbox dir is only prepended, so
    // concurrent readers still resolve everything they could before.
    unsafe { std::env::set_var("PATH", format!("{bin}:{original}")) };
}

fn jlist_online() -> Vec<u8> {
    serde_json::json!([
        {
            "name": "archon-scout",
            "pid": 7341,
            "pm2_env": {"status": "online", "restart_time": 2, "pm_uptime": 0},
            "monit": {"memory": 1_048_576}
        }
    ])
    .to_string()
    .into_bytes()
}

#[tokio::test]
#[serial]
async fn install_writes_the_app_config() {
    let dir = tempfile::tempdir().unwrap();
    prepend_fake_interpreter(&dir);
    let paths = sandbox_paths(&dir);
    let manager = Pm2Manager::new(ScriptedRunner::new(), paths.clone());

    manager.install(&spec(&dir)).await.expect("install");

    let config_path = paths.pm2_app_config("scout");
    let rendered = std::fs::read_to_string(&config_path).expect("config written");
    let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
    assert_eq!(parsed["apps"][0]["name"], "archon-scout");
    assert_eq!(parsed["apps"][0]["env"]["ARCHON_PORT"], "4100");
}

#[tokio::test]
async fn start_errors_when_no_config_exists() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let manager = Pm2Manager::new(runner.clone(), sandbox_paths(&dir));

    let err = manager.start("scout").await.expect_err("expected Err");
    assert!(err.to_string().contains("not installed"));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn start_runs_the_config_under_the_isolated_home() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(&dir);
    let config_path = paths.pm2_app_config("scout");
    std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    std::fs::write(&config_path, "{\"apps\":[]}").unwrap();

    let runner = ScriptedRunner::new().respond("pm2 jlist", ok_output(&jlist_online()));
    let manager = Pm2Manager::new(runner.clone(), paths.clone());

    let handle = manager.start("scout").await.expect("start");
    assert_eq!(handle.pid, Some(7341));
    assert!(runner.saw_call_starting(&format!("pm2 start {}", config_path.display())));

    let pm2_home = paths.pm2_home().display().to_string();
    for env in runner.envs() {
        assert!(
            env.iter().any(|(k, v)| k == "PM2_HOME" && *v == pm2_home),
            "every pm2 invocation must pin the isolated PM2_HOME"
        );
    }
}

#[tokio::test]
async fn stop_tolerates_an_unknown_process() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new().respond(
        "pm2 stop",
        err_output(b"[PM2][ERROR] Process or Namespace archon-scout not found"),
    );
    let manager = Pm2Manager::new(runner, sandbox_paths(&dir));

    manager.stop("scout").await.expect("stop must tolerate not found");
}

#[tokio::test]
async fn restart_goes_through_the_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let manager = Pm2Manager::new(runner.clone(), sandbox_paths(&dir));

    manager.restart("scout").await.expect("restart");
    assert!(runner.saw_call_starting("pm2 restart archon-scout"));
}

#[tokio::test]
async fn uninstall_deletes_the_process_and_the_config() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(&dir);
    let config_path = paths.pm2_app_config("scout");
    std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    std::fs::write(&config_path, "{\"apps\":[]}").unwrap();

    let runner = ScriptedRunner::new()
        .respond("pm2 delete", err_output(b"[PM2][ERROR] Process archon-scout not found"));
    let manager = Pm2Manager::new(runner, paths);

    manager.uninstall("scout").await.expect("uninstall");
    assert!(!config_path.exists(), "config file must be gone after uninstall");
}

#[tokio::test]
async fn status_is_unknown_without_a_config() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let manager = Pm2Manager::new(runner.clone(), sandbox_paths(&dir));

    let status = manager.status("ghost").await.expect("status");
    assert_eq!(status.state, AgentState::Unknown);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn status_is_unknown_when_installed_but_not_in_the_listing() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(&dir);
    let config_path = paths.pm2_app_config("scout");
    std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    std::fs::write(&config_path, "{\"apps\":[]}").unwrap();

    let runner = ScriptedRunner::new().respond("pm2 jlist", ok_output(b"[]"));
    let manager = Pm2Manager::new(runner, paths);

    let status = manager.status("scout").await.expect("status");
    assert_eq!(status.state, AgentState::Unknown);
}

#[tokio::test]
async fn status_maps_the_listing_fields() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(&dir);
    let config_path = paths.pm2_app_config("scout");
    std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    std::fs::write(&config_path, "{\"apps\":[]}").unwrap();

    let runner = ScriptedRunner::new().respond("pm2 jlist", ok_output(&jlist_online()));
    let manager = Pm2Manager::new(runner, paths);

    let status = manager.status("scout").await.expect("status");
    assert_eq!(status.state, AgentState::Online);
    assert_eq!(status.pid, Some(7341));
    assert_eq!(status.memory.as_deref(), Some("1.0 MiB"));
    assert_eq!(status.restarts, Some(2));
    assert!(status.uptime.is_some());
}

#[tokio::test]
async fn fleet_only_returns_archon_processes() {
    let dir = tempfile::tempdir().unwrap();
    let listing = serde_json::json!([
        {"name": "archon-scout", "pid": 10, "pm2_env": {"status": "online"}},
        {"name": "archon-relay", "pid": 0, "pm2_env": {"status": "stopped"}},
        {"name": "my-blog", "pid": 77, "pm2_env": {"status": "online"}}
    ])
    .to_string();
    let runner = ScriptedRunner::new().respond("pm2 jlist", ok_output(listing.as_bytes()));
    let manager = Pm2Manager::new(runner, sandbox_paths(&dir));

    let fleet = manager.fleet().await.expect("fleet");
    let names: Vec<&str> = fleet.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["scout", "relay"]);
    assert_eq!(fleet[0].state, AgentState::Online);
    assert_eq!(fleet[1].state, AgentState::Stopped);
}

#[tokio::test]
async fn logs_pass_lines_follow_and_channel_flags() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let manager = Pm2Manager::new(runner.clone(), sandbox_paths(&dir));

    let request = LogRequest {
        lines: 200,
        follow: false,
        channel: LogChannel::Stderr,
    };
    manager.logs("scout", &request).await.expect("logs");

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], "pm2 logs archon-scout --lines 200 --nostream --err");
    assert!(
        runner.envs()[0].iter().any(|(k, _)| k == "PM2_HOME"),
        "log streaming must also use the isolated home"
    );
}
