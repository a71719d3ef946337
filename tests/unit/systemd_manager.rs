//! Unit tests for the systemd platform manager.
//!
//! IMPORTANT: tests that exercise `install` prepend a fake interpreter
//! directory to `PATH` and are marked `#[serial]`.

#![allow(clippy::expect_used, clippy::unwrap_used, unsafe_code)]

use archon::application::ports::ProcessManager;
use archon::domain::agent::{AgentSpec, AgentState, LogRequest};
use archon::infra::systemd::SystemdManager;
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

#[tokio::test]
#[serial]
async fn install_writes_the_unit_and_reloads_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    prepend_fake_interpreter(&dir);
    let paths = sandbox_paths(&dir);
    let runner = ScriptedRunner::new();
    let manager = SystemdManager::new(runner.clone(), paths.clone());

    manager.install(&spec(&dir)).await.expect("install");

    let rendered = std::fs::read_to_string(paths.unit_path("scout")).expect("unit written");
    assert!(rendered.contains("Description=Archon agent scout"));
    assert!(rendered.contains("Restart=on-failure"));
    assert!(rendered.contains("Environment=\"ARCHON_PORT=4100\""));
    assert!(
        runner.saw_call_starting("systemctl --user daemon-reload"),
        "install must reload the unit cache: {:?}",
        runner.calls()
    );
}

#[tokio::test]
#[serial]
async fn install_warns_but_succeeds_when_lingering_is_off() {
    let dir = tempfile::tempdir().unwrap();
    prepend_fake_interpreter(&dir);
    let runner = ScriptedRunner::new().respond("loginctl show-user", ok_output(b"Linger=no\n"));
    let manager = SystemdManager::new(runner, sandbox_paths(&dir));

    manager
        .install(&spec(&dir))
        .await
        .expect("a disabled linger setting must not fail the install");
}

#[tokio::test]
async fn start_errors_when_not_installed() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let manager = SystemdManager::new(runner.clone(), sandbox_paths(&dir));

    let err = manager.start("scout").await.expect_err("expected Err");
    assert!(err.to_string().contains("not installed"));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn start_enables_now_and_reads_back_the_main_pid() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(&dir);
    std::fs::create_dir_all(paths.systemd_user_dir()).unwrap();
    std::fs::write(paths.unit_path("scout"), "[Unit]\n").unwrap();

    let runner = ScriptedRunner::new().respond(
        "systemctl --user show archon-scout.service --property=MainPID --value",
        ok_output(b"941\n"),
    );
    let manager = SystemdManager::new(runner.clone(), paths);

    let handle = manager.start("scout").await.expect("start");
    assert_eq!(handle.pid, Some(941));
    assert!(
        runner.saw_call_starting("systemctl --user enable --now archon-scout.service"),
        "start must enable so the agent survives the next login: {:?}",
        runner.calls()
    );
}

#[tokio::test]
async fn start_reports_unknown_pid_when_systemd_says_zero() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(&dir);
    std::fs::create_dir_all(paths.systemd_user_dir()).unwrap();
    std::fs::write(paths.unit_path("scout"), "[Unit]\n").unwrap();

    let runner = ScriptedRunner::new().respond(
        "systemctl --user show archon-scout.service --property=MainPID --value",
        ok_output(b"0\n"),
    );
    let manager = SystemdManager::new(runner, paths);

    let handle = manager.start("scout").await.expect("start");
    assert_eq!(handle.pid, None);
}

#[tokio::test]
async fn stop_tolerates_a_unit_that_is_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new().respond(
        "systemctl --user stop",
        err_output(b"Failed to stop archon-scout.service: Unit archon-scout.service not loaded."),
    );
    let manager = SystemdManager::new(runner, sandbox_paths(&dir));

    manager.stop("scout").await.expect("stop must tolerate not loaded");
}

#[tokio::test]
async fn uninstall_disables_removes_and_reloads_even_if_disable_fails() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(&dir);
    std::fs::create_dir_all(paths.systemd_user_dir()).unwrap();
    let unit_path = paths.unit_path("scout");
    std::fs::write(&unit_path, "[Unit]\n").unwrap();

    let runner = ScriptedRunner::new().respond(
        "systemctl --user disable --now",
        err_output(b"Failed to disable unit: Unit file archon-scout.service does not exist."),
    );
    let manager = SystemdManager::new(runner.clone(), paths);

    manager.uninstall("scout").await.expect("uninstall");
    assert!(!unit_path.exists());
    assert!(runner.saw_call_starting("systemctl --user daemon-reload"));
}

#[tokio::test]
async fn status_is_unknown_without_a_unit_file() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let manager = SystemdManager::new(runner.clone(), sandbox_paths(&dir));

    let status = manager.status("ghost").await.expect("status");
    assert_eq!(status.state, AgentState::Unknown);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn status_reads_all_three_properties_in_one_call() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(&dir);
    std::fs::create_dir_all(paths.systemd_user_dir()).unwrap();
    std::fs::write(paths.unit_path("scout"), "[Unit]\n").unwrap();

    let runner = ScriptedRunner::new().respond(
        "systemctl --user show archon-scout.service",
        ok_output(b"ActiveState=active\nMainPID=941\nMemoryCurrent=44302336\n"),
    );
    let manager = SystemdManager::new(runner.clone(), paths);

    let status = manager.status("scout").await.expect("status");
    assert_eq!(status.state, AgentState::Online);
    assert_eq!(status.pid, Some(941));
    assert_eq!(status.memory.as_deref(), Some("42.3 MiB"));

    let show_calls: Vec<String> = runner
        .calls()
        .into_iter()
        .filter(|c| c.contains("show"))
        .collect();
    assert_eq!(show_calls.len(), 1, "one property query per status call");
    assert!(show_calls[0].contains("ActiveState,MainPID,MemoryCurrent"));
}

#[tokio::test]
async fn failed_unit_maps_to_errored() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_paths(&dir);
    std::fs::create_dir_all(paths.systemd_user_dir()).unwrap();
    std::fs::write(paths.unit_path("scout"), "[Unit]\n").unwrap();

    let runner = ScriptedRunner::new().respond(
        "systemctl --user show archon-scout.service",
        ok_output(b"ActiveState=failed\nMainPID=0\nMemoryCurrent=[not set]\n"),
    );
    let manager = SystemdManager::new(runner, paths);

    let status = manager.status("scout").await.expect("status");
    assert_eq!(status.state, AgentState::Errored);
    assert_eq!(status.pid, None);
    assert_eq!(status.memory, None);
}

#[tokio::test]
async fn fleet_lists_only_archon_units() {
    let dir = tempfile::tempdir().unwrap();
    let listing = b"archon-scout.service loaded active running Archon agent scout\n\
                    archon-relay.service loaded failed failed Archon agent relay\n\
                    other.service loaded active running Something else\n";
    let runner = ScriptedRunner::new().respond("systemctl --user list-units", ok_output(listing));
    let manager = SystemdManager::new(runner.clone(), sandbox_paths(&dir));

    let fleet = manager.fleet().await.expect("fleet");
    let names: Vec<&str> = fleet.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["scout", "relay"]);
    assert_eq!(fleet[0].state, AgentState::Online);
    assert_eq!(fleet[1].state, AgentState::Errored);
    assert!(
        runner.saw_call_starting("systemctl --user list-units --all --plain --no-legend archon-*"),
        "{:?}",
        runner.calls()
    );
}

#[tokio::test]
async fn logs_stream_from_the_journal() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let manager = SystemdManager::new(runner.clone(), sandbox_paths(&dir));

    let request = LogRequest {
        lines: 100,
        follow: true,
        ..LogRequest::default()
    };
    manager.logs("scout", &request).await.expect("logs");

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0],
        "journalctl --user -u archon-scout.service -n 100 -f"
    );
}

/// The spec's round trip: install → start → status(online) → stop →
/// status(stopped) → uninstall → config file absent.
#[tokio::test]
#[serial]
async fn round_trip_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    prepend_fake_interpreter(&dir);
    let paths = sandbox_paths(&dir);
    let unit_path = paths.unit_path("scout");

    let runner = ScriptedRunner::new()
        .respond(
            "systemctl --user show archon-scout.service --property=MainPID --value",
            ok_output(b"941\n"),
        )
        .respond(
            "systemctl --user show archon-scout.service --property=ActiveState",
            ok_output(b"ActiveState=active\nMainPID=941\nMemoryCurrent=1048576\n"),
        )
        .respond(
            "systemctl --user show archon-scout.service --property=ActiveState",
            ok_output(b"ActiveState=inactive\nMainPID=0\nMemoryCurrent=[not set]\n"),
        );
    let manager = SystemdManager::new(runner, paths);

    manager.install(&spec(&dir)).await.expect("install");
    assert!(unit_path.exists());

    let handle = manager.start("scout").await.expect("start");
    assert_eq!(handle.pid, Some(941));

    let up = manager.status("scout").await.expect("status while up");
    assert_eq!(up.state, AgentState::Online);
    assert!(up.pid.is_some_and(|pid| pid > 0));

    manager.stop("scout").await.expect("stop");
    let down = manager.status("scout").await.expect("status after stop");
    assert!(matches!(down.state, AgentState::Stopped | AgentState::Unknown));

    manager.uninstall("scout").await.expect("uninstall");
    assert!(!unit_path.exists(), "uninstall must remove the unit file");
}
