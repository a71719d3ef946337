//! Host backend detection and interpreter resolution.
//!
//! Detection is deterministic per host and side-effect-free: the backend is
//! selected once per process run and not expected to change during it.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::domain::agent::Backend;
use crate::domain::error::DetectError;

/// The interpreter agent scripts run under.
pub const INTERPRETER: &str = "node";

/// Conventional install locations probed when the interpreter is not on PATH.
const FALLBACK_BIN_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"];

/// Standard system binary directories appended to every managed PATH.
const SYSTEM_BIN_DIRS: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin"];

/// Select the service-manager backend for this host.
///
/// macOS hosts get launchd. Linux hosts get systemd user units — unless the
/// kernel identifies itself as a Windows-hosted personality (WSL), where
/// per-user units are unreliable or absent, so the pm2 fallback is used.
/// Anything else gets the pm2 fallback.
#[must_use]
pub fn detect_backend() -> Backend {
    if cfg!(target_os = "macos") {
        Backend::Launchd
    } else if cfg!(target_os = "linux") {
        let release = std::fs::read_to_string("/proc/version").unwrap_or_default();
        if kernel_release_is_wsl(&release) {
            Backend::Pm2
        } else {
            Backend::Systemd
        }
    } else {
        Backend::Pm2
    }
}

/// Returns `true` if a kernel version string carries the WSL vendor markers.
#[must_use]
pub fn kernel_release_is_wsl(release: &str) -> bool {
    let lowered = release.to_ascii_lowercase();
    lowered.contains("microsoft") || lowered.contains("wsl")
}

/// Locate the agent interpreter: first the caller's PATH, then the
/// conventional install directories.
///
/// # Errors
///
/// Returns [`DetectError::InterpreterNotFound`] when no candidate exists on
/// disk. This is a fatal precondition — nothing else can succeed — so it is
/// raised immediately and never retried.
pub fn resolve_interpreter() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("PATH")
        && let Some(found) = find_in_search_path(INTERPRETER, &path)
    {
        return Ok(found);
    }
    for dir in FALLBACK_BIN_DIRS {
        let candidate = Path::new(dir).join(INTERPRETER);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(DetectError::InterpreterNotFound {
        interpreter: INTERPRETER,
        searched: FALLBACK_BIN_DIRS.join(", "),
    }
    .into())
}

/// Walk a PATH-style search string for `bin`, requiring the hit to exist.
#[must_use]
pub fn find_in_search_path(bin: &str, search_path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}

/// Build the PATH injected into managed processes: the interpreter's own
/// directory first — service managers do not inherit the user's shell
/// environment, so the interpreter must be locatable without it — then the
/// standard system directories, de-duplicated.
#[must_use]
pub fn managed_path(interpreter: &Path) -> String {
    let mut dirs: Vec<String> = Vec::new();
    if let Some(parent) = interpreter.parent() {
        dirs.push(parent.to_string_lossy().into_owned());
    }
    for dir in SYSTEM_BIN_DIRS {
        if !dirs.iter().any(|d| d == dir) {
            dirs.push((*dir).to_string());
        }
    }
    dirs.join(":")
}
