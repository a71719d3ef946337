//! Typed domain error enums.
//!
//! All error types implement `thiserror::Error` and convert to
//! `anyhow::Error` via the `?` operator. Validation and precondition errors
//! are raised before any backend command is spawned.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by input validation and lifecycle preconditions.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(
        "Invalid agent name '{0}': must match ^[A-Za-z0-9][A-Za-z0-9-]*$ and be at most 64 characters"
    )]
    InvalidName(String),

    #[error("Invalid port {0}: must be between 1024 and 65535")]
    InvalidPort(u16),

    #[error("Agent script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error("Agent '{0}' is not installed. Install it first with agent_start.")]
    NotInstalled(String),
}

/// Fatal environment-detection errors. Nothing can succeed after one of
/// these, so they are raised immediately and never retried.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error(
        "Could not find the '{interpreter}' interpreter on PATH or in {searched}.\n\
         Install Node.js (https://nodejs.org) and retry."
    )]
    InterpreterNotFound {
        interpreter: &'static str,
        searched: String,
    },
}
