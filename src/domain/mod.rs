//! Domain layer — pure types and validation.
//!
//! This module has zero imports from `crate::infra`, `crate::application`,
//! `tokio`, `std::fs`, `std::process`, or `std::net`. All functions are
//! synchronous and take data in, returning data out.

pub mod agent;
pub mod error;
pub mod format;
pub mod validate;

pub use agent::{
    AgentHandle, AgentSpec, AgentState, AgentStatus, Backend, LogChannel, LogRequest,
};
pub use error::{AgentError, DetectError};
pub use validate::{is_valid_agent_name, validate_name, validate_port};
