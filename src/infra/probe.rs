//! Agent health probe — implements `HealthProbe` over plain HTTP.
//!
//! Agents that register a port are expected (but not required) to serve
//! `GET /health` on it. The probe runs with a short timeout inside
//! `spawn_blocking`; every failure mode collapses to `None` so status
//! queries stay infallible.

use std::time::Duration;

use tracing::debug;

use crate::application::ports::{HealthProbe, HealthReport};

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Production probe using `ureq` bridged through `spawn_blocking`.
pub struct UreqHealthProbe;

impl HealthProbe for UreqHealthProbe {
    async fn probe(&self, port: u16) -> Option<HealthReport> {
        let result = tokio::task::spawn_blocking(move || probe_blocking(port)).await;
        match result {
            Ok(report) => report,
            Err(join_error) => {
                debug!(%join_error, "health probe task failed");
                None
            }
        }
    }
}

fn probe_blocking(port: u16) -> Option<HealthReport> {
    let url = format!("http://127.0.0.1:{port}/health");
    let response = ureq::get(&url).timeout(PROBE_TIMEOUT).call().ok()?;
    let body: serde_json::Value = response.into_json().ok()?;
    Some(report_from_json(&body))
}

/// Pull the optional enrichment fields out of a health response body.
#[must_use]
pub fn report_from_json(body: &serde_json::Value) -> HealthReport {
    HealthReport {
        uptime_secs: body.get("uptime_secs").and_then(serde_json::Value::as_u64),
        memory_mb: body.get("memory_mb").and_then(serde_json::Value::as_f64),
    }
}
