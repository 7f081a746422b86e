//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while serving, `"draining"` once shutdown started.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket links.
    pub connections: usize,
    /// Sessions held by the registry.
    pub sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, sessions: usize, draining: bool) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        sessions,
    }
}
