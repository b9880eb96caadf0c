//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use banter_hub::HubSnapshot;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Currently registered sessions.
    pub sessions: usize,
    /// Messages held in the history buffer.
    pub history_len: usize,
}

/// Build a health response from a hub snapshot.
pub fn health_check(started_at: Instant, snapshot: HubSnapshot) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: started_at.elapsed().as_secs(),
        sessions: snapshot.sessions,
        history_len: snapshot.history_len,
    }
}
