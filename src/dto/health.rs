use serde::Serialize;
use utoipa::ToSchema;

/// Simple health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status (always "ok"; the relay has no external dependencies).
    pub status: String,
    /// Number of live rooms in the registry.
    pub rooms: usize,
    /// Number of currently-connected WebSocket sessions.
    pub sessions: usize,
}

impl HealthResponse {
    /// Create a health response with the current registry counters.
    pub fn ok(rooms: usize, sessions: usize) -> Self {
        Self {
            status: "ok".to_string(),
            rooms,
            sessions,
        }
    }
}
