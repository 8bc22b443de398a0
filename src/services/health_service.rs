use crate::{dto::health::HealthResponse, state::SharedState};

/// Respond with the current registry counters.
pub fn health_status(state: &SharedState) -> HealthResponse {
    HealthResponse::ok(state.room_count(), state.session_count())
}
