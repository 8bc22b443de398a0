use axum::{
    Router,
    extract::{Path, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};

use crate::{services::relay_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/ws/{slug}",
    tag = "sync",
    params(("slug" = String, Path, description = "Room slug to synchronize with")),
    responses((status = 101, description = "Switching protocols to WebSocket"))
)]
/// Upgrade the HTTP connection into a room synchronization session.
pub async fn ws_handler(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_service::handle_socket(state, socket, slug))
}

/// Configure the WebSocket endpoint.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/ws/{slug}", get(ws_handler))
}
