use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, patch},
};
use tokio::sync::oneshot;
use tokio::time::timeout;
use validator::Validate;

use crate::{
    dto::room::{RoomSummary, SettingsPatch},
    dto::validation::validate_room_slug,
    error::{AppError, ServiceError},
    services::room_actor::RoomCommand,
    state::{RoomHandle, SharedState},
};

/// Bounded wait for a room actor to answer a registry query.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Routes exposing room metadata to join screens and settings management.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/api/rooms/{slug}", get(room_summary))
        .route("/api/rooms/{slug}/settings", patch(patch_settings))
}

#[utoipa::path(
    get,
    path = "/api/rooms/{slug}",
    tag = "rooms",
    params(("slug" = String, Path, description = "Room slug")),
    responses(
        (status = 200, description = "Room summary", body = RoomSummary),
        (status = 404, description = "No active room under this slug")
    )
)]
/// Summarize an active room for a join screen.
pub async fn room_summary(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> Result<Json<RoomSummary>, AppError> {
    validate_room_slug(&slug).map_err(|err| AppError::BadRequest(err.to_string()))?;
    let room = state
        .room(&slug)
        .ok_or_else(|| AppError::NotFound(format!("room `{slug}` not found")))?;
    let snapshot = inspect_room(&room).await?;
    Ok(Json(RoomSummary::from(&snapshot)))
}

#[utoipa::path(
    patch,
    path = "/api/rooms/{slug}/settings",
    tag = "rooms",
    params(("slug" = String, Path, description = "Room slug")),
    request_body = SettingsPatch,
    responses(
        (status = 200, description = "Updated room summary", body = RoomSummary),
        (status = 404, description = "No active room under this slug")
    )
)]
/// Update a room's display name or settings, bumping its metadata revision.
///
/// Clients pick the new metadata up through their next `full_state`
/// reconcile; there is no dedicated broadcast for it.
pub async fn patch_settings(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
    Json(body): Json<SettingsPatch>,
) -> Result<Json<RoomSummary>, AppError> {
    validate_room_slug(&slug).map_err(|err| AppError::BadRequest(err.to_string()))?;
    body.validate()?;

    let room = state
        .room(&slug)
        .ok_or_else(|| AppError::NotFound(format!("room `{slug}` not found")))?;
    let current = inspect_room(&room).await?;
    let settings = body.apply_to(&current.meta.settings);

    let (reply, answer) = oneshot::channel();
    if !room.send(RoomCommand::UpdateSettings {
        name: body.name.clone(),
        settings,
        reply,
    }) {
        return Err(ServiceError::RoomGone.into());
    }
    let updated = timeout(INSPECT_TIMEOUT, answer)
        .await
        .map_err(|_| ServiceError::Timeout)?
        .map_err(|_| ServiceError::RoomGone)?;

    Ok(Json(RoomSummary::from(&updated)))
}

async fn inspect_room(room: &RoomHandle) -> Result<crate::state::room::RoomState, ServiceError> {
    let (reply, answer) = oneshot::channel();
    if !room.send(RoomCommand::Inspect { reply }) {
        return Err(ServiceError::RoomGone);
    }
    timeout(INSPECT_TIMEOUT, answer)
        .await
        .map_err(|_| ServiceError::Timeout)?
        .map_err(|_| ServiceError::RoomGone)
}
