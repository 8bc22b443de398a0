use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the Waypost relay.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::rooms::room_summary,
        crate::routes::rooms::patch_settings,
        crate::routes::websocket::ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::room::RoomSummary,
            crate::dto::room::SettingsPatch,
            crate::dto::ws::WireMessage,
            crate::state::room::RoomState,
            crate::state::room::Participant,
            crate::state::room::Location,
            crate::state::room::Waypoint,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "rooms", description = "Room metadata and settings"),
        (name = "sync", description = "WebSocket room synchronization"),
    )
)]
pub struct ApiDoc;
