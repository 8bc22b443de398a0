/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// WebSocket connection lifecycle on the relay side.
pub mod relay_service;
/// Per-room single-writer actor holding the authoritative state.
pub mod room_actor;
