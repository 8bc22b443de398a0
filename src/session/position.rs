//! Seam to the geolocation collaborator.
//!
//! The core never talks to a positioning API itself; it consumes a stream of
//! observations, each either a fix or a distinguishable failure. Failed
//! observations are never merged into room state.

use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::info;

use crate::session::SyncSession;
use crate::state::room::Location;

/// Failure modes of a position source, mirrored from the platform APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PositionError {
    /// The user denied the permission prompt.
    #[error("position permission denied")]
    PermissionDenied,
    /// No fix could be produced (no signal, sensors off).
    #[error("position unavailable")]
    Unavailable,
    /// The source gave up waiting for a fix.
    #[error("position request timed out")]
    Timeout,
}

/// Feed a position stream into a session until the stream ends.
///
/// Each observation goes through [`SyncSession::publish_position`], so the
/// session's privacy settings decide what, if anything, actually leaves the
/// device.
pub async fn drive_position_source<S>(session: &SyncSession, mut observations: S)
where
    S: Stream<Item = Result<Location, PositionError>> + Unpin,
{
    while let Some(observation) = observations.next().await {
        session.publish_position(observation);
    }
    info!("position source ended");
}
