//! Client-side transport session: one long-lived connection per
//! (room, participant) pair.
//!
//! Local mutations apply to the in-memory snapshot immediately and are
//! queued for the relay; a brief offline period never loses edits, only
//! delays their visibility to others. Consumers observe the session through
//! `watch` channels instead of callbacks: one for merged snapshots, one for
//! connectivity, one for the session phase.

pub mod cache;
mod driver;
pub mod position;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::config::random_marker_color;
use crate::state::merge::RoomChange;
use crate::state::privacy;
use crate::state::room::{
    GeoPoint, Location, Participant, ParticipantStatus, PrivacySettings, RoomSettings, RoomState,
    UnixMillis, Waypoint, WaypointKind, now_ms,
};
use cache::SnapshotCache;
use driver::{Driver, SessionCommand};
pub use position::{PositionError, drive_position_source};

/// Tunables for one sync session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base WebSocket endpoint of the relay, e.g. `ws://host:8080/ws`.
    pub server_url: Url,
    /// Slug of the room to synchronize with.
    pub slug: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Bounded wait for connection establishment and the `request_state` answer.
    pub handshake_timeout: Duration,
    /// Window after which consumers should treat a peer as possibly offline.
    pub staleness_window: Duration,
    /// Warm-start cache; `None` disables persistence entirely.
    pub cache: Option<SnapshotCache>,
}

impl SessionConfig {
    /// Session config with the default timing for mobile-ish networks.
    pub fn new(server_url: Url, slug: impl Into<String>) -> Self {
        Self {
            server_url,
            slug: slug.into(),
            reconnect_delay: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            staleness_window: Duration::from_secs(90),
            cache: None,
        }
    }

    /// The room's WebSocket URL under the relay base endpoint.
    pub(crate) fn room_url(&self) -> Url {
        let mut url = self.server_url.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/{}", self.slug));
        url
    }
}

/// Build a fresh participant profile: session-scoped random id and a marker
/// color drawn from the fixed palette, both assigned at join time.
pub fn new_participant(name: impl Into<String>) -> Participant {
    Participant::new(Uuid::new_v4(), name, random_marker_color(), now_ms())
}

/// Where the session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Attempting to reach the relay.
    Connecting,
    /// Connected and reconciled; changes flow both ways.
    Joined,
    /// Connection lost; local edits queue until the next attempt succeeds.
    Disconnected,
    /// The relay refused the join (room full). Terminal; not retried.
    Rejected,
    /// `leave()` completed. Terminal.
    Closed,
}

/// Handle to a running sync session.
///
/// Cheap to clone pieces out of; all mutation goes through the single driver
/// task, so merges and sends are serialized per session.
pub struct SyncSession {
    self_id: Uuid,
    staleness_window: Duration,
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<Arc<RoomState>>,
    connectivity: watch::Receiver<bool>,
    phase: watch::Receiver<SessionPhase>,
}

impl SyncSession {
    /// Join a room: seed local state from the warm-start cache (or empty),
    /// insert our own record optimistically, and spawn the driver task that
    /// owns the connection. Must be called within a Tokio runtime.
    pub fn join(config: SessionConfig, participant: Participant) -> Self {
        let self_id = participant.id;
        let staleness_window = config.staleness_window;

        let initial = config
            .cache
            .as_ref()
            .and_then(|cache| cache.load(&config.slug))
            .unwrap_or_else(|| RoomState::new(config.slug.clone(), now_ms(), RoomSettings::default()));
        let initial = match initial.set_participant(participant.clone()) {
            Ok(state) => state,
            Err(_) => {
                // The cached registry is already at the cap. The relay is the
                // capacity authority; a client never refuses itself locally.
                let mut state = initial;
                state.participants.insert(self_id, participant);
                state
            }
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial.clone()));
        let (connectivity_tx, connectivity_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Connecting);

        let driver = Driver::new(
            config,
            self_id,
            initial,
            command_rx,
            snapshot_tx,
            connectivity_tx,
            phase_tx,
        );
        tokio::spawn(driver.run());

        Self {
            self_id,
            staleness_window,
            commands: command_tx,
            snapshots: snapshot_rx,
            connectivity: connectivity_rx,
            phase: phase_rx,
        }
    }

    /// Our own participant id.
    pub fn participant_id(&self) -> Uuid {
        self.self_id
    }

    /// Staleness window consumers should gray out peers after.
    pub fn staleness_window(&self) -> Duration {
        self.staleness_window
    }

    /// The current merged snapshot.
    pub fn snapshot(&self) -> Arc<RoomState> {
        self.snapshots.borrow().clone()
    }

    /// Watch channel carrying every merged snapshot.
    pub fn snapshots(&self) -> watch::Receiver<Arc<RoomState>> {
        self.snapshots.clone()
    }

    /// The snapshot channel as a `Stream`, for rendering surfaces.
    pub fn snapshot_stream(&self) -> WatchStream<Arc<RoomState>> {
        WatchStream::new(self.snapshots.clone())
    }

    /// Watch channel flipping with relay connectivity.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.clone()
    }

    /// Watch channel carrying the session phase, including the terminal
    /// "room full" refusal.
    pub fn phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    /// Enqueue a raw change: applied to local state immediately, delivered
    /// to the relay when connectivity allows.
    pub fn send_change(&self, change: RoomChange) {
        if self
            .commands
            .send(SessionCommand::Change(change))
            .is_err()
        {
            warn!("session already closed; dropping change");
        }
    }

    /// Entry point for the geolocation collaborator.
    ///
    /// Failed observations are logged and never merged. Good observations
    /// pass through the privacy transform, which may coarsen or withhold
    /// them entirely.
    pub fn publish_position(&self, observation: Result<Location, PositionError>) {
        let observed = match observation {
            Ok(location) => location,
            Err(err) => {
                warn!(error = %err, "dropping failed position observation");
                return;
            }
        };
        let snapshot = self.snapshot();
        let Some(me) = snapshot.participant(self.self_id) else {
            return;
        };
        match privacy::reported_location(&observed, &me.privacy) {
            Some(reported) => self.send_change(RoomChange::Location {
                participant_id: self.self_id,
                location: Some(reported),
            }),
            None => debug!("withholding position (sharing disabled or ghost mode)"),
        }
    }

    /// Stop sharing: withdraw our published location everywhere.
    pub fn stop_sharing(&self) {
        self.send_change(RoomChange::Location {
            participant_id: self.self_id,
            location: None,
        });
    }

    /// Update our presence status.
    pub fn set_status(&self, status: ParticipantStatus) {
        self.send_change(RoomChange::Status {
            participant_id: self.self_id,
            status,
        });
    }

    /// Update our privacy settings by re-announcing our own record.
    pub fn update_privacy(&self, privacy: PrivacySettings) {
        let snapshot = self.snapshot();
        let Some(me) = snapshot.participant(self.self_id) else {
            return;
        };
        let mut updated = me.clone();
        updated.privacy = privacy;
        updated.last_seen = updated.last_seen.max(now_ms());
        self.send_change(RoomChange::Join {
            participant: updated,
        });
    }

    /// Place a waypoint, returning its id.
    pub fn add_waypoint(
        &self,
        name: impl Into<String>,
        glyph: Option<String>,
        position: GeoPoint,
        kind: WaypointKind,
    ) -> Uuid {
        let waypoint = Waypoint {
            id: Uuid::new_v4(),
            name: name.into(),
            glyph,
            position,
            creator: self.self_id,
            created_at: now_ms(),
            kind,
        };
        let id = waypoint.id;
        self.send_change(RoomChange::WaypointAdd { waypoint });
        id
    }

    /// Remove a waypoint. Wins against any concurrently racing add of the
    /// same id.
    pub fn remove_waypoint(&self, waypoint_id: Uuid) {
        self.send_change(RoomChange::WaypointRemove { waypoint_id });
    }

    /// Whether a peer should be treated as possibly offline.
    pub fn is_peer_stale(&self, peer: &Participant, now: UnixMillis) -> bool {
        peer.is_stale(now, self.staleness_window.as_millis() as UnixMillis)
    }

    /// Leave the room and tear the session down.
    ///
    /// Safe to call at any time, including mid-reconnect: pending reconnect
    /// timers are cancelled and the connection released before this returns.
    /// Idempotent; a second call returns immediately.
    pub async fn leave(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(SessionCommand::Leave(ack)).is_ok() {
            let _ = done.await;
        }
    }
}
