//! Replicated room data model: metadata, participant registry, waypoint set.
//!
//! Every mutation is copy-on-write: it returns a fresh [`RoomState`] and never
//! touches state visible to a caller holding a previous snapshot. The merge
//! rules that reconcile concurrent snapshots live in [`super::merge`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Milliseconds since the Unix epoch, the clock unit used on the wire.
pub type UnixMillis = u64;

/// How long a room lives past its last accepted change.
pub const ROOM_TTL_MS: UnixMillis = 7 * 24 * 60 * 60 * 1000;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> UnixMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as UnixMillis)
        .unwrap_or(0)
}

/// Hex marker color (e.g. `#e6194b`) assigned to a participant at join time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MarkerColor(pub String);

impl Default for MarkerColor {
    fn default() -> Self {
        Self("#808080".into())
    }
}

/// Presence status of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// Actively sharing and interacting.
    Online,
    /// Joined but idle (backgrounded tab, locked phone).
    Away,
    /// Joined but withholding location from others.
    Ghost,
    /// Known to the room but currently unreachable.
    Offline,
}

/// How much of a participant's exact position is revealed to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionLevel {
    /// Full-resolution coordinates.
    #[default]
    Exact,
    /// Rounded to roughly building granularity.
    Building,
    /// Rounded to roughly neighbourhood granularity.
    Area,
    /// Rounded to roughly city-district granularity.
    Approximate,
}

/// Per-participant privacy knobs, owned and mutated only by that participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PrivacySettings {
    /// Master switch for publishing any location at all.
    pub sharing_enabled: bool,
    /// Granularity of the published position.
    pub precision: PrecisionLevel,
    /// Whether the indoor floor/space detail is revealed.
    pub show_floor: bool,
    /// Ghost mode: stay joined but publish no location.
    pub ghost: bool,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            sharing_enabled: true,
            precision: PrecisionLevel::Exact,
            show_floor: true,
            ghost: false,
        }
    }
}

/// Where a location observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    /// Device GPS fix.
    Gps,
    /// Cell/Wi-Fi network estimate.
    Network,
    /// Manually placed by the participant.
    Manual,
    /// Translated by the indoor-positioning proxy.
    IndoorPositioning,
}

/// Indoor sub-position produced by the indoor-positioning collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct IndoorPosition {
    /// Floor index (0 = ground, negative = basement).
    pub level: i32,
    /// Local x coordinate within the venue's floor plan.
    pub x: f64,
    /// Local y coordinate within the venue's floor plan.
    pub y: f64,
    /// Optional human-readable space label ("Hall H", "Foyer").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
}

/// One position observation. Always replaced wholesale, never field-merged:
/// a new observation fully supersedes the previous one for that participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Location {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Estimated accuracy radius in meters.
    pub accuracy_m: f64,
    /// Altitude in meters, when the source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude_m: Option<f64>,
    /// Heading in degrees clockwise from true north.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
    /// Ground speed in meters per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    /// Observation time; last-writer-wins comparisons use this, never arrival time.
    pub timestamp: UnixMillis,
    /// Producer of this observation.
    pub source: LocationSource,
    /// Indoor sub-position, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indoor: Option<IndoorPosition>,
}

/// One joined member of a room, identified for the browsing session's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Participant {
    /// Session-scoped random id, generated once per browsing session.
    pub id: Uuid,
    /// Display name shown next to the marker.
    pub name: String,
    /// Avatar glyph (emoji or single character).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Marker color drawn from the relay's palette at join time.
    pub color: MarkerColor,
    /// When this participant first joined the room.
    pub joined_at: UnixMillis,
    /// Last time a mutation touched this participant.
    pub last_seen: UnixMillis,
    /// Presence status.
    pub status: ParticipantStatus,
    /// Most recent shared location, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Privacy configuration, mutated only by the owning client.
    pub privacy: PrivacySettings,
}

impl Participant {
    /// Build a fresh participant record joining at `now`.
    pub fn new(id: Uuid, name: impl Into<String>, color: MarkerColor, now: UnixMillis) -> Self {
        Self {
            id,
            name: name.into(),
            avatar: None,
            color,
            joined_at: now,
            last_seen: now,
            status: ParticipantStatus::Online,
            location: None,
            privacy: PrivacySettings::default(),
        }
    }

    /// Whether this participant has not been heard from within `window_ms`.
    ///
    /// Consumers use this to gray out markers; the client core never evicts
    /// on staleness by itself.
    pub fn is_stale(&self, now: UnixMillis, window_ms: UnixMillis) -> bool {
        now.saturating_sub(self.last_seen) > window_ms
    }
}

/// Latitude/longitude pair for waypoints: the location shape without
/// accuracy or movement fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoPoint {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Indoor sub-position, when the point sits inside a mapped venue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indoor: Option<IndoorPosition>,
}

/// Category of a shared waypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WaypointKind {
    /// Agreed meeting point.
    Meetup,
    /// Scheduled happening at a place and time.
    Event,
    /// General point of interest.
    Poi,
    /// Anything else.
    Custom,
}

/// A shared map annotation placed by any participant.
///
/// Waypoints are append/remove only; "editing" is remove-then-add by
/// convention, so there is no update operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Waypoint {
    /// Random id generated at creation.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Optional glyph shown on the marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glyph: Option<String>,
    /// Where the waypoint sits.
    pub position: GeoPoint,
    /// Participant that placed it.
    pub creator: Uuid,
    /// When it was placed.
    pub created_at: UnixMillis,
    /// Category.
    pub kind: WaypointKind,
}

/// Tunable per-room settings, merged by metadata revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RoomSettings {
    /// Hard cap on concurrently-registered participants.
    pub max_participants: usize,
    /// Precision policy suggested to joining clients.
    pub default_precision: PrecisionLevel,
    /// Whether the indoor overlay is enabled for this room.
    pub indoor_enabled: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_participants: 10,
            default_precision: PrecisionLevel::Exact,
            indoor_enabled: true,
        }
    }
}

/// Room identity and metadata; last-writer-wins by `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RoomMeta {
    /// Opaque room id.
    pub id: Uuid,
    /// Human-chosen slug; one active room per slug.
    pub slug: String,
    /// Display name, defaults to the slug.
    pub name: String,
    /// Creation time.
    pub created_at: UnixMillis,
    /// Participant that created the room, set on the first accepted join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<Uuid>,
    /// Inactivity horizon; refreshed on every accepted change.
    pub expires_at: UnixMillis,
    /// Monotonically increasing counter, bumped on every accepted metadata change.
    pub revision: u64,
    /// Room settings.
    pub settings: RoomSettings,
}

/// Error returned when a join would exceed the room's participant cap.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("room is full ({max} participants)")]
pub struct RoomFull {
    /// The cap that was hit.
    pub max: usize,
}

/// The current merged view of one room: the aggregate root owning its
/// participants and waypoints. No cross-room references exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RoomState {
    /// Room identity, settings, and revisioned metadata.
    pub meta: RoomMeta,
    /// Registry of joined participants keyed by id.
    pub participants: BTreeMap<Uuid, Participant>,
    /// Live waypoints keyed by id.
    pub waypoints: BTreeMap<Uuid, Waypoint>,
    /// Waypoint ids that must not be present; applied after set union so a
    /// remove racing an add for the same id always results in removed.
    pub removed_waypoints: BTreeSet<Uuid>,
}

impl RoomState {
    /// Build an empty room created at `now` with the given settings.
    pub fn new(slug: impl Into<String>, now: UnixMillis, settings: RoomSettings) -> Self {
        let slug = slug.into();
        Self {
            meta: RoomMeta {
                id: Uuid::new_v4(),
                name: slug.clone(),
                slug,
                created_at: now,
                creator: None,
                expires_at: now + ROOM_TTL_MS,
                revision: 0,
                settings,
            },
            participants: BTreeMap::new(),
            waypoints: BTreeMap::new(),
            removed_waypoints: BTreeSet::new(),
        }
    }

    /// Iterate over the registered participants in id order.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Look up one participant.
    pub fn participant(&self, id: Uuid) -> Option<&Participant> {
        self.participants.get(&id)
    }

    /// Number of currently-registered participants.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Whether another (new) participant would exceed the cap.
    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.meta.settings.max_participants
    }

    /// Iterate over the live waypoints in id order.
    pub fn waypoints(&self) -> impl Iterator<Item = &Waypoint> {
        self.waypoints.values()
    }

    /// Look up one waypoint.
    pub fn waypoint(&self, id: Uuid) -> Option<&Waypoint> {
        self.waypoints.get(&id)
    }

    /// Whether the room is past its inactivity horizon.
    pub fn is_expired(&self, now: UnixMillis) -> bool {
        now > self.meta.expires_at
    }

    /// Upsert a participant record, rejecting joins beyond the cap.
    ///
    /// An update of an already-registered id never trips the capacity check.
    pub fn set_participant(&self, participant: Participant) -> Result<Self, RoomFull> {
        if !self.participants.contains_key(&participant.id) && self.is_full() {
            return Err(RoomFull {
                max: self.meta.settings.max_participants,
            });
        }
        let mut next = self.clone();
        if next.meta.creator.is_none() {
            next.meta.creator = Some(participant.id);
        }
        next.participants.insert(participant.id, participant);
        Ok(next)
    }

    /// Delete a participant from the registry. Not a tombstone: the id simply
    /// disappears, and clients never reuse ids within a room's lifetime.
    pub fn remove_participant(&self, id: Uuid) -> Self {
        let mut next = self.clone();
        next.participants.remove(&id);
        next
    }

    /// Replace a participant's location wholesale, stamping `last_seen` with
    /// the observation time.
    pub fn set_location(&self, id: Uuid, location: Location) -> Self {
        let mut next = self.clone();
        if let Some(p) = next.participants.get_mut(&id) {
            p.last_seen = p.last_seen.max(location.timestamp);
            p.location = Some(location);
        }
        next
    }

    /// Stop sharing: clear the participant's location ("never shared" and
    /// "stopped sharing" both end as `None`; the wire distinguishes them).
    pub fn clear_location(&self, id: Uuid, at: UnixMillis) -> Self {
        let mut next = self.clone();
        if let Some(p) = next.participants.get_mut(&id) {
            p.last_seen = p.last_seen.max(at);
            p.location = None;
        }
        next
    }

    /// Update a participant's presence status.
    pub fn set_status(&self, id: Uuid, status: ParticipantStatus, at: UnixMillis) -> Self {
        let mut next = self.clone();
        if let Some(p) = next.participants.get_mut(&id) {
            p.last_seen = p.last_seen.max(at);
            p.status = status;
        }
        next
    }

    /// Add a waypoint. A previously removed id stays removed: removal wins
    /// over a racing add so stale points never resurrect.
    pub fn add_waypoint(&self, waypoint: Waypoint) -> Self {
        if self.removed_waypoints.contains(&waypoint.id) {
            return self.clone();
        }
        let mut next = self.clone();
        next.waypoints.insert(waypoint.id, waypoint);
        next
    }

    /// Remove a waypoint and remember the removal.
    pub fn remove_waypoint(&self, id: Uuid) -> Self {
        let mut next = self.clone();
        next.waypoints.remove(&id);
        next.removed_waypoints.insert(id);
        next
    }

    /// Refresh the inactivity horizon after an accepted change.
    pub fn with_activity(&self, now: UnixMillis) -> Self {
        let mut next = self.clone();
        next.meta.expires_at = next.meta.expires_at.max(now + ROOM_TTL_MS);
        next
    }

    /// Apply a metadata update, bumping the revision counter.
    pub fn with_settings(
        &self,
        name: Option<String>,
        settings: RoomSettings,
    ) -> Self {
        let mut next = self.clone();
        if let Some(name) = name {
            next.meta.name = name;
        }
        next.meta.settings = settings;
        next.meta.revision += 1;
        next
    }
}
