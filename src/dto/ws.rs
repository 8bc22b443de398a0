//! Wire protocol: one tagged-union message per WebSocket text frame.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::merge::RoomChange;
use crate::state::room::{Location, Participant, ParticipantStatus, RoomState, Waypoint};

/// WebSocket close code sent when a join would exceed the participant cap.
pub const ROOM_FULL_CLOSE_CODE: u16 = 4409;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, ToSchema)]
/// Messages exchanged between sessions and the relay, in both directions.
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// A participant joined, or re-announced its own record.
    Join {
        /// The full participant record.
        participant: Participant,
    },
    /// A participant left.
    Leave {
        /// Who left.
        participant_id: Uuid,
    },
    /// A location observation; `null` signals "stop sharing", which is
    /// distinct from never having shared (the participant field stays absent).
    Location {
        /// Whose location.
        participant_id: Uuid,
        /// The observation, or `null` to withdraw it.
        #[serde(default)]
        location: Option<Location>,
    },
    /// A presence status update.
    Status {
        /// Whose status.
        participant_id: Uuid,
        /// The new status.
        status: ParticipantStatus,
    },
    /// A waypoint was placed.
    WaypointAdd {
        /// The waypoint.
        waypoint: Waypoint,
    },
    /// A waypoint was removed.
    WaypointRemove {
        /// Which waypoint.
        waypoint_id: Uuid,
    },
    /// Ask the relay for its full authoritative snapshot.
    RequestState {},
    /// The relay's full snapshot, only ever sent in answer to `request_state`.
    FullState {
        /// The authoritative room state.
        state: RoomState,
    },
    /// Anything this build does not recognize; dropped by the receiver.
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    /// Parse a frame, tolerating unknown message types via [`WireMessage::Unknown`].
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serialize for sending as one text frame.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The replicable change this message carries, if it carries one.
    ///
    /// `request_state`/`full_state` are transport concerns and `Unknown` is
    /// noise; none of them map to a change.
    pub fn into_change(self) -> Option<RoomChange> {
        match self {
            WireMessage::Join { participant } => Some(RoomChange::Join { participant }),
            WireMessage::Leave { participant_id } => Some(RoomChange::Leave { participant_id }),
            WireMessage::Location {
                participant_id,
                location,
            } => Some(RoomChange::Location {
                participant_id,
                location,
            }),
            WireMessage::Status {
                participant_id,
                status,
            } => Some(RoomChange::Status {
                participant_id,
                status,
            }),
            WireMessage::WaypointAdd { waypoint } => Some(RoomChange::WaypointAdd { waypoint }),
            WireMessage::WaypointRemove { waypoint_id } => {
                Some(RoomChange::WaypointRemove { waypoint_id })
            }
            WireMessage::RequestState {} | WireMessage::FullState { .. } | WireMessage::Unknown => {
                None
            }
        }
    }
}

impl From<RoomChange> for WireMessage {
    fn from(change: RoomChange) -> Self {
        match change {
            RoomChange::Join { participant } => WireMessage::Join { participant },
            RoomChange::Leave { participant_id } => WireMessage::Leave { participant_id },
            RoomChange::Location {
                participant_id,
                location,
            } => WireMessage::Location {
                participant_id,
                location,
            },
            RoomChange::Status {
                participant_id,
                status,
            } => WireMessage::Status {
                participant_id,
                status,
            },
            RoomChange::WaypointAdd { waypoint } => WireMessage::WaypointAdd { waypoint },
            RoomChange::WaypointRemove { waypoint_id } => WireMessage::WaypointRemove { waypoint_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_snake_case() {
        let msg = WireMessage::RequestState {};
        assert_eq!(msg.to_json_string().unwrap(), r#"{"type":"request_state"}"#);

        let msg = WireMessage::WaypointRemove {
            waypoint_id: Uuid::nil(),
        };
        let raw = msg.to_json_string().unwrap();
        assert!(raw.contains(r#""type":"waypoint_remove""#));
    }

    #[test]
    fn stop_sharing_serializes_as_null() {
        let msg = WireMessage::Location {
            participant_id: Uuid::nil(),
            location: None,
        };
        let raw = msg.to_json_string().unwrap();
        assert!(raw.contains(r#""location":null"#));

        let parsed = WireMessage::from_json_str(&raw).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn absent_location_field_parses_as_none() {
        let raw = format!(
            r#"{{"type":"location","participant_id":"{}"}}"#,
            Uuid::nil()
        );
        let parsed = WireMessage::from_json_str(&raw).unwrap();
        assert_eq!(
            parsed,
            WireMessage::Location {
                participant_id: Uuid::nil(),
                location: None,
            }
        );
    }

    #[test]
    fn unknown_tags_degrade_to_unknown() {
        let parsed = WireMessage::from_json_str(r#"{"type":"telemetry","blob":42}"#).unwrap();
        assert_eq!(parsed, WireMessage::Unknown);
    }

    #[test]
    fn transport_messages_carry_no_change() {
        assert!(WireMessage::RequestState {}.into_change().is_none());
        assert!(WireMessage::Unknown.into_change().is_none());
    }
}
