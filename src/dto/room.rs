use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    dto::format_unix_millis,
    state::room::{PrecisionLevel, RoomSettings, RoomState},
};

/// Public summary of a room, enough for a join screen.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoomSummary {
    /// The slug the room was opened under.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Number of currently-registered participants.
    pub participant_count: usize,
    /// Participant cap.
    pub max_participants: usize,
    /// Whether a further join would be refused.
    pub full: bool,
    /// Precision policy suggested to joining clients.
    pub default_precision: PrecisionLevel,
    /// Whether the indoor overlay is enabled.
    pub indoor_enabled: bool,
}

impl From<&RoomState> for RoomSummary {
    fn from(state: &RoomState) -> Self {
        Self {
            slug: state.meta.slug.clone(),
            name: state.meta.name.clone(),
            created_at: format_unix_millis(state.meta.created_at),
            participant_count: state.participant_count(),
            max_participants: state.meta.settings.max_participants,
            full: state.is_full(),
            default_precision: state.meta.settings.default_precision,
            indoor_enabled: state.meta.settings.indoor_enabled,
        }
    }
}

/// Partial room-settings update; omitted fields keep their current value.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SettingsPatch {
    /// New display name.
    #[validate(length(min = 1, max = 64))]
    pub name: Option<String>,
    /// New participant cap.
    #[validate(range(min = 1, max = 64))]
    pub max_participants: Option<usize>,
    /// New precision policy suggestion.
    pub default_precision: Option<PrecisionLevel>,
    /// Toggle the indoor overlay.
    pub indoor_enabled: Option<bool>,
}

impl SettingsPatch {
    /// Fold this patch over the room's current settings.
    pub fn apply_to(&self, current: &RoomSettings) -> RoomSettings {
        RoomSettings {
            max_participants: self.max_participants.unwrap_or(current.max_participants),
            default_precision: self
                .default_precision
                .unwrap_or(current.default_precision),
            indoor_enabled: self.indoor_enabled.unwrap_or(current.indoor_enabled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[test]
    fn patch_keeps_omitted_fields() {
        let patch = SettingsPatch {
            name: None,
            max_participants: Some(4),
            default_precision: None,
            indoor_enabled: None,
        };
        let folded = patch.apply_to(&RoomSettings::default());
        assert_eq!(folded.max_participants, 4);
        assert_eq!(
            folded.default_precision,
            RoomSettings::default().default_precision
        );
        assert!(folded.indoor_enabled);
    }

    #[test]
    fn patch_bounds_are_enforced() {
        let patch = SettingsPatch {
            name: Some("".into()),
            max_participants: Some(0),
            default_precision: None,
            indoor_enabled: None,
        };
        assert!(patch.validate().is_err());
    }
}
