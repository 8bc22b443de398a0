//! Location obfuscation: the pure transform from an exact observation to the
//! position a participant actually publishes.
//!
//! Clients apply this before a location ever leaves the device; neither the
//! relay nor peers see the exact coordinates of a coarsened participant.

use crate::state::room::{Location, PrecisionLevel, PrivacySettings};

/// Decimal places kept and minimum reported accuracy per precision level.
///
/// One degree of latitude is ~111 km, so 3/2/1 decimal places land at
/// roughly building / neighbourhood / district granularity.
fn grid(level: PrecisionLevel) -> Option<(i32, f64)> {
    match level {
        PrecisionLevel::Exact => None,
        PrecisionLevel::Building => Some((3, 150.0)),
        PrecisionLevel::Area => Some((2, 1_500.0)),
        PrecisionLevel::Approximate => Some((1, 8_000.0)),
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Coarsen an observation to the requested precision level.
///
/// Coordinates snap to a rounding grid and the reported accuracy is raised
/// to at least the grid size, so the output never claims more confidence
/// than it carries. Below `Exact`, movement fields are dropped and below
/// `Building` the indoor detail is dropped too, since both would leak the
/// position the rounding just hid. Idempotent: coarsening twice at the same
/// level yields the same value.
pub fn coarsen(location: &Location, level: PrecisionLevel) -> Location {
    let Some((places, floor_m)) = grid(level) else {
        return location.clone();
    };

    let mut out = location.clone();
    out.latitude = round_to(out.latitude, places);
    out.longitude = round_to(out.longitude, places);
    out.accuracy_m = out.accuracy_m.max(floor_m);
    out.altitude_m = None;
    out.heading_deg = None;
    out.speed_mps = None;
    if level != PrecisionLevel::Building {
        out.indoor = None;
    }
    out
}

/// The position a participant publishes, given its privacy settings.
///
/// Returns `None` when nothing may be published at all (sharing off or
/// ghost mode); otherwise the coarsened observation, with the indoor detail
/// removed unless the participant reveals its floor.
pub fn reported_location(observed: &Location, privacy: &PrivacySettings) -> Option<Location> {
    if !privacy.sharing_enabled || privacy.ghost {
        return None;
    }
    let mut out = coarsen(observed, privacy.precision);
    if !privacy.show_floor {
        out.indoor = None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::room::{IndoorPosition, LocationSource};

    fn observation() -> Location {
        Location {
            latitude: 53.555_043,
            longitude: 9.989_812,
            accuracy_m: 5.0,
            altitude_m: Some(12.0),
            heading_deg: Some(270.0),
            speed_mps: Some(1.4),
            timestamp: 1_000,
            source: LocationSource::Gps,
            indoor: Some(IndoorPosition {
                level: 2,
                x: 14.5,
                y: 3.25,
                space: Some("Hall H".into()),
            }),
        }
    }

    #[test]
    fn exact_passes_through_untouched() {
        let obs = observation();
        assert_eq!(coarsen(&obs, PrecisionLevel::Exact), obs);
    }

    #[test]
    fn building_rounds_and_floors_accuracy() {
        let out = coarsen(&observation(), PrecisionLevel::Building);
        assert_eq!(out.latitude, 53.555);
        assert_eq!(out.longitude, 9.990);
        assert_eq!(out.accuracy_m, 150.0);
        assert!(out.altitude_m.is_none());
        assert!(out.heading_deg.is_none());
        assert!(out.speed_mps.is_none());
        // Floor granularity still makes sense at building level.
        assert!(out.indoor.is_some());
    }

    #[test]
    fn area_and_below_drop_indoor_detail() {
        let area = coarsen(&observation(), PrecisionLevel::Area);
        assert_eq!(area.latitude, 53.56);
        assert!(area.indoor.is_none());

        let approx = coarsen(&observation(), PrecisionLevel::Approximate);
        assert_eq!(approx.latitude, 53.6);
        assert_eq!(approx.longitude, 10.0);
        assert_eq!(approx.accuracy_m, 8_000.0);
    }

    #[test]
    fn coarsening_is_idempotent() {
        for level in [
            PrecisionLevel::Exact,
            PrecisionLevel::Building,
            PrecisionLevel::Area,
            PrecisionLevel::Approximate,
        ] {
            let once = coarsen(&observation(), level);
            assert_eq!(coarsen(&once, level), once);
        }
    }

    #[test]
    fn ghost_mode_withholds_entirely() {
        let privacy = PrivacySettings {
            ghost: true,
            ..PrivacySettings::default()
        };
        assert!(reported_location(&observation(), &privacy).is_none());
    }

    #[test]
    fn sharing_disabled_withholds_entirely() {
        let privacy = PrivacySettings {
            sharing_enabled: false,
            ..PrivacySettings::default()
        };
        assert!(reported_location(&observation(), &privacy).is_none());
    }

    #[test]
    fn hidden_floor_strips_indoor_but_keeps_position() {
        let privacy = PrivacySettings {
            show_floor: false,
            ..PrivacySettings::default()
        };
        let out = reported_location(&observation(), &privacy).unwrap();
        assert!(out.indoor.is_none());
        assert_eq!(out.latitude, 53.555_043);
    }
}
