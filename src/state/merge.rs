//! Deterministic merge rules for room state.
//!
//! Both the relay and every client funnel remote input through this module,
//! so all replicas converge to the same result regardless of delivery order.
//! The rules are commutative, associative, and idempotent, which is what
//! permits relay rebroadcast without a strict delivery order and lets a
//! client re-request full state at any time without corrupting optimistic
//! local edits.

use uuid::Uuid;

use crate::state::room::{
    Location, Participant, ParticipantStatus, RoomFull, RoomMeta, RoomState, Waypoint,
};

/// One replicable change, produced locally and applied everywhere.
///
/// This is the operation-log shape of the wire protocol; `request_state` and
/// `full_state` are transport concerns and have no change counterpart.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomChange {
    /// A participant joined, or re-announced its own record.
    Join {
        /// The full participant record.
        participant: Participant,
    },
    /// A participant left explicitly (or the relay timed it out).
    Leave {
        /// Who left.
        participant_id: Uuid,
    },
    /// A location observation, or `None` to stop sharing.
    Location {
        /// Whose location.
        participant_id: Uuid,
        /// The observation; `None` withdraws the published location.
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
    /// A waypoint was removed; removal wins against a racing add.
    WaypointRemove {
        /// Which waypoint.
        waypoint_id: Uuid,
    },
}

/// Apply one incoming change to a state, returning the next snapshot.
///
/// Applying the same change twice is a no-op. The only rejection is a join
/// that would exceed the participant cap, which is refused rather than
/// merged.
pub fn apply_change(state: &RoomState, change: &RoomChange) -> Result<RoomState, RoomFull> {
    match change {
        RoomChange::Join { participant } => match state.participant(participant.id) {
            Some(existing) => {
                let resolved = resolve_participant(existing, participant);
                if resolved == *existing {
                    return Ok(state.clone());
                }
                let mut next = state.clone();
                next.participants.insert(resolved.id, resolved);
                Ok(next)
            }
            None => state.set_participant(participant.clone()),
        },
        RoomChange::Leave { participant_id } => Ok(state.remove_participant(*participant_id)),
        RoomChange::Location {
            participant_id,
            location,
        } => {
            let Some(existing) = state.participant(*participant_id) else {
                // Location for an unknown participant: nothing to attach it to.
                return Ok(state.clone());
            };
            match location {
                Some(incoming) => {
                    let newer = existing
                        .location
                        .as_ref()
                        .is_none_or(|current| incoming.timestamp > current.timestamp);
                    if newer {
                        Ok(state.set_location(*participant_id, incoming.clone()))
                    } else {
                        Ok(state.clone())
                    }
                }
                None => Ok(state.clear_location(*participant_id, 0)),
            }
        }
        RoomChange::Status {
            participant_id,
            status,
        } => Ok(state.set_status(*participant_id, *status, 0)),
        RoomChange::WaypointAdd { waypoint } => match state.waypoint(waypoint.id) {
            Some(existing) => {
                let resolved = resolve_waypoint(existing, waypoint).clone();
                let mut next = state.clone();
                next.waypoints.insert(resolved.id, resolved);
                Ok(next)
            }
            None => Ok(state.add_waypoint(waypoint.clone())),
        },
        RoomChange::WaypointRemove { waypoint_id } => Ok(state.remove_waypoint(*waypoint_id)),
    }
}

/// Merge two full states into their least upper bound.
pub fn merge(a: &RoomState, b: &RoomState) -> RoomState {
    let (meta_winner, meta_loser) = resolve_meta(&a.meta, &b.meta);
    let mut meta = meta_winner.clone();
    meta.expires_at = a.meta.expires_at.max(b.meta.expires_at);
    meta.creator = meta.creator.or(meta_loser.creator);

    let mut participants = a.participants.clone();
    for (id, theirs) in &b.participants {
        participants
            .entry(*id)
            .and_modify(|ours| *ours = resolve_participant(ours, theirs))
            .or_insert_with(|| theirs.clone());
    }

    let mut removed_waypoints = a.removed_waypoints.clone();
    removed_waypoints.extend(b.removed_waypoints.iter().copied());

    let mut waypoints = a.waypoints.clone();
    for (id, theirs) in &b.waypoints {
        waypoints
            .entry(*id)
            .and_modify(|ours| *ours = resolve_waypoint(ours, theirs).clone())
            .or_insert_with(|| theirs.clone());
    }
    // Removal is applied after the union: remove wins ties with add.
    waypoints.retain(|id, _| !removed_waypoints.contains(id));

    RoomState {
        meta,
        participants,
        waypoints,
        removed_waypoints,
    }
}

/// Merge a freshly-received full-state snapshot into the local state.
///
/// Two asymmetries on top of the plain merge. The relay is the metadata
/// authority at equal revision: a cold-started client seeds placeholder
/// metadata for the slug, and every client must converge on the relay's room
/// identity rather than each keeping its own. And the relay's answer can be
/// momentarily stale relative to the requester's own most recent local
/// change, so the requester's own record is re-inserted if the merge ever
/// lost it: a client never merges itself out.
pub fn reconcile_full_state(local: &RoomState, remote: &RoomState, self_id: Uuid) -> RoomState {
    let mut merged = merge(local, remote);
    if remote.meta.revision >= local.meta.revision {
        let expires_at = merged.meta.expires_at.max(remote.meta.expires_at);
        merged.meta = remote.meta.clone();
        merged.meta.expires_at = expires_at;
    }
    if merged.participant(self_id).is_none() {
        if let Some(own) = local.participant(self_id) {
            merged.participants.insert(self_id, own.clone());
        }
    }
    merged
}

/// Resolve two copies of the same participant record.
///
/// Whole-record last-writer-wins by `last_seen` (all fields share the
/// owner's stamp), with a canonical-serialization tiebreak so the rule is
/// total and replicas agree on equal stamps. The location field is then
/// re-resolved by its own observation timestamp so an out-of-order but older
/// observation never overwrites a newer one.
fn resolve_participant(a: &Participant, b: &Participant) -> Participant {
    let (winner, loser) = order_by(a, b, a.last_seen, b.last_seen);
    let mut merged = winner.clone();
    merged.location = match (&winner.location, &loser.location) {
        (Some(wl), Some(ll)) => {
            if ll.timestamp > wl.timestamp {
                Some(ll.clone())
            } else {
                Some(wl.clone())
            }
        }
        (Some(wl), None) => Some(wl.clone()),
        (None, Some(ll)) => {
            if ll.timestamp > winner.last_seen {
                Some(ll.clone())
            } else {
                None
            }
        }
        (None, None) => None,
    };
    merged
}

/// Resolve two copies of the same waypoint id (duplicate random ids are
/// tolerated, not assumed impossible).
fn resolve_waypoint<'a>(a: &'a Waypoint, b: &'a Waypoint) -> &'a Waypoint {
    order_by(a, b, a.created_at, b.created_at).0
}

/// Room metadata is last-writer-wins by its revision counter.
fn resolve_meta<'a>(a: &'a RoomMeta, b: &'a RoomMeta) -> (&'a RoomMeta, &'a RoomMeta) {
    order_by(a, b, a.revision, b.revision)
}

/// Total order over two values: greater key wins, canonical JSON breaks ties.
fn order_by<'a, T, K>(a: &'a T, b: &'a T, ka: K, kb: K) -> (&'a T, &'a T)
where
    T: serde::Serialize,
    K: Ord,
{
    match ka.cmp(&kb) {
        std::cmp::Ordering::Greater => (a, b),
        std::cmp::Ordering::Less => (b, a),
        std::cmp::Ordering::Equal => {
            let ja = serde_json::to_string(a).unwrap_or_default();
            let jb = serde_json::to_string(b).unwrap_or_default();
            if ja >= jb { (a, b) } else { (b, a) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::room::{
        GeoPoint, Location, LocationSource, MarkerColor, Participant, RoomSettings, RoomState,
        UnixMillis, Waypoint, WaypointKind,
    };

    fn pid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn participant(n: u128, now: UnixMillis) -> Participant {
        Participant::new(pid(n), format!("p{n}"), MarkerColor::default(), now)
    }

    fn location(lat: f64, lon: f64, acc: f64, ts: UnixMillis) -> Location {
        Location {
            latitude: lat,
            longitude: lon,
            accuracy_m: acc,
            altitude_m: None,
            heading_deg: None,
            speed_mps: None,
            timestamp: ts,
            source: LocationSource::Gps,
            indoor: None,
        }
    }

    fn waypoint(n: u128, creator: Uuid, ts: UnixMillis) -> Waypoint {
        Waypoint {
            id: pid(n),
            name: "Food court".into(),
            glyph: None,
            position: GeoPoint {
                latitude: 53.55,
                longitude: 9.99,
                indoor: None,
            },
            creator,
            created_at: ts,
            kind: WaypointKind::Meetup,
        }
    }

    fn seeded_room() -> RoomState {
        let room = RoomState::new("38c3-crew", 0, RoomSettings::default());
        let room = room.set_participant(participant(1, 0)).unwrap();
        room.set_participant(participant(2, 1)).unwrap()
    }

    fn apply(state: &RoomState, change: &RoomChange) -> RoomState {
        apply_change(state, change).unwrap()
    }

    #[test]
    fn independent_changes_commute() {
        let base = seeded_room();
        let a = RoomChange::Location {
            participant_id: pid(1),
            location: Some(location(53.5551, 9.9897, 4.0, 2)),
        };
        let b = RoomChange::WaypointAdd {
            waypoint: waypoint(10, pid(2), 3),
        };

        let ab = apply(&apply(&base, &a), &b);
        let ba = apply(&apply(&base, &b), &a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn applying_a_change_twice_is_a_noop() {
        let base = seeded_room();
        let changes = [
            RoomChange::Join {
                participant: participant(3, 4),
            },
            RoomChange::Location {
                participant_id: pid(1),
                location: Some(location(53.5551, 9.9897, 4.0, 2)),
            },
            RoomChange::Status {
                participant_id: pid(2),
                status: ParticipantStatus::Away,
            },
            RoomChange::WaypointAdd {
                waypoint: waypoint(10, pid(2), 3),
            },
            RoomChange::WaypointRemove {
                waypoint_id: pid(10),
            },
            RoomChange::Leave {
                participant_id: pid(2),
            },
        ];

        let mut state = base;
        for change in &changes {
            state = apply(&state, change);
            assert_eq!(state, apply(&state, change));
        }
    }

    #[test]
    fn location_lww_in_either_order() {
        let base = seeded_room();
        let older = RoomChange::Location {
            participant_id: pid(1),
            location: Some(location(53.5550, 9.9898, 5.0, 1)),
        };
        let newer = RoomChange::Location {
            participant_id: pid(1),
            location: Some(location(53.5551, 9.9897, 4.0, 2)),
        };

        for (first, second) in [(&older, &newer), (&newer, &older)] {
            let state = apply(&apply(&base, first), second);
            let got = state.participant(pid(1)).unwrap().location.as_ref().unwrap();
            assert_eq!(got.timestamp, 2);
            assert_eq!(got.latitude, 53.5551);
        }
    }

    #[test]
    fn waypoint_remove_beats_concurrent_add() {
        let base = seeded_room();
        let add = RoomChange::WaypointAdd {
            waypoint: waypoint(10, pid(1), 5),
        };
        let remove = RoomChange::WaypointRemove {
            waypoint_id: pid(10),
        };

        for (first, second) in [(&add, &remove), (&remove, &add)] {
            let state = apply(&apply(&base, first), second);
            assert!(state.waypoint(pid(10)).is_none());
        }
    }

    #[test]
    fn eleventh_join_is_rejected() {
        let mut room = RoomState::new("38c3-crew", 0, RoomSettings::default());
        for n in 1..=10 {
            room = apply(
                &room,
                &RoomChange::Join {
                    participant: participant(n, 0),
                },
            );
        }

        let overflow = RoomChange::Join {
            participant: participant(11, 0),
        };
        assert!(apply_change(&room, &overflow).is_err());
        assert_eq!(room.participant_count(), 10);
        assert!(room.participant(pid(11)).is_none());
    }

    #[test]
    fn full_state_merge_commutes_and_is_idempotent() {
        let base = seeded_room();
        let left = apply(
            &base,
            &RoomChange::Location {
                participant_id: pid(1),
                location: Some(location(53.5551, 9.9897, 4.0, 2)),
            },
        );
        let right = apply(
            &base,
            &RoomChange::WaypointAdd {
                waypoint: waypoint(10, pid(2), 3),
            },
        );

        let lr = merge(&left, &right);
        let rl = merge(&right, &left);
        assert_eq!(lr, rl);
        assert_eq!(lr, merge(&lr, &right));
        assert_eq!(lr, merge(&lr, &lr));
    }

    #[test]
    fn merge_is_associative() {
        let base = seeded_room();
        let a = apply(
            &base,
            &RoomChange::Location {
                participant_id: pid(1),
                location: Some(location(53.5551, 9.9897, 4.0, 2)),
            },
        );
        let b = apply(
            &base,
            &RoomChange::Status {
                participant_id: pid(2),
                status: ParticipantStatus::Away,
            },
        );
        let c = apply(
            &base,
            &RoomChange::WaypointAdd {
                waypoint: waypoint(10, pid(2), 3),
            },
        );

        assert_eq!(merge(&merge(&a, &b), &c), merge(&a, &merge(&b, &c)));
    }

    #[test]
    fn stale_full_state_never_merges_self_out() {
        // Local client (p1) has advanced its own record; the relay's snapshot
        // predates the join entirely.
        let local = seeded_room();
        let remote = RoomState::new("38c3-crew", 0, RoomSettings::default());

        let merged = reconcile_full_state(&local, &remote, pid(1));
        assert!(merged.participant(pid(1)).is_some());
    }

    #[test]
    fn reconnecting_peer_sees_newest_location() {
        // Scenario: p1 joins at t=0 with a t=0 location, p2 joins at t=1
        // with none. p1 moves at t=2 while p2 is disconnected; p2 reconciles
        // against the relay's full state and must see the t=2 value.
        let mut relay = RoomState::new("38c3-crew", 0, RoomSettings::default());
        let mut p1 = participant(1, 0);
        p1.location = Some(location(53.5550, 9.9898, 5.0, 0));
        relay = apply(&relay, &RoomChange::Join { participant: p1 });

        let mut peer = relay.clone();
        peer = apply(
            &peer,
            &RoomChange::Join {
                participant: participant(2, 1),
            },
        );

        relay = apply(
            &relay,
            &RoomChange::Location {
                participant_id: pid(1),
                location: Some(location(53.5551, 9.9897, 4.0, 2)),
            },
        );

        let reconciled = reconcile_full_state(&peer, &relay, pid(2));
        let got = reconciled
            .participant(pid(1))
            .unwrap()
            .location
            .as_ref()
            .unwrap();
        assert_eq!(got.timestamp, 2);
        assert_eq!(got.accuracy_m, 4.0);
    }

    #[test]
    fn late_joiner_sees_waypoint_removal() {
        // Scenario: p1 adds w1 at t=5; a late joiner receives it via full
        // state and then the remove; the final list excludes w1 even though
        // the snapshot still contained it.
        let mut relay = seeded_room();
        relay = apply(
            &relay,
            &RoomChange::WaypointAdd {
                waypoint: waypoint(10, pid(1), 5),
            },
        );

        let mut late = reconcile_full_state(
            &RoomState::new("38c3-crew", 0, RoomSettings::default()),
            &relay,
            pid(3),
        );
        assert!(late.waypoint(pid(10)).is_some());

        late = apply(
            &late,
            &RoomChange::WaypointRemove {
                waypoint_id: pid(10),
            },
        );
        assert!(late.waypoint(pid(10)).is_none());

        // A later full state that still carries the waypoint cannot bring it back.
        let rewound = reconcile_full_state(&late, &relay, pid(3));
        assert!(rewound.waypoint(pid(10)).is_none());
    }

    #[test]
    fn clearing_location_sticks_until_a_newer_observation() {
        let base = apply(
            &seeded_room(),
            &RoomChange::Location {
                participant_id: pid(1),
                location: Some(location(53.5550, 9.9898, 5.0, 5)),
            },
        );

        let cleared = apply(
            &base,
            &RoomChange::Location {
                participant_id: pid(1),
                location: None,
            },
        );
        assert!(cleared.participant(pid(1)).unwrap().location.is_none());

        let resumed = apply(
            &cleared,
            &RoomChange::Location {
                participant_id: pid(1),
                location: Some(location(53.5552, 9.9890, 6.0, 9)),
            },
        );
        assert_eq!(
            resumed
                .participant(pid(1))
                .unwrap()
                .location
                .as_ref()
                .unwrap()
                .timestamp,
            9
        );
    }

    #[test]
    fn cold_started_clients_adopt_the_relay_room_identity() {
        // Two clients that each seeded placeholder metadata for the same slug
        // must both end up with the relay's meta, not their own.
        let relay = seeded_room();
        let client_a = RoomState::new("38c3-crew", 7, RoomSettings::default())
            .set_participant(participant(5, 7))
            .unwrap();
        let client_b = RoomState::new("38c3-crew", 9, RoomSettings::default())
            .set_participant(participant(6, 9))
            .unwrap();

        let a = reconcile_full_state(&client_a, &relay, pid(5));
        let b = reconcile_full_state(&client_b, &relay, pid(6));
        assert_eq!(a.meta.id, relay.meta.id);
        assert_eq!(b.meta.id, relay.meta.id);
    }

    #[test]
    fn metadata_lww_by_revision() {
        let base = seeded_room();
        let renamed = base.with_settings(Some("Crew".into()), RoomSettings::default());
        let stale = base.clone();

        let merged = merge(&stale, &renamed);
        assert_eq!(merged.meta.name, "Crew");
        assert_eq!(merged.meta.revision, 1);
        assert_eq!(merge(&renamed, &stale), merged);
    }

    #[test]
    fn duplicate_participant_records_resolve_deterministically() {
        // Two copies with identical last_seen must resolve the same way from
        // both sides, whatever the field contents.
        let mut a = participant(7, 10);
        a.name = "alpha".into();
        let mut b = participant(7, 10);
        b.name = "omega".into();

        let room_a = seeded_room().set_participant(a.clone()).unwrap();
        let room_b = seeded_room().set_participant(b.clone()).unwrap();

        let ab = merge(&room_a, &room_b);
        let ba = merge(&room_b, &room_a);
        assert_eq!(ab, ba);
    }
}
