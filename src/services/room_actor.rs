//! Single-writer actor owning one room's authoritative state.
//!
//! Every room runs exactly one of these tasks; all sessions funnel their
//! frames through its command queue, so merges are serialized per room while
//! different rooms proceed fully concurrently. No other execution context
//! ever holds a writable reference to the room state.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dto::validation::validate_display_name,
    dto::ws::{ROOM_FULL_CLOSE_CODE, WireMessage},
    state::merge::{self, RoomChange},
    state::room::{RoomSettings, RoomState, now_ms},
};

/// Commands accepted by a room actor.
pub enum RoomCommand {
    /// Register a session's outbound channel with the room.
    Attach {
        /// Session identity, unique per socket.
        session_id: Uuid,
        /// Writer-task channel for frames addressed to this session.
        outbound: mpsc::UnboundedSender<Message>,
    },
    /// A frame received from a session.
    Frame {
        /// Originating session.
        session_id: Uuid,
        /// The parsed message.
        message: WireMessage,
    },
    /// A session's socket went away; its participant entry is retained until
    /// an explicit leave or the liveness timeout.
    Detach {
        /// Which session.
        session_id: Uuid,
    },
    /// Read the current merged state (HTTP surface and tests).
    Inspect {
        /// Where to send the snapshot.
        reply: oneshot::Sender<RoomState>,
    },
    /// Apply a metadata update, bumping the room revision.
    UpdateSettings {
        /// New display name, if changed.
        name: Option<String>,
        /// Full replacement settings.
        settings: RoomSettings,
        /// Where to send the updated snapshot.
        reply: oneshot::Sender<RoomState>,
    },
}

/// Spawn the actor task for a fresh room and hand back its command queue.
pub fn spawn(slug: String, config: &AppConfig) -> mpsc::UnboundedSender<RoomCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = RoomActor {
        state: RoomState::new(slug, now_ms(), config.room_defaults()),
        sessions: HashMap::new(),
        detached: HashMap::new(),
        liveness_timeout: config.liveness_timeout(),
        commands: rx,
    };
    tokio::spawn(actor.run(config.sweep_interval()));
    tx
}

struct SessionSlot {
    outbound: mpsc::UnboundedSender<Message>,
    /// Participant bound to this socket once its join was accepted.
    participant: Option<Uuid>,
}

struct RoomActor {
    state: RoomState,
    sessions: HashMap<Uuid, SessionSlot>,
    /// Participants with no live session, keyed to when their last one went away.
    detached: HashMap<Uuid, Instant>,
    liveness_timeout: Duration,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
}

impl RoomActor {
    async fn run(mut self, sweep_interval: Duration) {
        let slug = self.state.meta.slug.clone();
        info!(%slug, "room opened");

        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = self.commands.recv() => match maybe {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.sweep();
                    if self.sessions.is_empty() && self.state.is_expired(now_ms()) {
                        info!(%slug, "room expired with no sessions");
                        break;
                    }
                }
            }
        }

        info!(%slug, "room closed");
    }

    fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Attach {
                session_id,
                outbound,
            } => {
                self.sessions.insert(
                    session_id,
                    SessionSlot {
                        outbound,
                        participant: None,
                    },
                );
                debug!(room = %self.state.meta.slug, %session_id, "session attached");
            }
            RoomCommand::Frame {
                session_id,
                message,
            } => self.handle_frame(session_id, message),
            RoomCommand::Detach { session_id } => {
                if let Some(slot) = self.sessions.remove(&session_id) {
                    if let Some(participant_id) = slot.participant {
                        if !self.is_bound(participant_id) {
                            self.detached.insert(participant_id, Instant::now());
                        }
                    }
                }
                debug!(room = %self.state.meta.slug, %session_id, "session detached");
            }
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.state.clone());
            }
            RoomCommand::UpdateSettings {
                name,
                settings,
                reply,
            } => {
                self.state = self
                    .state
                    .with_settings(name, settings)
                    .with_activity(now_ms());
                let _ = reply.send(self.state.clone());
            }
        }
    }

    fn handle_frame(&mut self, session_id: Uuid, message: WireMessage) {
        match message {
            WireMessage::RequestState {} => {
                let answer = WireMessage::FullState {
                    state: self.state.clone(),
                };
                self.send_to(session_id, &answer);
            }
            WireMessage::FullState { .. } => {
                // Only the relay may author snapshots.
                warn!(room = %self.state.meta.slug, %session_id, "dropping full_state from client");
            }
            WireMessage::Unknown => {
                warn!(room = %self.state.meta.slug, %session_id, "dropping unrecognized message");
            }
            message => {
                let Some(change) = message.clone().into_change() else {
                    return;
                };
                self.handle_change(session_id, message, change);
            }
        }
    }

    /// Apply an accepted change to the authoritative state and rebroadcast
    /// the original message (not a snapshot) to every other session.
    fn handle_change(&mut self, session_id: Uuid, message: WireMessage, change: RoomChange) {
        if let RoomChange::Join { participant } = &change {
            if let Err(err) = validate_display_name(&participant.name) {
                warn!(
                    room = %self.state.meta.slug,
                    %session_id,
                    "dropping join with invalid display name: {err}"
                );
                return;
            }
        }

        match merge::apply_change(&self.state, &change) {
            Ok(next) => {
                self.state = next.with_activity(now_ms());
            }
            Err(err) => {
                info!(
                    room = %self.state.meta.slug,
                    %session_id,
                    "refusing join: {err}"
                );
                self.close_session(session_id, ROOM_FULL_CLOSE_CODE, "room full");
                return;
            }
        }

        match &change {
            RoomChange::Join { participant } => {
                let participant_id = participant.id;
                if let Some(slot) = self.sessions.get_mut(&session_id) {
                    slot.participant = Some(participant_id);
                }
                self.detached.remove(&participant_id);
            }
            RoomChange::Leave { participant_id } => {
                self.detached.remove(participant_id);
                for slot in self.sessions.values_mut() {
                    if slot.participant == Some(*participant_id) {
                        slot.participant = None;
                    }
                }
            }
            _ => {}
        }

        self.broadcast_except(Some(session_id), &message);
    }

    /// Synthesize leaves for participants whose liveness timeout elapsed.
    fn sweep(&mut self) {
        let now = Instant::now();
        let bound: HashSet<Uuid> = self
            .sessions
            .values()
            .filter_map(|slot| slot.participant)
            .collect();

        // Start the clock for every unbound participant not yet timed, and
        // forget clocks that no longer apply.
        for id in self.state.participants.keys() {
            if !bound.contains(id) {
                self.detached.entry(*id).or_insert(now);
            }
        }
        self.detached
            .retain(|id, _| !bound.contains(id) && self.state.participants.contains_key(id));

        let timed_out: Vec<Uuid> = self
            .detached
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= self.liveness_timeout)
            .map(|(id, _)| *id)
            .collect();

        for participant_id in timed_out {
            self.detached.remove(&participant_id);
            info!(
                room = %self.state.meta.slug,
                participant = %participant_id,
                "liveness timeout; synthesizing leave"
            );
            let change = RoomChange::Leave { participant_id };
            if let Ok(next) = merge::apply_change(&self.state, &change) {
                self.state = next;
            }
            self.broadcast_except(None, &WireMessage::Leave { participant_id });
        }
    }

    fn is_bound(&self, participant_id: Uuid) -> bool {
        self.sessions
            .values()
            .any(|slot| slot.participant == Some(participant_id))
    }

    /// Serialize a message and push it to one session's writer task.
    fn send_to(&mut self, session_id: Uuid, message: &WireMessage) {
        let Some(slot) = self.sessions.get(&session_id) else {
            return;
        };
        let payload = match message.to_json_string() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to serialize outbound message");
                return;
            }
        };
        if slot.outbound.send(Message::Text(payload.into())).is_err() {
            // Writer gone: the read side will detach shortly.
            self.sessions.remove(&session_id);
        }
    }

    /// Push a message to every attached session except `origin`.
    fn broadcast_except(&mut self, origin: Option<Uuid>, message: &WireMessage) {
        let payload = match message.to_json_string() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to serialize broadcast");
                return;
            }
        };
        let mut dead = Vec::new();
        for (session_id, slot) in &self.sessions {
            if Some(*session_id) == origin {
                continue;
            }
            if slot
                .outbound
                .send(Message::Text(payload.clone().into()))
                .is_err()
            {
                dead.push(*session_id);
            }
        }
        for session_id in dead {
            self.sessions.remove(&session_id);
        }
    }

    fn close_session(&mut self, session_id: Uuid, code: u16, reason: &'static str) {
        if let Some(slot) = self.sessions.get(&session_id) {
            let frame = Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            }));
            let _ = slot.outbound.send(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::room::{MarkerColor, Participant};
    use tokio::time::{sleep, timeout};

    fn test_config() -> AppConfig {
        AppConfig::default()
            .with_room_defaults(RoomSettings {
                max_participants: 2,
                ..RoomSettings::default()
            })
            .with_liveness(Duration::from_secs(30), Duration::from_secs(5))
    }

    fn participant(n: u128) -> Participant {
        Participant::new(
            Uuid::from_u128(n),
            format!("p{n}"),
            MarkerColor::default(),
            0,
        )
    }

    fn attach(
        room: &mpsc::UnboundedSender<RoomCommand>,
        session_id: Uuid,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        room.send(RoomCommand::Attach {
            session_id,
            outbound: tx,
        })
        .unwrap();
        rx
    }

    fn join(room: &mpsc::UnboundedSender<RoomCommand>, session_id: Uuid, n: u128) {
        room.send(RoomCommand::Frame {
            session_id,
            message: WireMessage::Join {
                participant: participant(n),
            },
        })
        .unwrap();
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> WireMessage {
        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        match frame {
            Message::Text(text) => WireMessage::from_json_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn inspect(room: &mpsc::UnboundedSender<RoomCommand>) -> RoomState {
        let (reply, rx) = oneshot::channel();
        room.send(RoomCommand::Inspect { reply }).unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn join_is_broadcast_and_answered_in_full_state() {
        let room = spawn("38c3-crew".into(), &test_config());
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let _rx1 = attach(&room, s1);
        let mut rx2 = attach(&room, s2);

        join(&room, s1, 1);

        let broadcast = next_message(&mut rx2).await;
        assert!(matches!(broadcast, WireMessage::Join { participant } if participant.id == Uuid::from_u128(1)));

        room.send(RoomCommand::Frame {
            session_id: s2,
            message: WireMessage::RequestState {},
        })
        .unwrap();
        let answer = next_message(&mut rx2).await;
        match answer {
            WireMessage::FullState { state } => {
                assert!(state.participant(Uuid::from_u128(1)).is_some());
            }
            other => panic!("expected full_state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_beyond_cap_closes_with_room_full() {
        let room = spawn("tiny".into(), &test_config());
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let s3 = Uuid::new_v4();
        let _rx1 = attach(&room, s1);
        let _rx2 = attach(&room, s2);
        let mut rx3 = attach(&room, s3);

        join(&room, s1, 1);
        join(&room, s2, 2);
        join(&room, s3, 3);

        let frame = timeout(Duration::from_secs(5), rx3.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            Message::Close(Some(frame)) => assert_eq!(frame.code, ROOM_FULL_CLOSE_CODE),
            other => panic!("expected close frame, got {other:?}"),
        }

        let state = inspect(&room).await;
        assert!(state.participant(Uuid::from_u128(3)).is_none());
        assert_eq!(state.participant_count(), 2);
    }

    #[tokio::test]
    async fn malformed_frames_do_not_disconnect() {
        let room = spawn("38c3-crew".into(), &test_config());
        let s1 = Uuid::new_v4();
        let mut rx1 = attach(&room, s1);

        room.send(RoomCommand::Frame {
            session_id: s1,
            message: WireMessage::Unknown,
        })
        .unwrap();

        // The session must still be answered afterwards.
        room.send(RoomCommand::Frame {
            session_id: s1,
            message: WireMessage::RequestState {},
        })
        .unwrap();
        let answer = next_message(&mut rx1).await;
        assert!(matches!(answer, WireMessage::FullState { .. }));
    }

    #[tokio::test]
    async fn detached_participant_is_retained_then_timed_out() {
        let config = AppConfig::default()
            .with_room_defaults(RoomSettings::default())
            .with_liveness(Duration::from_millis(300), Duration::from_millis(50));
        let room = spawn("38c3-crew".into(), &config);
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let _rx1 = attach(&room, s1);
        let mut rx2 = attach(&room, s2);

        join(&room, s1, 1);
        let _ = next_message(&mut rx2).await;

        room.send(RoomCommand::Detach { session_id: s1 }).unwrap();

        // Shortly after the disconnect the participant is still there.
        sleep(Duration::from_millis(100)).await;
        let state = inspect(&room).await;
        assert!(state.participant(Uuid::from_u128(1)).is_some());

        // Past the liveness timeout the relay synthesizes the leave.
        let leave = next_message(&mut rx2).await;
        assert!(
            matches!(leave, WireMessage::Leave { participant_id } if participant_id == Uuid::from_u128(1))
        );
        let state = inspect(&room).await;
        assert!(state.participant(Uuid::from_u128(1)).is_none());
    }

    #[tokio::test]
    async fn settings_update_bumps_revision() {
        let room = spawn("38c3-crew".into(), &test_config());
        let (reply, rx) = oneshot::channel();
        room.send(RoomCommand::UpdateSettings {
            name: Some("Crew".into()),
            settings: RoomSettings::default(),
            reply,
        })
        .unwrap();
        let state = rx.await.unwrap();
        assert_eq!(state.meta.revision, 1);
        assert_eq!(state.meta.name, "Crew");
    }
}
