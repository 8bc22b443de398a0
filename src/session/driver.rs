//! The session driver task: owns the socket, the local state, and the
//! offline queue.
//!
//! State machine: `Disconnected → Connecting → Joined → Disconnected` in a
//! loop, with terminal `Closed` entered only by an explicit leave and
//! terminal `Rejected` entered when the relay refuses the join. On entering
//! `Joined` the driver first emits `request_state`, then its own `join`, and
//! only flushes queued changes once the full-state answer has been merged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SessionConfig, SessionPhase};
use crate::dto::ws::{ROOM_FULL_CLOSE_CODE, WireMessage};
use crate::state::merge::{self, RoomChange};
use crate::state::room::RoomState;

/// Cadence of client-originated pings, keeping NAT bindings and sleepy
/// mobile radios from silently dropping an idle connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Commands from the session handle to its driver.
pub(crate) enum SessionCommand {
    /// Apply locally and deliver to the relay.
    Change(RoomChange),
    /// Tear everything down; acknowledged once the connection is released.
    Leave(oneshot::Sender<()>),
}

/// Why a connected stretch ended.
enum Exit {
    /// Socket dropped or timed out; reconnect after the backoff delay.
    Dropped,
    /// The relay closed us with the room-full code. Terminal.
    Rejected,
    /// Explicit leave. Terminal.
    Leave,
}

/// Outcome of processing one inbound frame.
enum FrameOutcome {
    Continue,
    /// A full-state answer was merged; the handshake is complete.
    Reconciled,
    Exit(Exit),
}

pub(crate) struct Driver {
    config: SessionConfig,
    self_id: Uuid,
    state: RoomState,
    /// Outbound messages produced while no usable connection existed, in
    /// send order.
    pending: VecDeque<WireMessage>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    snapshots: watch::Sender<Arc<RoomState>>,
    connectivity: watch::Sender<bool>,
    phase: watch::Sender<SessionPhase>,
}

impl Driver {
    pub(crate) fn new(
        config: SessionConfig,
        self_id: Uuid,
        initial: RoomState,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        snapshots: watch::Sender<Arc<RoomState>>,
        connectivity: watch::Sender<bool>,
        phase: watch::Sender<SessionPhase>,
    ) -> Self {
        Self {
            config,
            self_id,
            state: initial,
            pending: VecDeque::new(),
            commands,
            snapshots,
            connectivity,
            phase,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.set_phase(SessionPhase::Connecting);
            let url = self.config.room_url();
            let connect = timeout(self.config.handshake_timeout, connect_async(url.as_str()));
            tokio::pin!(connect);
            // Local edits and leave() must not wait out an in-flight attempt.
            let exit = loop {
                tokio::select! {
                    attempt = &mut connect => break match attempt {
                        Ok(Ok((socket, _response))) => self.run_connected(socket).await,
                        Ok(Err(err)) => {
                            warn!(error = %err, "relay connection failed");
                            Exit::Dropped
                        }
                        Err(_) => {
                            warn!("relay connection timed out");
                            Exit::Dropped
                        }
                    },
                    command = self.commands.recv() => match command {
                        Some(SessionCommand::Change(change)) => {
                            self.apply(&change);
                            self.pending.push_back(change.into());
                        }
                        Some(SessionCommand::Leave(ack)) => {
                            let _ = ack.send(());
                            break Exit::Leave;
                        }
                        None => break Exit::Leave,
                    }
                }
            };

            let _ = self.connectivity.send(false);
            match exit {
                Exit::Leave => break,
                Exit::Rejected => {
                    info!(room = %self.config.slug, "join refused: room full");
                    self.set_phase(SessionPhase::Rejected);
                    return;
                }
                Exit::Dropped => {}
            }

            self.set_phase(SessionPhase::Disconnected);
            if self.backoff().await {
                break;
            }
        }
        self.set_phase(SessionPhase::Closed);
    }

    /// Drive one connected stretch: handshake, queue flush, steady state.
    async fn run_connected(&mut self, socket: WsStream) -> Exit {
        let (mut sink, mut stream) = socket.split();

        // Reconcile before anything else: ask for the relay's snapshot, then
        // announce ourselves so peers learn about us.
        if self
            .send_now(&mut sink, &WireMessage::RequestState {})
            .await
            .is_err()
        {
            return Exit::Dropped;
        }
        if let Some(announce) = self.self_announcement() {
            if self.send_now(&mut sink, &announce).await.is_err() {
                return Exit::Dropped;
            }
        }

        // Bounded wait for the full-state answer; other traffic is applied
        // normally in the meantime and local edits keep queueing.
        let deadline = sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(room = %self.config.slug, "request_state answer timed out");
                    return Exit::Dropped;
                }
                frame = stream.next() => match self.handle_frame(frame, &mut sink).await {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Reconciled => break,
                    FrameOutcome::Exit(exit) => return exit,
                },
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Change(change)) => {
                        self.apply(&change);
                        self.pending.push_back(change.into());
                    }
                    Some(SessionCommand::Leave(ack)) => {
                        let _ = ack.send(());
                        return Exit::Leave;
                    }
                    None => return Exit::Leave,
                }
            }
        }

        let _ = self.connectivity.send(true);
        self.set_phase(SessionPhase::Joined);
        info!(room = %self.config.slug, "joined");

        // The handshake is done; resend whatever queued up while offline.
        while let Some(message) = self.pending.pop_front() {
            if self.send_now(&mut sink, &message).await.is_err() {
                self.pending.push_front(message);
                return Exit::Dropped;
            }
        }

        self.run_steady(&mut sink, &mut stream).await
    }

    async fn run_steady(&mut self, sink: &mut WsSink, stream: &mut WsSource) -> Exit {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return Exit::Dropped;
                    }
                }
                frame = stream.next() => match self.handle_frame(frame, sink).await {
                    FrameOutcome::Continue | FrameOutcome::Reconciled => {}
                    FrameOutcome::Exit(exit) => return exit,
                },
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Change(change)) => {
                        self.apply(&change);
                        let message = WireMessage::from(change);
                        if self.send_now(sink, &message).await.is_err() {
                            self.pending.push_back(message);
                            return Exit::Dropped;
                        }
                    }
                    Some(SessionCommand::Leave(ack)) => {
                        let goodbye = WireMessage::Leave {
                            participant_id: self.self_id,
                        };
                        let _ = self.send_now(sink, &goodbye).await;
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = ack.send(());
                        return Exit::Leave;
                    }
                    None => return Exit::Leave,
                }
            }
        }
    }

    /// Sleep out the fixed reconnect delay, still accepting local edits.
    /// Returns `true` when a leave arrived and the driver must stop.
    async fn backoff(&mut self) -> bool {
        debug!(
            room = %self.config.slug,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "reconnecting after delay"
        );
        let deadline = sleep(self.config.reconnect_delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return false,
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Change(change)) => {
                        self.apply(&change);
                        self.pending.push_back(change.into());
                    }
                    Some(SessionCommand::Leave(ack)) => {
                        let _ = ack.send(());
                        return true;
                    }
                    None => return true,
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Option<Result<Message, tungstenite::Error>>,
        sink: &mut WsSink,
    ) -> FrameOutcome {
        match frame {
            Some(Ok(Message::Text(text))) => self.handle_text(&text),
            Some(Ok(Message::Ping(payload))) => {
                if sink.send(Message::Pong(payload)).await.is_err() {
                    return FrameOutcome::Exit(Exit::Dropped);
                }
                FrameOutcome::Continue
            }
            Some(Ok(Message::Close(frame))) => {
                let rejected = frame
                    .as_ref()
                    .is_some_and(|f| u16::from(f.code) == ROOM_FULL_CLOSE_CODE);
                if rejected {
                    FrameOutcome::Exit(Exit::Rejected)
                } else {
                    FrameOutcome::Exit(Exit::Dropped)
                }
            }
            Some(Ok(_)) => FrameOutcome::Continue,
            Some(Err(err)) => {
                warn!(error = %err, "websocket error");
                FrameOutcome::Exit(Exit::Dropped)
            }
            None => FrameOutcome::Exit(Exit::Dropped),
        }
    }

    fn handle_text(&mut self, text: &str) -> FrameOutcome {
        let message = match WireMessage::from_json_str(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping malformed frame");
                return FrameOutcome::Continue;
            }
        };
        match message {
            WireMessage::FullState { state: remote } => {
                self.state = merge::reconcile_full_state(&self.state, &remote, self.self_id);
                self.publish();
                FrameOutcome::Reconciled
            }
            // Only the relay is ever asked for state.
            WireMessage::RequestState {} => FrameOutcome::Continue,
            WireMessage::Unknown => {
                warn!("dropping unrecognized message");
                FrameOutcome::Continue
            }
            message => {
                if let Some(change) = message.into_change() {
                    // A client never merges itself out: a leave for our own
                    // id can only be relay staleness (e.g. a liveness
                    // timeout raced our reconnect) and our next announcement
                    // re-registers us anyway.
                    if let RoomChange::Leave { participant_id } = &change {
                        if *participant_id == self.self_id {
                            return FrameOutcome::Continue;
                        }
                    }
                    self.apply(&change);
                }
                FrameOutcome::Continue
            }
        }
    }

    /// Apply a change to the local snapshot and republish if it moved.
    fn apply(&mut self, change: &RoomChange) {
        match merge::apply_change(&self.state, change) {
            Ok(next) => {
                if next != self.state {
                    self.state = next;
                    self.publish();
                }
            }
            Err(err) => warn!(error = %err, "change refused"),
        }
    }

    /// Persist and publish the current snapshot.
    fn publish(&self) {
        if let Some(cache) = &self.config.cache {
            cache.store(&self.config.slug, &self.state);
        }
        let _ = self.snapshots.send(Arc::new(self.state.clone()));
    }

    fn self_announcement(&self) -> Option<WireMessage> {
        self.state
            .participant(self.self_id)
            .map(|me| WireMessage::Join {
                participant: me.clone(),
            })
    }

    async fn send_now(&self, sink: &mut WsSink, message: &WireMessage) -> Result<(), ()> {
        let payload = match message.to_json_string() {
            Ok(payload) => payload,
            Err(err) => {
                // Permanent error, no point queueing it.
                warn!(error = %err, "failed to serialize outbound message");
                return Ok(());
            }
        };
        sink.send(Message::Text(payload.into())).await.map_err(|err| {
            warn!(error = %err, "websocket send failed");
        })
    }

    fn set_phase(&self, phase: SessionPhase) {
        let _ = self.phase.send(phase);
    }
}
