pub mod merge;
pub mod privacy;
pub mod room;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::services::room_actor::{self, RoomCommand};

/// Shared handle to the relay-wide state.
pub type SharedState = Arc<AppState>;

#[derive(Clone)]
/// Handle used to push commands into one room's actor.
pub struct RoomHandle {
    /// The slug the room was opened under.
    pub slug: String,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// Push a command onto the room's queue; `false` if the actor stopped.
    pub fn send(&self, command: RoomCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Whether the room actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Central relay state: the room registry and connection counters.
pub struct AppState {
    config: AppConfig,
    rooms: DashMap<String, RoomHandle>,
    sessions: AtomicUsize,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(config: AppConfig) -> SharedState {
        Arc::new(Self {
            config,
            rooms: DashMap::new(),
            sessions: AtomicUsize::new(0),
        })
    }

    /// Immutable runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Look up a live room by slug without creating it.
    pub fn room(&self, slug: &str) -> Option<RoomHandle> {
        self.rooms
            .get(slug)
            .filter(|handle| !handle.is_closed())
            .map(|handle| handle.clone())
    }

    /// Look up a room by slug, opening it if absent (or if its actor has
    /// already expired).
    pub fn room_or_open(&self, slug: &str) -> RoomHandle {
        let mut entry = self
            .rooms
            .entry(slug.to_string())
            .or_insert_with(|| self.open_room(slug));
        if entry.is_closed() {
            *entry = self.open_room(slug);
        }
        entry.clone()
    }

    /// Number of rooms with a live actor.
    pub fn room_count(&self) -> usize {
        self.rooms
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    /// Drop registry entries whose actor has stopped, returning how many.
    pub fn sweep_closed_rooms(&self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|_, handle| !handle.is_closed());
        before - self.rooms.len()
    }

    /// Record a newly-upgraded WebSocket session.
    pub fn session_opened(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished WebSocket session.
    pub fn session_closed(&self) {
        self.sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of currently-connected WebSocket sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    fn open_room(&self, slug: &str) -> RoomHandle {
        RoomHandle {
            slug: slug.to_string(),
            commands: room_actor::spawn(slug.to_string(), &self.config),
        }
    }
}
