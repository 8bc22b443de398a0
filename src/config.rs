//! Relay configuration loading, including room defaults and liveness timing.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use rand::seq::IndexedRandom;
use serde::Deserialize;
use tracing::{info, warn};

use crate::state::room::{MarkerColor, PrecisionLevel, RoomSettings};

/// Default location on disk where the relay looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "WAYPOST_CONFIG_PATH";

/// Fixed palette participants draw their marker color from at join time.
/// Pseudo-random pick; collisions between participants are permitted.
pub const MARKER_PALETTE: &[&str] = &[
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
    "#bcf60c", "#fabebe", "#008080", "#e6beff", "#9a6324", "#800000", "#aaffc3", "#808000",
];

/// Pick a marker color from [`MARKER_PALETTE`].
pub fn random_marker_color() -> MarkerColor {
    MARKER_PALETTE
        .choose(&mut rand::rng())
        .map(|hex| MarkerColor((*hex).into()))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the relay.
pub struct AppConfig {
    room: RoomSettings,
    liveness_timeout: Duration,
    sweep_interval: Duration,
    handshake_timeout: Duration,
}

impl AppConfig {
    /// Load the relay configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(path = %path.display(), "loaded relay config");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Settings applied to freshly created rooms.
    pub fn room_defaults(&self) -> RoomSettings {
        self.room.clone()
    }

    /// How long a disconnected participant is retained before the relay
    /// synthesizes its `leave`.
    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Cadence of each room actor's liveness/expiry sweep.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Bounded wait for the first frame of a freshly-upgraded socket.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Replace the room defaults; used when embedding the relay.
    pub fn with_room_defaults(mut self, room: RoomSettings) -> Self {
        self.room = room;
        self
    }

    /// Replace the liveness/sweep timing; used when embedding the relay.
    pub fn with_liveness(mut self, timeout: Duration, sweep_interval: Duration) -> Self {
        self.liveness_timeout = timeout;
        self.sweep_interval = sweep_interval;
        self
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            room: RoomSettings::default(),
            liveness_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    room: Option<RawRoomDefaults>,
    relay: Option<RawRelayTiming>,
}

#[derive(Debug, Deserialize)]
/// Room-defaults section of the configuration file.
struct RawRoomDefaults {
    max_participants: Option<usize>,
    default_precision: Option<PrecisionLevel>,
    indoor_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
/// Relay-timing section of the configuration file.
struct RawRelayTiming {
    liveness_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = Self::default();
        let room_defaults = RoomSettings::default();
        let room = value
            .room
            .map(|raw| RoomSettings {
                max_participants: raw
                    .max_participants
                    .unwrap_or(room_defaults.max_participants),
                default_precision: raw
                    .default_precision
                    .unwrap_or(room_defaults.default_precision),
                indoor_enabled: raw.indoor_enabled.unwrap_or(room_defaults.indoor_enabled),
            })
            .unwrap_or(room_defaults);
        let relay = value.relay;
        let secs = |pick: fn(&RawRelayTiming) -> Option<u64>, fallback: Duration| {
            relay
                .as_ref()
                .and_then(pick)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        Self {
            room,
            liveness_timeout: secs(|r| r.liveness_timeout_secs, defaults.liveness_timeout),
            sweep_interval: secs(|r| r.sweep_interval_secs, defaults.sweep_interval),
            handshake_timeout: secs(|r| r.handshake_timeout_secs, defaults.handshake_timeout),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
