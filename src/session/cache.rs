//! Warm-start snapshot cache: one JSON file per room slug.
//!
//! The cache is never the source of truth; it only lets a reloaded client
//! render the last merged state immediately while the transport session
//! re-establishes itself. Every failure here is absorbed: the session simply
//! cold-starts from an empty state.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::warn;

use crate::state::room::RoomState;

#[derive(Debug, Clone)]
/// File-backed store of last-merged snapshots, keyed by room slug.
pub struct SnapshotCache {
    dir: PathBuf,
}

impl SnapshotCache {
    /// Cache rooted at `dir`; the directory is created lazily on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Read the cached snapshot for `slug`, if a usable one exists.
    pub fn load(&self, slug: &str) -> Option<RoomState> {
        let path = self.path_for(slug);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "snapshot cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "discarding corrupt cached snapshot");
                None
            }
        }
    }

    /// Persist the latest merged snapshot for `slug`, best effort.
    pub fn store(&self, slug: &str, state: &RoomState) {
        let payload = match serde_json::to_string(state) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to serialize snapshot for cache");
                return;
            }
        };
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %err, "snapshot cache unavailable");
            return;
        }
        let path = self.path_for(slug);
        if let Err(err) = fs::write(&path, payload) {
            warn!(path = %path.display(), error = %err, "snapshot cache write failed");
        }
    }

    /// Forget the cached snapshot for `slug`.
    pub fn clear(&self, slug: &str) {
        let _ = fs::remove_file(self.path_for(slug));
    }

    // Slugs are validated to a filesystem-safe charset before they reach us.
    fn path_for(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{slug}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::room::{RoomSettings, RoomState};
    use uuid::Uuid;

    fn temp_cache() -> SnapshotCache {
        SnapshotCache::new(std::env::temp_dir().join(format!("waypost-cache-{}", Uuid::new_v4())))
    }

    #[test]
    fn store_then_load_roundtrips() {
        let cache = temp_cache();
        let state = RoomState::new("38c3-crew", 42, RoomSettings::default());

        cache.store("38c3-crew", &state);
        let loaded = cache.load("38c3-crew").expect("snapshot present");
        assert_eq!(loaded, state);

        cache.clear("38c3-crew");
        assert!(cache.load("38c3-crew").is_none());
    }

    #[test]
    fn missing_entry_is_none() {
        let cache = temp_cache();
        assert!(cache.load("nobody-here").is_none());
    }

    #[test]
    fn corrupt_payload_is_absorbed() {
        let cache = temp_cache();
        fs::create_dir_all(&cache.dir).unwrap();
        fs::write(cache.path_for("38c3-crew"), "not json {").unwrap();
        assert!(cache.load("38c3-crew").is_none());
    }
}
