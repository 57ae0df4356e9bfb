//! Active-session marker persistence for crash recovery.
//!
//! A small versioned JSON file records which session (if any) is active and
//! the last completed session id. Written atomically (temp file + rename) on
//! every lifecycle change so a process restart can resume the session.
//!
//! # Defensive Design
//!
//! Loads handle missing files, empty files, corrupt JSON, and version
//! mismatches by returning the empty marker with a warning; a damaged
//! marker must never block starting a new session.

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

const MARKER_VERSION: u32 = 1;

/// Metadata needed to resume an interrupted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSessionMarker {
    pub session_id: i64,
    pub start_ms: i64,
    #[serde(default)]
    pub share_code: Option<String>,
    #[serde(default)]
    pub room_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkerFile {
    version: u32,
    #[serde(default)]
    active: Option<ActiveSessionMarker>,
    #[serde(default)]
    last_completed_session_id: Option<i64>,
}

impl Default for MarkerFile {
    fn default() -> Self {
        MarkerFile {
            version: MARKER_VERSION,
            active: None,
            last_completed_session_id: None,
        }
    }
}

/// File-backed store for the session marker.
pub struct SessionMarkerStore {
    file_path: PathBuf,
}

impl SessionMarkerStore {
    pub fn new(file_path: PathBuf) -> Self {
        SessionMarkerStore { file_path }
    }

    pub fn load_active(&self) -> Option<ActiveSessionMarker> {
        self.load().active
    }

    pub fn last_completed_session_id(&self) -> Option<i64> {
        self.load().last_completed_session_id
    }

    pub fn save_active(&self, marker: &ActiveSessionMarker) {
        let mut file = self.load();
        file.active = Some(marker.clone());
        self.save(&file);
    }

    /// Clears the active marker and records the session as last completed.
    pub fn clear_active(&self, completed_session_id: i64) {
        let mut file = self.load();
        file.active = None;
        file.last_completed_session_id = Some(completed_session_id);
        self.save(&file);
    }

    fn load(&self) -> MarkerFile {
        let content = match fs::read_to_string(&self.file_path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return MarkerFile::default()
            }
            Err(err) => {
                warn!(error = %err, "Failed to read session marker, using empty marker");
                return MarkerFile::default();
            }
        };

        if content.trim().is_empty() {
            return MarkerFile::default();
        }

        match serde_json::from_str::<MarkerFile>(&content) {
            Ok(file) if file.version == MARKER_VERSION => file,
            Ok(file) => {
                warn!(
                    version = file.version,
                    "Unsupported session marker version, using empty marker"
                );
                MarkerFile::default()
            }
            Err(err) => {
                warn!(error = %err, "Failed to parse session marker, using empty marker");
                MarkerFile::default()
            }
        }
    }

    fn save(&self, file: &MarkerFile) {
        if let Err(err) = write_atomically(&self.file_path, file) {
            warn!(error = %err, path = %self.file_path.display(), "Failed to persist session marker");
        }
    }
}

fn write_atomically(path: &Path, file: &MarkerFile) -> Result<(), String> {
    let content = serde_json::to_string_pretty(file)
        .map_err(|err| format!("Failed to serialize marker: {}", err))?;

    let parent = path
        .parent()
        .ok_or_else(|| "Marker path has no parent directory".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create marker dir: {}", err))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .map_err(|err| format!("Temp file error: {}", err))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|err| format!("Failed to write temp marker file: {}", err))?;
    temp_file
        .flush()
        .map_err(|err| format!("Failed to flush temp marker file: {}", err))?;
    temp_file
        .persist(path)
        .map_err(|err| format!("Failed to commit marker file: {}", err.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_no_marker() {
        let temp = tempdir().expect("temp dir");
        let store = SessionMarkerStore::new(temp.path().join("marker.json"));
        assert!(store.load_active().is_none());
        assert!(store.last_completed_session_id().is_none());
    }

    #[test]
    fn marker_round_trips() {
        let temp = tempdir().expect("temp dir");
        let store = SessionMarkerStore::new(temp.path().join("marker.json"));

        let marker = ActiveSessionMarker {
            session_id: 1_000,
            start_ms: 1_000,
            share_code: Some("room-1".to_string()),
            room_name: Some("Garage".to_string()),
        };
        store.save_active(&marker);

        assert_eq!(store.load_active(), Some(marker));
    }

    #[test]
    fn clear_records_last_completed() {
        let temp = tempdir().expect("temp dir");
        let store = SessionMarkerStore::new(temp.path().join("marker.json"));

        store.save_active(&ActiveSessionMarker {
            session_id: 1_000,
            start_ms: 1_000,
            share_code: None,
            room_name: None,
        });
        store.clear_active(1_000);

        assert!(store.load_active().is_none());
        assert_eq!(store.last_completed_session_id(), Some(1_000));
    }

    #[test]
    fn corrupt_marker_loads_empty() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("marker.json");
        fs::write(&path, "{broken").expect("write corrupt");

        let store = SessionMarkerStore::new(path);
        assert!(store.load_active().is_none());
    }

    #[test]
    fn wrong_version_loads_empty() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("marker.json");
        fs::write(
            &path,
            r#"{"version":99,"active":{"session_id":1,"start_ms":1}}"#,
        )
        .expect("write old version");

        let store = SessionMarkerStore::new(path);
        assert!(store.load_active().is_none());
    }
}
