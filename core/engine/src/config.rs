//! Engine configuration.
//!
//! Loaded from TOML with safe defaults; a missing or malformed file must
//! never prevent the engine from starting.

use fs_err as fs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::queue::DEFAULT_MAX_RETRIES;

const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 10;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// How often the offline queue is drained while online.
    pub drain_interval_secs: u64,
    /// Timer/predictor tick period.
    pub tick_interval_ms: u64,
    /// Per-entry delivery attempts before a queued write is dropped.
    pub max_retries: u32,
    /// Overrides the default `~/.sesh` data directory.
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            drain_interval_secs: DEFAULT_DRAIN_INTERVAL_SECS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            data_dir: None,
        }
    }
}

impl EngineConfig {
    /// Loads from the given path, or the default location when `None`.
    /// Missing or malformed files fall back to defaults with a warning.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) => path,
                None => return EngineConfig::default(),
            },
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return EngineConfig::default()
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "Failed to read engine config; using defaults");
                return EngineConfig::default();
            }
        };

        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "Failed to parse engine config; using defaults");
                EngineConfig::default()
            }
        }
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(default_data_dir)
    }

    pub fn ledger_path(&self) -> Option<PathBuf> {
        self.data_dir().map(|dir| dir.join("ledger.db"))
    }

    pub fn queue_path(&self) -> Option<PathBuf> {
        self.data_dir().map(|dir| dir.join("offline-queue.json"))
    }

    pub fn marker_path(&self) -> Option<PathBuf> {
        self.data_dir().map(|dir| dir.join("session-marker.json"))
    }
}

fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".sesh"))
}

fn default_config_path() -> Option<PathBuf> {
    default_data_dir().map(|dir| dir.join("engine.toml"))
}
