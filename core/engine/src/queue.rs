//! Durable FIFO of activity records pending remote delivery.
//!
//! The queue is persisted to a JSON file on every mutation so a process
//! restart does not lose pending writes. Delivery failures increment a
//! per-entry retry count; an entry that exhausts its retries is dropped with
//! a log line; the data already exists locally, it just never reaches the
//! room.

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use sesh_room_protocol::{ActivityRecord, ActivityType};

use crate::room::RoomStore;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
const QUEUE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub activity_id: String,
    pub share_code: String,
    pub participant_id: String,
    pub participant_name: String,
    pub activity_type: ActivityType,
    pub timestamp_ms: i64,
    pub session_id: i64,
    #[serde(default = "default_quantity")]
    pub bowl_quantity: u32,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
}

fn default_quantity() -> u32 {
    1
}

impl QueueEntry {
    pub fn from_record(
        share_code: &str,
        participant_name: &str,
        record: &ActivityRecord,
        max_retries: u32,
    ) -> Self {
        QueueEntry {
            activity_id: record.id.clone(),
            share_code: share_code.to_string(),
            participant_id: record.participant_id.clone(),
            participant_name: participant_name.to_string(),
            activity_type: record.activity_type,
            timestamp_ms: record.timestamp_ms,
            session_id: record.session_id,
            bowl_quantity: record.bowl_quantity,
            retry_count: 0,
            max_retries,
        }
    }

    fn to_record(&self) -> ActivityRecord {
        ActivityRecord {
            id: self.activity_id.clone(),
            participant_id: self.participant_id.clone(),
            activity_type: self.activity_type,
            timestamp_ms: self.timestamp_ms,
            session_id: self.session_id,
            bowl_quantity: self.bowl_quantity,
            grams_at_log: 0.0,
            price_per_gram_at_log: 0.0,
            payer_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    entries: Vec<QueueEntry>,
}

impl Default for QueueFile {
    fn default() -> Self {
        QueueFile {
            version: QUEUE_FILE_VERSION,
            entries: Vec::new(),
        }
    }
}

/// Result of one drain cycle.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub delivered: usize,
    pub dropped: usize,
    pub retained: usize,
}

/// FIFO of pending remote writes, optionally backed by a file.
pub struct OfflineQueue {
    entries: VecDeque<QueueEntry>,
    file_path: Option<PathBuf>,
}

impl OfflineQueue {
    pub fn new_in_memory() -> Self {
        OfflineQueue {
            entries: VecDeque::new(),
            file_path: None,
        }
    }

    /// Loads the queue from disk. Missing, empty, corrupt, or wrong-version
    /// files all yield an empty queue rather than an error.
    pub fn load(file_path: PathBuf) -> Self {
        let entries = match fs::read_to_string(&file_path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => match serde_json::from_str::<QueueFile>(&content) {
                Ok(file) if file.version == QUEUE_FILE_VERSION => file.entries,
                Ok(file) => {
                    warn!(
                        version = file.version,
                        "Unsupported offline queue version, starting empty"
                    );
                    Vec::new()
                }
                Err(err) => {
                    warn!(error = %err, "Failed to parse offline queue, starting empty");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!(error = %err, "Failed to read offline queue, starting empty");
                Vec::new()
            }
        };

        OfflineQueue {
            entries: entries.into(),
            file_path: Some(file_path),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Appends an entry and persists the queue immediately.
    pub fn enqueue(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
        self.persist();
    }

    /// Removes every entry belonging to the given activity id (undo support).
    pub fn remove_activity(&mut self, activity_id: &str) {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.activity_id != activity_id);
        if self.entries.len() != before {
            self.persist();
        }
    }

    /// Attempts delivery of every entry present at the start of the cycle,
    /// in FIFO order. Entries enqueued mid-drain wait for the next cycle.
    pub fn drain(&mut self, room: &dyn RoomStore) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        let snapshot_len = self.entries.len();
        if snapshot_len == 0 {
            return outcome;
        }

        let mut survivors: Vec<QueueEntry> = Vec::new();
        for _ in 0..snapshot_len {
            let mut entry = match self.entries.pop_front() {
                Some(entry) => entry,
                None => break,
            };

            match room.append_activity(&entry.share_code, &entry.to_record()) {
                Ok(()) => {
                    outcome.delivered += 1;
                }
                Err(err) => {
                    entry.retry_count += 1;
                    if entry.retry_count >= entry.max_retries {
                        warn!(
                            activity_id = %entry.activity_id,
                            share_code = %entry.share_code,
                            retries = entry.retry_count,
                            error = %err,
                            "Dropping offline queue entry after exhausting retries"
                        );
                        outcome.dropped += 1;
                    } else {
                        survivors.push(entry);
                    }
                }
            }
        }

        outcome.retained = survivors.len();
        for entry in survivors.into_iter().rev() {
            self.entries.push_front(entry);
        }
        self.persist();
        outcome
    }

    fn persist(&self) {
        let file_path = match &self.file_path {
            Some(path) => path,
            None => return,
        };

        let file = QueueFile {
            version: QUEUE_FILE_VERSION,
            entries: self.entries.iter().cloned().collect(),
        };

        if let Err(err) = write_atomically(file_path, &file) {
            warn!(error = %err, path = %file_path.display(), "Failed to persist offline queue");
        }
    }
}

fn write_atomically(path: &Path, file: &QueueFile) -> Result<(), String> {
    let content = serde_json::to_string_pretty(file)
        .map_err(|err| format!("Failed to serialize queue: {}", err))?;

    let parent = path
        .parent()
        .ok_or_else(|| "Queue path has no parent directory".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create queue dir: {}", err))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .map_err(|err| format!("Temp file error: {}", err))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|err| format!("Failed to write temp queue file: {}", err))?;
    temp_file
        .flush()
        .map_err(|err| format!("Failed to flush temp queue file: {}", err))?;
    temp_file
        .persist(path)
        .map_err(|err| format!("Failed to commit queue file: {}", err.error))?;

    Ok(())
}
