//! Remote room store contract.
//!
//! Any document store offering atomic field updates and change notification
//! satisfies this; the engine never implements conflict resolution beyond the
//! add/remove reconciliation pass. `MemoryRoomStore` is the reference backend
//! used by tests and local-only rooms.

use std::collections::HashMap;
use std::sync::Mutex;

use sesh_room_protocol::{ActivityKey, ActivityRecord, ActivityType, RoomSnapshot};

use crate::error::{EngineError, Result};

pub type RoomChangeCallback = Box<dyn Fn(RoomSnapshot) + Send>;

/// Contract for the shared room document.
///
/// `RemoteUnavailable` is the expected failure mode for every fallible call;
/// callers recover via the offline queue, never by surfacing the error.
/// Appending a record whose identity tuple already exists in the room must
/// succeed: remote identity is timestamp-based, so a drained queue entry may
/// race a reconciled insert from another device.
pub trait RoomStore: Send + Sync {
    fn append_activity(&self, share_code: &str, record: &ActivityRecord) -> Result<()>;

    fn remove_activity(&self, share_code: &str, key: &ActivityKey) -> Result<()>;

    fn fetch_snapshot(&self, share_code: &str) -> Result<RoomSnapshot>;

    fn update_rounds_counter(&self, share_code: &str, value: u32) -> Result<()>;

    fn update_auto_add_flag(
        &self,
        share_code: &str,
        activity_type: ActivityType,
        enabled: bool,
    ) -> Result<()>;

    /// Registers a change callback. Delivery timing is backend-defined; the
    /// engine serializes handling behind its own lock.
    fn subscribe(&self, share_code: &str, on_change: RoomChangeCallback);
}

/// In-memory room backend with connectivity fault injection.
///
/// Mutations do not auto-notify; call [`MemoryRoomStore::publish`] to deliver
/// the current snapshot to subscribers, the way a real backend pushes a
/// change notification.
pub struct MemoryRoomStore {
    rooms: Mutex<HashMap<String, RoomSnapshot>>,
    subscribers: Mutex<HashMap<String, Vec<RoomChangeCallback>>>,
    online: Mutex<bool>,
}

impl Default for MemoryRoomStore {
    fn default() -> Self {
        MemoryRoomStore {
            rooms: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            online: Mutex::new(true),
        }
    }
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing or regaining connectivity.
    pub fn set_online(&self, online: bool) {
        *self.online.lock().expect("online lock") = online;
    }

    pub fn create_room(&self, snapshot: RoomSnapshot) {
        self.rooms
            .lock()
            .expect("rooms lock")
            .insert(snapshot.share_code.clone(), snapshot);
    }

    /// Direct read for assertions and for simulating another device's edits.
    pub fn room(&self, share_code: &str) -> Option<RoomSnapshot> {
        self.rooms.lock().expect("rooms lock").get(share_code).cloned()
    }

    /// Replaces the room document wholesale, as another device would.
    pub fn replace_room(&self, snapshot: RoomSnapshot) {
        self.create_room(snapshot);
    }

    /// Delivers the current snapshot to every subscriber of the room.
    pub fn publish(&self, share_code: &str) {
        let snapshot = match self.room(share_code) {
            Some(snapshot) => snapshot,
            None => return,
        };
        let subscribers = self.subscribers.lock().expect("subscribers lock");
        if let Some(callbacks) = subscribers.get(share_code) {
            for callback in callbacks {
                callback(snapshot.clone());
            }
        }
    }

    fn check_online(&self) -> Result<()> {
        if *self.online.lock().expect("online lock") {
            Ok(())
        } else {
            Err(EngineError::remote("simulated offline"))
        }
    }

    fn with_room<T>(
        &self,
        share_code: &str,
        op: impl FnOnce(&mut RoomSnapshot) -> T,
    ) -> Result<T> {
        self.check_online()?;
        let mut rooms = self.rooms.lock().expect("rooms lock");
        let room = rooms
            .get_mut(share_code)
            .ok_or_else(|| EngineError::remote(format!("room not found: {}", share_code)))?;
        Ok(op(room))
    }
}

impl RoomStore for MemoryRoomStore {
    fn append_activity(&self, share_code: &str, record: &ActivityRecord) -> Result<()> {
        self.with_room(share_code, |room| {
            let key = record.key();
            if room.activities.iter().any(|existing| existing.key() == key) {
                // Timestamp identity: the record is already there, count it
                // as delivered.
                return;
            }
            room.activities.push(record.clone());
        })
    }

    fn remove_activity(&self, share_code: &str, key: &ActivityKey) -> Result<()> {
        self.with_room(share_code, |room| {
            room.activities.retain(|existing| existing.key() != *key);
        })
    }

    fn fetch_snapshot(&self, share_code: &str) -> Result<RoomSnapshot> {
        self.check_online()?;
        self.room(share_code)
            .ok_or_else(|| EngineError::remote(format!("room not found: {}", share_code)))
    }

    fn update_rounds_counter(&self, share_code: &str, value: u32) -> Result<()> {
        self.with_room(share_code, |room| {
            room.rounds_counter = value;
        })
    }

    fn update_auto_add_flag(
        &self,
        share_code: &str,
        activity_type: ActivityType,
        enabled: bool,
    ) -> Result<()> {
        self.with_room(share_code, |room| {
            room.auto_add.insert(activity_type, enabled);
        })
    }

    fn subscribe(&self, share_code: &str, on_change: RoomChangeCallback) {
        self.subscribers
            .lock()
            .expect("subscribers lock")
            .entry(share_code.to_string())
            .or_default()
            .push(on_change);
    }
}
