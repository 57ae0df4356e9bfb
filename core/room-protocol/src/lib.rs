//! Shared room document types for the sesh session engine.
//!
//! This crate is shared by the engine and by remote room backends to prevent
//! schema drift. The backend remains the authority on what it stores, but the
//! engine reuses the same types to build valid records and to diff snapshots.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const MAX_SHARE_CODE_LEN: usize = 64;
pub const MAX_PARTICIPANT_NAME_LEN: usize = 64;

/// The three activity kinds a session tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Cone,
    Joint,
    Bowl,
}

impl ActivityType {
    pub const ALL: [ActivityType; 3] = [ActivityType::Cone, ActivityType::Joint, ActivityType::Bowl];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Cone => "cone",
            ActivityType::Joint => "joint",
            ActivityType::Bowl => "bowl",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "cone" => Some(ActivityType::Cone),
            "joint" => Some(ActivityType::Joint),
            "bowl" => Some(ActivityType::Bowl),
            _ => None,
        }
    }
}

/// Identity tuple for cross-ledger matching.
///
/// Two records describe the same activity iff this tuple matches exactly.
/// There is deliberately no tolerance window on the timestamp; devices with
/// skewed clocks produce distinct tuples and the diff treats them as distinct
/// activities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityKey {
    pub participant_id: String,
    pub activity_type: ActivityType,
    pub timestamp_ms: i64,
}

/// One logged activity. Immutable once inserted except for late attribution
/// (`payer_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: String,
    pub participant_id: String,
    pub activity_type: ActivityType,
    pub timestamp_ms: i64,
    pub session_id: i64,
    #[serde(default = "default_bowl_quantity")]
    pub bowl_quantity: u32,
    #[serde(default)]
    pub grams_at_log: f64,
    #[serde(default)]
    pub price_per_gram_at_log: f64,
    #[serde(default)]
    pub payer_id: Option<String>,
}

fn default_bowl_quantity() -> u32 {
    1
}

impl ActivityRecord {
    pub fn key(&self) -> ActivityKey {
        ActivityKey {
            participant_id: self.participant_id.clone(),
            activity_type: self.activity_type,
            timestamp_ms: self.timestamp_ms,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_id", "id is required"));
        }
        if self.participant_id.trim().is_empty() {
            return Err(ErrorInfo::new(
                "invalid_participant",
                "participant_id is required",
            ));
        }
        if self.timestamp_ms <= 0 {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "timestamp_ms must be positive",
            ));
        }
        if self.bowl_quantity < 1 {
            return Err(ErrorInfo::new(
                "invalid_quantity",
                "bowl_quantity must be at least 1",
            ));
        }
        Ok(())
    }
}

/// A member of the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

/// Point-in-time view of the shared room document. The engine never owns
/// this; it only diffs against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub share_code: String,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub paused_participant_ids: HashSet<String>,
    #[serde(default)]
    pub away_participant_ids: HashSet<String>,
    #[serde(default)]
    pub activities: Vec<ActivityRecord>,
    #[serde(default)]
    pub rounds_counter: u32,
    #[serde(default)]
    pub auto_add: HashMap<ActivityType, bool>,
    /// RFC3339 stamp of the last field update, set by the backend.
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl RoomSnapshot {
    pub fn new(share_code: &str) -> Self {
        RoomSnapshot {
            share_code: share_code.to_string(),
            room_name: None,
            participants: Vec::new(),
            paused_participant_ids: HashSet::new(),
            away_participant_ids: HashSet::new(),
            activities: Vec::new(),
            rounds_counter: 0,
            auto_add: HashMap::new(),
            updated_at: None,
        }
    }

    /// Participants currently expected to take turns: everyone not paused
    /// and not away.
    pub fn active_participant_ids(&self) -> HashSet<String> {
        self.participants
            .iter()
            .filter(|p| {
                !self.paused_participant_ids.contains(&p.id)
                    && !self.away_participant_ids.contains(&p.id)
            })
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_share_code(&self.share_code)?;
        for participant in &self.participants {
            if participant.id.trim().is_empty() {
                return Err(ErrorInfo::new(
                    "invalid_participant",
                    "participant id is required",
                ));
            }
            if participant.name.len() > MAX_PARTICIPANT_NAME_LEN {
                return Err(ErrorInfo::new(
                    "invalid_participant",
                    format!(
                        "participant name must be {} characters or fewer",
                        MAX_PARTICIPANT_NAME_LEN
                    ),
                ));
            }
        }
        for activity in &self.activities {
            activity.validate()?;
        }
        if let Some(updated_at) = &self.updated_at {
            if DateTime::parse_from_rfc3339(updated_at).is_err() {
                return Err(ErrorInfo::new(
                    "invalid_timestamp",
                    "updated_at must be RFC3339",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub fn require_share_code(value: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new("invalid_share_code", "share_code is required"));
    }
    if value.len() > MAX_SHARE_CODE_LEN {
        return Err(ErrorInfo::new(
            "invalid_share_code",
            format!("share_code must be {} characters or fewer", MAX_SHARE_CODE_LEN),
        ));
    }
    Ok(())
}
