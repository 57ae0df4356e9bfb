//! The per-session state aggregate and the end-of-session summary.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use sesh_room_protocol::{ActivityRecord, ActivityType, Participant};

/// Who the next synthetic or suggested log belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    /// Selection advances round-robin over active participants after every
    /// logged activity.
    Auto,
    /// Selection stays put until changed explicitly.
    Sticky,
}

/// Owned aggregate for the single active session. No ambient globals; every
/// component reads this through the controller.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Immutable for the session's lifetime; equals `start_ms`.
    pub session_id: i64,
    pub start_ms: i64,
    pub active: bool,
    pub share_code: Option<String>,
    pub room_name: Option<String>,
    pub turn_mode: TurnMode,
    pub participants: Vec<Participant>,
    pub paused_ids: HashSet<String>,
    pub away_ids: HashSet<String>,
    pub selected_participant_id: Option<String>,
    /// Stash rates snapshotted into each record at log time.
    pub grams_at_log: f64,
    pub price_per_gram_at_log: f64,
}

impl SessionState {
    pub fn new(start_ms: i64) -> Self {
        SessionState {
            session_id: start_ms,
            start_ms,
            active: true,
            share_code: None,
            room_name: None,
            turn_mode: TurnMode::Sticky,
            participants: Vec::new(),
            paused_ids: HashSet::new(),
            away_ids: HashSet::new(),
            selected_participant_id: None,
            grams_at_log: 0.0,
            price_per_gram_at_log: 0.0,
        }
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn is_active_participant(&self, id: &str) -> bool {
        self.participant(id).is_some()
            && !self.paused_ids.contains(id)
            && !self.away_ids.contains(id)
    }

    pub fn active_participant_ids(&self) -> HashSet<String> {
        self.participants
            .iter()
            .filter(|p| !self.paused_ids.contains(&p.id) && !self.away_ids.contains(&p.id))
            .map(|p| p.id.clone())
            .collect()
    }

    /// Next active participant after `id` in roster order, wrapping around.
    /// Returns `None` when nobody is active.
    pub fn next_active_after(&self, id: &str) -> Option<String> {
        let ordered: Vec<&Participant> = self
            .participants
            .iter()
            .filter(|p| !self.paused_ids.contains(&p.id) && !self.away_ids.contains(&p.id))
            .collect();
        if ordered.is_empty() {
            return None;
        }

        let position = ordered.iter().position(|p| p.id == id);
        let next = match position {
            Some(index) => ordered[(index + 1) % ordered.len()],
            None => ordered[0],
        };
        Some(next.id.clone())
    }
}

/// Aggregate counts archived when a session ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: i64,
    pub start_ms: i64,
    pub end_ms: i64,
    /// Rewind-adjusted elapsed time.
    pub elapsed_ms: i64,
    pub cones: u32,
    pub joints: u32,
    pub bowls: u32,
    pub total_bowl_quantity: u32,
    pub per_participant: HashMap<String, u32>,
}

impl SessionSummary {
    pub fn from_records(
        session_id: i64,
        start_ms: i64,
        end_ms: i64,
        elapsed_ms: i64,
        records: &[ActivityRecord],
    ) -> Self {
        let mut summary = SessionSummary {
            session_id,
            start_ms,
            end_ms,
            elapsed_ms,
            cones: 0,
            joints: 0,
            bowls: 0,
            total_bowl_quantity: 0,
            per_participant: HashMap::new(),
        };

        for record in records {
            match record.activity_type {
                ActivityType::Cone => summary.cones += 1,
                ActivityType::Joint => summary.joints += 1,
                ActivityType::Bowl => {
                    summary.bowls += 1;
                    summary.total_bowl_quantity += record.bowl_quantity;
                }
            }
            *summary
                .per_participant
                .entry(record.participant_id.clone())
                .or_insert(0) += 1;
        }

        summary
    }
}
