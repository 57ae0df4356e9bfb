//! Auto-add prediction: per-type interval estimation and countdown state.
//!
//! The predictor may be enabled long after the usual gap has already elapsed
//! (re-opening the app mid-session), so arming distinguishes two phases:
//! Standard counts down the remainder of the learned interval, Overdue counts
//! down only the amount by which the gap is already exceeded, firing sooner
//! instead of waiting a full extra interval.

use std::collections::HashMap;

use sesh_room_protocol::ActivityType;

use crate::error::{EngineError, Result};

/// How many historical activities an enable needs.
const MIN_HISTORY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorPhase {
    Disabled,
    Standard,
    Overdue,
}

#[derive(Debug, Clone)]
struct Armed {
    interval_ms: i64,
    last_activity_ms: i64,
    fire_at_ms: i64,
}

/// Per-activity-type countdown state machine.
///
/// All times are on the effective (rewound) timescale; callers pass the
/// current `effective_now` into every query so a rewind is reflected
/// immediately, without any cached remaining value.
#[derive(Debug, Default)]
pub struct AutoAddPredictor {
    slots: HashMap<ActivityType, Armed>,
}

impl AutoAddPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the predictor for a type from its history, newest timestamp
    /// first. Needs at least two records to learn an interval.
    pub fn enable(
        &mut self,
        activity_type: ActivityType,
        recent_newest_first: &[i64],
        effective_now: i64,
    ) -> Result<PredictorPhase> {
        if recent_newest_first.len() < MIN_HISTORY {
            return Err(EngineError::InsufficientHistory {
                have: recent_newest_first.len(),
                need: MIN_HISTORY,
            });
        }

        let last = recent_newest_first[0];
        let interval = last - recent_newest_first[1];
        let since_last = effective_now - last;

        let (fire_at, phase) = if since_last > interval {
            // Already overdue: count down the overage, not a fresh interval.
            (effective_now + (since_last - interval), PredictorPhase::Overdue)
        } else {
            (last + interval, PredictorPhase::Standard)
        };

        self.slots.insert(
            activity_type,
            Armed {
                interval_ms: interval,
                last_activity_ms: last,
                fire_at_ms: fire_at,
            },
        );

        Ok(phase)
    }

    pub fn disable(&mut self, activity_type: ActivityType) {
        self.slots.remove(&activity_type);
    }

    pub fn disable_all(&mut self) {
        self.slots.clear();
    }

    pub fn is_enabled(&self, activity_type: ActivityType) -> bool {
        self.slots.contains_key(&activity_type)
    }

    /// Derived phase per the state invariant: Overdue iff the effective gap
    /// since the last activity exceeds the learned interval.
    pub fn phase(&self, activity_type: ActivityType, effective_now: i64) -> PredictorPhase {
        match self.slots.get(&activity_type) {
            None => PredictorPhase::Disabled,
            Some(armed) => {
                if effective_now - armed.last_activity_ms > armed.interval_ms {
                    PredictorPhase::Overdue
                } else {
                    PredictorPhase::Standard
                }
            }
        }
    }

    /// Time until the next synthetic fire; negative means due.
    pub fn remaining_ms(&self, activity_type: ActivityType, effective_now: i64) -> Option<i64> {
        self.slots
            .get(&activity_type)
            .map(|armed| armed.fire_at_ms - effective_now)
    }

    pub fn interval_ms(&self, activity_type: ActivityType) -> Option<i64> {
        self.slots.get(&activity_type).map(|armed| armed.interval_ms)
    }

    /// Types whose countdown has elapsed.
    pub fn due(&self, effective_now: i64) -> Vec<ActivityType> {
        ActivityType::ALL
            .into_iter()
            .filter(|ty| {
                self.remaining_ms(*ty, effective_now)
                    .map(|remaining| remaining <= 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Re-arms from the type's current history, newest first, discarding any
    /// in-flight countdown. Called after every change to the type's records
    /// (fresh log, undo, reconciled insert or removal). With two or more
    /// records the interval is relearned; with one the old interval is kept
    /// and only re-anchored; with none prediction is impossible and the slot
    /// disables.
    pub fn rearm_from_history(
        &mut self,
        activity_type: ActivityType,
        recent_newest_first: &[i64],
    ) {
        if !self.slots.contains_key(&activity_type) {
            return;
        }
        if recent_newest_first.is_empty() {
            self.slots.remove(&activity_type);
            return;
        }

        let armed = self.slots.get_mut(&activity_type).expect("checked above");
        if let [last, previous, ..] = recent_newest_first {
            armed.interval_ms = *last - *previous;
            armed.last_activity_ms = *last;
        } else {
            armed.last_activity_ms = recent_newest_first[0];
        }
        armed.fire_at_ms = armed.last_activity_ms + armed.interval_ms;
    }
}
