//! Turn-completion tracking.
//!
//! A round completes when every currently active participant has logged one
//! qualifying activity since the last counter change. Bowl activities never
//! qualify. Only activities timestamped after the last counter change are
//! considered, which keeps a device joining mid-session from re-counting
//! turns that predate the last decrement.

use std::collections::HashSet;

use sesh_room_protocol::ActivityType;

/// Result of feeding one turn into the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Bowl, unbounded mode, or a pre-decrement timestamp.
    Ignored,
    /// Counted toward the current round without completing it.
    Recorded,
    RoundCompleted {
        rounds_remaining: u32,
        /// True when the final round finished and tracking reverted to
        /// unbounded mode.
        target_cleared: bool,
    },
}

/// Memo of the most recent completion, kept so one undo can reverse it.
#[derive(Debug, Clone)]
struct CompletionMemo {
    trigger_participant: String,
    trigger_timestamp_ms: i64,
    prev_change_ms: i64,
    prev_remaining: u32,
    prev_target: u32,
    prev_completed: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct RoundTracker {
    rounds_target: u32,
    rounds_remaining: u32,
    completed_this_round: HashSet<String>,
    last_counter_change_ms: i64,
    last_completion: Option<CompletionMemo>,
}

impl RoundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `n == 0` means unbounded (rounds untracked). `n > 0` sets both target
    /// and remaining and clears in-progress turn state.
    pub fn set_target(&mut self, n: u32, now_ms: i64) {
        self.rounds_target = n;
        self.rounds_remaining = n;
        self.completed_this_round.clear();
        self.last_counter_change_ms = now_ms;
        self.last_completion = None;
    }

    pub fn target(&self) -> u32 {
        self.rounds_target
    }

    pub fn remaining(&self) -> u32 {
        self.rounds_remaining
    }

    pub fn is_unbounded(&self) -> bool {
        self.rounds_target == 0
    }

    pub fn last_counter_change_ms(&self) -> i64 {
        self.last_counter_change_ms
    }

    pub fn completed_count(&self) -> usize {
        self.completed_this_round.len()
    }

    /// Feeds one qualifying activity. `active_participants` is evaluated at
    /// call time; pausing someone mid-round shrinks the superset check for
    /// the next turn, not retroactively.
    pub fn record_turn(
        &mut self,
        participant_id: &str,
        activity_type: ActivityType,
        timestamp_ms: i64,
        active_participants: &HashSet<String>,
        now_ms: i64,
    ) -> TurnOutcome {
        if activity_type == ActivityType::Bowl || self.is_unbounded() {
            return TurnOutcome::Ignored;
        }
        if timestamp_ms <= self.last_counter_change_ms {
            return TurnOutcome::Ignored;
        }

        self.completed_this_round.insert(participant_id.to_string());

        if active_participants.is_empty()
            || !active_participants
                .iter()
                .all(|id| self.completed_this_round.contains(id))
        {
            return TurnOutcome::Recorded;
        }

        self.last_completion = Some(CompletionMemo {
            trigger_participant: participant_id.to_string(),
            trigger_timestamp_ms: timestamp_ms,
            prev_change_ms: self.last_counter_change_ms,
            prev_remaining: self.rounds_remaining,
            prev_target: self.rounds_target,
            prev_completed: self.completed_this_round.clone(),
        });

        self.rounds_remaining = self.rounds_remaining.saturating_sub(1);
        self.completed_this_round.clear();
        // Never behind the trigger's own stamp, or a rebuild would re-count
        // the just-completed round.
        self.last_counter_change_ms = now_ms.max(timestamp_ms);

        let target_cleared = self.rounds_remaining == 0;
        if target_cleared {
            // Final round done: stop tracking until a new target is set.
            self.rounds_target = 0;
        }

        TurnOutcome::RoundCompleted {
            rounds_remaining: self.rounds_remaining,
            target_cleared,
        }
    }

    /// Removes a participant from the in-progress set (undo of a turn that
    /// did not complete a round).
    pub fn undo_turn(&mut self, participant_id: &str) -> bool {
        self.completed_this_round.remove(participant_id)
    }

    /// Reverses the last completion if the given activity triggered it.
    /// Restores the counter, target, change time, and the pre-completion
    /// turn set minus the undone participant.
    pub fn undo_completion(&mut self, participant_id: &str, timestamp_ms: i64) -> bool {
        let matches = self
            .last_completion
            .as_ref()
            .map(|memo| {
                memo.trigger_participant == participant_id
                    && memo.trigger_timestamp_ms == timestamp_ms
            })
            .unwrap_or(false);
        if !matches {
            return false;
        }

        let memo = self.last_completion.take().expect("memo checked above");
        self.rounds_remaining = memo.prev_remaining;
        self.rounds_target = memo.prev_target;
        self.last_counter_change_ms = memo.prev_change_ms;
        self.completed_this_round = memo.prev_completed;
        self.completed_this_round.remove(participant_id);
        true
    }

    /// Clears in-progress turn state without touching the counter. The
    /// caller replays qualifying ledger records afterwards.
    pub fn reset_progress(&mut self) {
        self.completed_this_round.clear();
    }

    pub fn reset(&mut self) {
        *self = RoundTracker::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bowl_never_counts() {
        let mut tracker = RoundTracker::new();
        tracker.set_target(2, 0);
        let outcome = tracker.record_turn("alice", ActivityType::Bowl, 1_000, &active(&["alice"]), 1_000);
        assert_eq!(outcome, TurnOutcome::Ignored);
        assert_eq!(tracker.completed_count(), 0);
    }

    #[test]
    fn unbounded_mode_ignores_turns() {
        let mut tracker = RoundTracker::new();
        let outcome =
            tracker.record_turn("alice", ActivityType::Cone, 1_000, &active(&["alice"]), 1_000);
        assert_eq!(outcome, TurnOutcome::Ignored);
    }

    #[test]
    fn round_completes_when_all_active_logged() {
        let mut tracker = RoundTracker::new();
        tracker.set_target(2, 0);
        let group = active(&["alice", "bob", "carol"]);

        assert_eq!(
            tracker.record_turn("alice", ActivityType::Cone, 1_000, &group, 1_000),
            TurnOutcome::Recorded
        );
        assert_eq!(
            tracker.record_turn("bob", ActivityType::Joint, 2_000, &group, 2_000),
            TurnOutcome::Recorded
        );
        assert_eq!(
            tracker.record_turn("carol", ActivityType::Cone, 3_000, &group, 3_000),
            TurnOutcome::RoundCompleted {
                rounds_remaining: 1,
                target_cleared: false
            }
        );
        assert_eq!(tracker.completed_count(), 0);
        assert_eq!(tracker.last_counter_change_ms(), 3_000);
    }

    #[test]
    fn repeat_turn_does_not_decrement_early() {
        let mut tracker = RoundTracker::new();
        tracker.set_target(2, 0);
        let group = active(&["alice", "bob", "carol"]);

        tracker.record_turn("alice", ActivityType::Cone, 1_000, &group, 1_000);
        tracker.record_turn("bob", ActivityType::Cone, 2_000, &group, 2_000);
        // Alice again: still only two distinct participants.
        let outcome = tracker.record_turn("alice", ActivityType::Cone, 2_500, &group, 2_500);
        assert_eq!(outcome, TurnOutcome::Recorded);
        assert_eq!(tracker.remaining(), 2);
    }

    #[test]
    fn final_round_clears_target() {
        let mut tracker = RoundTracker::new();
        tracker.set_target(1, 0);
        let group = active(&["alice", "bob"]);

        tracker.record_turn("alice", ActivityType::Joint, 1_000, &group, 1_000);
        let outcome = tracker.record_turn("bob", ActivityType::Joint, 2_000, &group, 2_000);
        assert_eq!(
            outcome,
            TurnOutcome::RoundCompleted {
                rounds_remaining: 0,
                target_cleared: true
            }
        );
        assert!(tracker.is_unbounded());

        // Tracking stops until a new target is set.
        let after = tracker.record_turn("alice", ActivityType::Cone, 3_000, &group, 3_000);
        assert_eq!(after, TurnOutcome::Ignored);
    }

    #[test]
    fn pre_decrement_timestamps_are_ignored() {
        let mut tracker = RoundTracker::new();
        tracker.set_target(2, 5_000);
        let group = active(&["alice", "bob"]);

        // A device joining mid-session replays an activity from before the
        // last counter change.
        let outcome = tracker.record_turn("alice", ActivityType::Cone, 4_000, &group, 6_000);
        assert_eq!(outcome, TurnOutcome::Ignored);
    }

    #[test]
    fn paused_participant_shrinks_superset() {
        let mut tracker = RoundTracker::new();
        tracker.set_target(3, 0);

        tracker.record_turn("alice", ActivityType::Cone, 1_000, &active(&["alice", "bob"]), 1_000);
        // Bob pauses; the active set at the next turn is just alice + carol.
        let outcome = tracker.record_turn(
            "carol",
            ActivityType::Cone,
            2_000,
            &active(&["alice", "carol"]),
            2_000,
        );
        assert_eq!(
            outcome,
            TurnOutcome::RoundCompleted {
                rounds_remaining: 2,
                target_cleared: false
            }
        );
    }

    #[test]
    fn undo_turn_removes_participant() {
        let mut tracker = RoundTracker::new();
        tracker.set_target(2, 0);
        tracker.record_turn("alice", ActivityType::Cone, 1_000, &active(&["alice", "bob"]), 1_000);

        assert!(tracker.undo_turn("alice"));
        assert_eq!(tracker.completed_count(), 0);
        assert!(!tracker.undo_turn("alice"));
    }

    #[test]
    fn undo_completion_restores_counter_and_progress() {
        let mut tracker = RoundTracker::new();
        tracker.set_target(2, 0);
        let group = active(&["alice", "bob"]);

        tracker.record_turn("alice", ActivityType::Cone, 1_000, &group, 1_000);
        tracker.record_turn("bob", ActivityType::Cone, 2_000, &group, 2_000);
        assert_eq!(tracker.remaining(), 1);

        assert!(tracker.undo_completion("bob", 2_000));
        assert_eq!(tracker.remaining(), 2);
        assert_eq!(tracker.target(), 2);
        assert_eq!(tracker.last_counter_change_ms(), 0);
        // Alice's turn survives; only the undone trigger is gone.
        assert_eq!(tracker.completed_count(), 1);
    }

    #[test]
    fn undo_completion_rejects_non_trigger() {
        let mut tracker = RoundTracker::new();
        tracker.set_target(2, 0);
        let group = active(&["alice"]);
        tracker.record_turn("alice", ActivityType::Cone, 1_000, &group, 1_000);

        assert!(!tracker.undo_completion("alice", 999));
        assert_eq!(tracker.remaining(), 1);
    }
}
