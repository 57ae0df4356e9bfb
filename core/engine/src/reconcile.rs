//! Two-way diff between the remote room and the local ledger.
//!
//! Runs on every room change notification. Intentionally a full diff rather
//! than an incremental one: session activity volumes are tens to low hundreds
//! of records, and eventual consistency matters more than efficiency here.

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use sesh_room_protocol::{ActivityKey, ActivityRecord, RoomSnapshot};

use crate::error::Result;
use crate::ledger::ActivityLedger;

/// What one reconciliation pass changed locally.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Remote records inserted into the local ledger.
    pub added: Vec<ActivityRecord>,
    /// Local records deleted because the room no longer carries them.
    pub removed: Vec<ActivityRecord>,
    /// Remote records skipped because no local participant matched.
    pub skipped: usize,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Resolves divergence between the room snapshot and the local ledger for
/// the session window (`timestamp_ms >= session_start_ms`).
///
/// Pass order matters: stale local records are removed first (this is how a
/// remote undo propagates to other devices), then missing remote records are
/// inserted. Unknown participants are skipped with a warning, never
/// fabricated. Running twice on the same snapshot is a no-op the second time.
pub fn reconcile(
    snapshot: &RoomSnapshot,
    ledger: &dyn ActivityLedger,
    known_participants: &HashSet<String>,
    session_start_ms: i64,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();

    let remote: HashMap<ActivityKey, &ActivityRecord> = snapshot
        .activities
        .iter()
        .filter(|record| record.timestamp_ms >= session_start_ms)
        .map(|record| (record.key(), record))
        .collect();

    let local = ledger.get_by_time_range(session_start_ms, i64::MAX)?;
    let local_keys: HashSet<ActivityKey> = local.iter().map(|record| record.key()).collect();

    // Remove-stale pass: local records the room no longer carries.
    for record in &local {
        if !remote.contains_key(&record.key()) {
            if ledger.delete(&record.key())? {
                debug!(
                    participant = %record.participant_id,
                    activity_type = record.activity_type.as_str(),
                    timestamp_ms = record.timestamp_ms,
                    "Reconcile: removed stale local activity"
                );
                outcome.removed.push(record.clone());
            }
        }
    }

    // Add-missing pass: remote records the ledger does not have yet.
    for (key, record) in &remote {
        if local_keys.contains(key) {
            continue;
        }
        if !known_participants.contains(&record.participant_id) {
            warn!(
                participant = %record.participant_id,
                share_code = %snapshot.share_code,
                "Reconcile: no local participant matches remote activity, skipping"
            );
            outcome.skipped += 1;
            continue;
        }
        ledger.insert(record)?;
        debug!(
            participant = %record.participant_id,
            activity_type = record.activity_type.as_str(),
            timestamp_ms = record.timestamp_ms,
            "Reconcile: inserted missing remote activity"
        );
        outcome.added.push((*record).clone());
    }

    // Map iteration order is arbitrary; hand insertions back chronologically.
    outcome.added.sort_by_key(|record| record.timestamp_ms);

    Ok(outcome)
}
