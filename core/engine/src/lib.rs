//! # sesh-engine
//!
//! Session synchronization and reconciliation engine for shared activity
//! logging: a local append-only ledger kept consistent with a remote room
//! document under unreliable connectivity, interval-based auto-add
//! prediction, turn-based round tracking, and a retroactive rewind of the
//! session clock.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Remote calls may block;
//!   clients wrap with their own executor if needed.
//! - **Single writer**: All mutation funnels through [`SessionController`];
//!   [`SessionRuntime`] serializes ticks, drains, and room changes behind
//!   one mutex.
//! - **Local first**: Every logged activity hits the local ledger before any
//!   remote delivery is attempted. Connectivity loss is never a caller-
//!   visible error; failed remote writes fall back to the offline queue.
//! - **Graceful degradation**: Missing or damaged state files load as empty
//!   with a warning, never as a startup failure.

// Public modules
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod marker;
pub mod observer;
pub mod predictor;
pub mod queue;
pub mod reconcile;
pub mod room;
pub mod rounds;
pub mod runtime;
pub mod session;

// Re-export commonly used items at crate root
pub use clock::{Clock, ManualClock, RewindClock, SystemClock};
pub use config::EngineConfig;
pub use controller::SessionController;
pub use error::{EngineError, Result};
pub use ledger::{ActivityLedger, SqliteLedger};
pub use marker::{ActiveSessionMarker, SessionMarkerStore};
pub use observer::{NullObserver, SessionObserver, StatsSnapshot, TimerSnapshot};
pub use predictor::{AutoAddPredictor, PredictorPhase};
pub use queue::{DrainOutcome, OfflineQueue, QueueEntry};
pub use reconcile::{reconcile, ReconcileOutcome};
pub use room::{MemoryRoomStore, RoomChangeCallback, RoomStore};
pub use rounds::{RoundTracker, TurnOutcome};
pub use runtime::SessionRuntime;
pub use session::{SessionState, SessionSummary, TurnMode};

pub use sesh_room_protocol::{
    ActivityKey, ActivityRecord, ActivityType, Participant, RoomSnapshot,
};
