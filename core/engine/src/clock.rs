//! Wall-clock access and the session rewind offset.
//!
//! Every "elapsed since X" computation in the engine goes through
//! [`RewindClock::effective_now_ms`] so that changing the offset retroactively
//! re-derives all dependent timers. Nothing caches a rewound "now".

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of epoch-millisecond wall time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for tests and deterministic replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        ManualClock {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Wall clock plus a monotonically growing rewind offset.
///
/// The offset only ever increases while a session runs; ending a session
/// resets it to zero. There is no un-rewind.
pub struct RewindClock {
    clock: Arc<dyn Clock>,
    offset_ms: i64,
}

impl RewindClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        RewindClock {
            clock,
            offset_ms: 0,
        }
    }

    /// Raw wall time, used for record timestamps.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Rewound "now", used for every duration computation.
    pub fn effective_now_ms(&self) -> i64 {
        self.clock.now_ms() - self.offset_ms
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Grows the offset. Callers validate that the resulting effective
    /// elapsed time stays non-negative before invoking this.
    pub fn rewind(&mut self, delta_ms: i64) {
        debug_assert!(delta_ms >= 0);
        self.offset_ms += delta_ms;
    }

    pub fn reset(&mut self) {
        self.offset_ms = 0;
    }
}
