//! Outbound notifications to the presentation layer.
//!
//! Pure fire-and-forget callbacks; the engine never awaits a response.
//! Direct method calls replace any broadcast-style fan-out; observers are
//! wired at construction time.

use serde::Serialize;
use std::collections::HashMap;

use sesh_room_protocol::ActivityType;

/// Timer values recomputed on every tick from the live rewind offset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimerSnapshot {
    pub session_elapsed_ms: i64,
    /// Effective time since the newest activity of each type, where one exists.
    pub since_last_ms: HashMap<ActivityType, i64>,
    /// Countdown to the next predicted fire for each enabled type.
    pub gap_countdown_ms: HashMap<ActivityType, i64>,
}

/// Aggregate stats pushed after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub cones: u32,
    pub joints: u32,
    pub bowls: u32,
    pub total_bowl_quantity: u32,
    pub rounds_target: u32,
    pub rounds_remaining: u32,
    /// Pending offline deliveries; the passive sync indicator.
    pub queue_depth: usize,
}

pub trait SessionObserver: Send {
    fn on_timers_changed(&self, _timers: &TimerSnapshot) {}
    fn on_stats_changed(&self, _stats: &StatsSnapshot) {}
    fn on_user_notice(&self, _message: &str) {}
}

/// Observer that drops every notification.
#[derive(Debug, Default)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}
