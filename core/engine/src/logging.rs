//! Logging setup for embedding shells.

use std::env;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. Call once from the embedding
/// shell; library code only emits events.
pub fn init_logging() {
    let debug_enabled = env::var("SESH_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
