//! Error types for engine operations.
//!
//! Remote/sync failures are recovered internally (queue fallback, skip-and-log)
//! and must not reach callers of `log_activity`; ledger storage failures are
//! the only class treated as potentially fatal to the current operation.

/// All errors that can surface from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ─────────────────────────────────────────────────────────────────────
    // Session Lifecycle
    // ─────────────────────────────────────────────────────────────────────
    #[error("no active session")]
    NotActive,

    #[error("a session is already active (id {0})")]
    SessionAlreadyActive(i64),

    // ─────────────────────────────────────────────────────────────────────
    // Auto-Add
    // ─────────────────────────────────────────────────────────────────────
    #[error("not enough history for auto-add: have {have}, need {need}")]
    InsufficientHistory { have: usize, need: usize },

    // ─────────────────────────────────────────────────────────────────────
    // Remote Room
    // ─────────────────────────────────────────────────────────────────────
    #[error("remote room unavailable: {context}")]
    RemoteUnavailable { context: String },

    // ─────────────────────────────────────────────────────────────────────
    // Storage
    // ─────────────────────────────────────────────────────────────────────
    #[error("ledger storage error: {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    pub fn storage(context: impl Into<String>, source: rusqlite::Error) -> Self {
        EngineError::Storage {
            context: context.into(),
            source,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        EngineError::Json {
            context: context.into(),
            source,
        }
    }

    pub fn remote(context: impl Into<String>) -> Self {
        EngineError::RemoteUnavailable {
            context: context.into(),
        }
    }
}

/// Convenience type alias for Results using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;
