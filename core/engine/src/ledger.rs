//! Durable local activity store.
//!
//! The ledger is the local source of truth: every logged activity lands here
//! before any remote delivery is attempted. A unique index on the identity
//! tuple `(participant_id, activity_type, timestamp_ms)` guarantees at most
//! one representation per activity, and inserts ignore conflicts so that
//! reconciliation re-inserts are no-ops.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::PathBuf;

use sesh_room_protocol::{ActivityKey, ActivityRecord, ActivityType};

use crate::error::{EngineError, Result};

/// Contract consumed by the controller and the reconciler.
pub trait ActivityLedger: Send {
    /// Inserts a record, returning its id. Inserting a record whose identity
    /// tuple already exists is a no-op that returns the existing record's id.
    fn insert(&self, record: &ActivityRecord) -> Result<String>;

    /// Deletes by identity tuple. Returns whether a row was removed.
    fn delete(&self, key: &ActivityKey) -> Result<bool>;

    fn get_by_id(&self, id: &str) -> Result<Option<ActivityRecord>>;

    /// Records with `start_ms <= timestamp_ms < end_ms`, oldest first.
    fn get_by_time_range(&self, start_ms: i64, end_ms: i64) -> Result<Vec<ActivityRecord>>;

    fn get_by_participant(&self, participant_id: &str) -> Result<Vec<ActivityRecord>>;

    /// Most recently timestamped record for the session, if any.
    fn latest_for_session(&self, session_id: i64) -> Result<Option<ActivityRecord>>;

    /// Up to `limit` records of one type for the session, newest first.
    fn recent_of_type(
        &self,
        session_id: i64,
        activity_type: ActivityType,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>>;
}

/// SQLite-backed ledger. Single effective writer per session window; reads
/// are cheap enough to re-run rather than cache.
pub struct SqliteLedger {
    path: PathBuf,
}

impl SqliteLedger {
    pub fn new(path: PathBuf) -> Result<Self> {
        let ledger = Self { path };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS activities (
                    id TEXT PRIMARY KEY,
                    session_id INTEGER NOT NULL,
                    participant_id TEXT NOT NULL,
                    activity_type TEXT NOT NULL,
                    timestamp_ms INTEGER NOT NULL,
                    bowl_quantity INTEGER NOT NULL DEFAULT 1,
                    grams_at_log REAL NOT NULL DEFAULT 0,
                    price_per_gram_at_log REAL NOT NULL DEFAULT 0,
                    payer_id TEXT
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_activities_identity
                    ON activities (participant_id, activity_type, timestamp_ms);
                 CREATE INDEX IF NOT EXISTS idx_activities_session_time
                    ON activities (session_id, timestamp_ms);
                 COMMIT;",
            )
            .map_err(|err| EngineError::storage("initialize ledger schema", err))?;
            Ok(())
        })
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| EngineError::io("create ledger data dir", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| EngineError::storage("open ledger db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| EngineError::storage("enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| EngineError::storage("set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| EngineError::storage("set busy_timeout", err))?;

        Ok(conn)
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }
}

fn record_from_row(row: &Row) -> rusqlite::Result<ActivityRecord> {
    let type_str: String = row.get(3)?;
    let activity_type = ActivityType::from_str(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown activity type: {}", type_str).into(),
        )
    })?;

    Ok(ActivityRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        participant_id: row.get(2)?,
        activity_type,
        timestamp_ms: row.get(4)?,
        bowl_quantity: row.get::<_, i64>(5)? as u32,
        grams_at_log: row.get(6)?,
        price_per_gram_at_log: row.get(7)?,
        payer_id: row.get(8)?,
    })
}

const RECORD_COLUMNS: &str = "id, session_id, participant_id, activity_type, timestamp_ms, \
     bowl_quantity, grams_at_log, price_per_gram_at_log, payer_id";

impl ActivityLedger for SqliteLedger {
    fn insert(&self, record: &ActivityRecord) -> Result<String> {
        self.with_connection(|conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO activities \
                        (id, session_id, participant_id, activity_type, timestamp_ms, \
                         bowl_quantity, grams_at_log, price_per_gram_at_log, payer_id) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(participant_id, activity_type, timestamp_ms) DO NOTHING",
                    params![
                        record.id,
                        record.session_id,
                        record.participant_id,
                        record.activity_type.as_str(),
                        record.timestamp_ms,
                        record.bowl_quantity as i64,
                        record.grams_at_log,
                        record.price_per_gram_at_log,
                        record.payer_id,
                    ],
                )
                .map_err(|err| EngineError::storage("insert activity", err))?;

            if inserted > 0 {
                return Ok(record.id.clone());
            }

            // Identity tuple already present; hand back the existing id.
            conn.query_row(
                "SELECT id FROM activities \
                 WHERE participant_id = ?1 AND activity_type = ?2 AND timestamp_ms = ?3",
                params![
                    record.participant_id,
                    record.activity_type.as_str(),
                    record.timestamp_ms
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(|err| EngineError::storage("look up existing activity", err))
        })
    }

    fn delete(&self, key: &ActivityKey) -> Result<bool> {
        self.with_connection(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM activities \
                     WHERE participant_id = ?1 AND activity_type = ?2 AND timestamp_ms = ?3",
                    params![key.participant_id, key.activity_type.as_str(), key.timestamp_ms],
                )
                .map_err(|err| EngineError::storage("delete activity", err))?;
            Ok(removed > 0)
        })
    }

    fn get_by_id(&self, id: &str) -> Result<Option<ActivityRecord>> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM activities WHERE id = ?1", RECORD_COLUMNS),
                params![id],
                record_from_row,
            )
            .optional()
            .map_err(|err| EngineError::storage("query activity by id", err))
        })
    }

    fn get_by_time_range(&self, start_ms: i64, end_ms: i64) -> Result<Vec<ActivityRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM activities \
                     WHERE timestamp_ms >= ?1 AND timestamp_ms < ?2 \
                     ORDER BY timestamp_ms ASC",
                    RECORD_COLUMNS
                ))
                .map_err(|err| EngineError::storage("prepare range query", err))?;

            let rows = stmt
                .query_map(params![start_ms, end_ms], record_from_row)
                .map_err(|err| EngineError::storage("query activities by range", err))?;

            collect_records(rows)
        })
    }

    fn get_by_participant(&self, participant_id: &str) -> Result<Vec<ActivityRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM activities \
                     WHERE participant_id = ?1 ORDER BY timestamp_ms ASC",
                    RECORD_COLUMNS
                ))
                .map_err(|err| EngineError::storage("prepare participant query", err))?;

            let rows = stmt
                .query_map(params![participant_id], record_from_row)
                .map_err(|err| EngineError::storage("query activities by participant", err))?;

            collect_records(rows)
        })
    }

    fn latest_for_session(&self, session_id: i64) -> Result<Option<ActivityRecord>> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM activities WHERE session_id = ?1 \
                     ORDER BY timestamp_ms DESC LIMIT 1",
                    RECORD_COLUMNS
                ),
                params![session_id],
                record_from_row,
            )
            .optional()
            .map_err(|err| EngineError::storage("query latest activity", err))
        })
    }

    fn recent_of_type(
        &self,
        session_id: i64,
        activity_type: ActivityType,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM activities \
                     WHERE session_id = ?1 AND activity_type = ?2 \
                     ORDER BY timestamp_ms DESC LIMIT ?3",
                    RECORD_COLUMNS
                ))
                .map_err(|err| EngineError::storage("prepare recent query", err))?;

            let rows = stmt
                .query_map(
                    params![session_id, activity_type.as_str(), limit as i64],
                    record_from_row,
                )
                .map_err(|err| EngineError::storage("query recent activities", err))?;

            collect_records(rows)
        })
    }
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<ActivityRecord>>,
) -> Result<Vec<ActivityRecord>> {
    let mut records = Vec::new();
    for row in rows {
        records.push(row.map_err(|err| EngineError::storage("decode activity row", err))?);
    }
    Ok(records)
}
