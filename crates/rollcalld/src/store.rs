use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::{Embedding, EmbeddingError, Identity, SessionId};
use rusqlite::OptionalExtension;
use thiserror::Error;
use tokio_rusqlite::Connection;

use crate::records::{AttendanceRecord, AttendanceStatus, Session};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Result of the atomic check-in commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    Inserted(AttendanceRecord),
    /// A record for this (identity, session) already exists.
    Duplicate,
    SessionNotActive,
    SessionNotFound,
}

/// Attendance row to be committed.
#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub identity_id: String,
    pub session_id: SessionId,
    pub check_in_time: DateTime<Utc>,
    pub confidence: f32,
    pub status: AttendanceStatus,
}

/// SQLite-backed roster, session and attendance storage.
///
/// Uniqueness of attendance per (identity, session) is a table constraint;
/// [`AttendanceStore::commit_check_in`] relies on it through
/// `INSERT OR IGNORE`, so concurrent commits for the same key can never both
/// insert.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
    embedding_dim: usize,
}

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, embedding_dim: usize) -> Result<Self, StoreError> {
        if embedding_dim == 0 {
            return Err(EmbeddingError::ZeroDimension.into());
        }
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;
                 CREATE TABLE IF NOT EXISTS identities (
                     identity_id TEXT PRIMARY KEY,
                     display_name TEXT NOT NULL,
                     embedding BLOB NOT NULL,
                     is_active INTEGER NOT NULL DEFAULT 1,
                     enrolled_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     name TEXT NOT NULL,
                     room_location TEXT,
                     scheduled_start TEXT NOT NULL,
                     scheduled_end TEXT NOT NULL,
                     actual_start TEXT,
                     actual_end TEXT,
                     is_active INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE IF NOT EXISTS attendance_records (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     identity_id TEXT NOT NULL REFERENCES identities(identity_id),
                     session_id INTEGER NOT NULL REFERENCES sessions(id),
                     check_in_time TEXT NOT NULL,
                     confidence REAL NOT NULL,
                     status TEXT NOT NULL DEFAULT 'present',
                     UNIQUE (identity_id, session_id)
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_session
                     ON attendance_records(session_id);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            embedding_dim,
        })
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    // ── Roster ────────────────────────────────────────────────────────────────

    /// Enroll an identity. Re-enrolling an existing id replaces its name,
    /// embedding and active flag.
    pub async fn enroll(&self, identity: &Identity) -> Result<(), StoreError> {
        identity.embedding.validate(self.embedding_dim)?;
        let blob = embedding_to_bytes(&identity.embedding.values);

        let id = identity.identity_id.clone();
        let name = identity.display_name.clone();
        let active = identity.active;
        let enrolled_at = format_ts(&identity.enrolled_at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identities (identity_id, display_name, embedding, is_active, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(identity_id) DO UPDATE SET
                         display_name = excluded.display_name,
                         embedding = excluded.embedding,
                         is_active = excluded.is_active,
                         enrolled_at = excluded.enrolled_at",
                    rusqlite::params![id, name, blob, active, enrolled_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Activate or deactivate an identity. Returns false if it is unknown.
    pub async fn set_active(&self, identity_id: &str, active: bool) -> Result<bool, StoreError> {
        let identity_id = identity_id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE identities SET is_active = ?1 WHERE identity_id = ?2",
                    rusqlite::params![active, identity_id],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn identity(&self, identity_id: &str) -> Result<Option<Identity>, StoreError> {
        let identity_id = identity_id.to_string();
        let rows = self
            .fetch_identities(
                "SELECT identity_id, display_name, embedding, is_active, enrolled_at
                 FROM identities WHERE identity_id = ?1",
                Some(identity_id),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Active identities ordered by id (the matching gallery).
    pub async fn active_identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.fetch_identities(
            "SELECT identity_id, display_name, embedding, is_active, enrolled_at
             FROM identities WHERE is_active = 1 ORDER BY identity_id",
            None,
        )
        .await
    }

    /// All identities, active or not, ordered by id.
    pub async fn all_identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.fetch_identities(
            "SELECT identity_id, display_name, embedding, is_active, enrolled_at
             FROM identities ORDER BY identity_id",
            None,
        )
        .await
    }

    async fn fetch_identities(
        &self,
        sql: &'static str,
        key: Option<String>,
    ) -> Result<Vec<Identity>, StoreError> {
        // Decode blobs outside the blocking closure
        let rows: Vec<IdentityRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<IdentityRow> {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                };
                let rows = match &key {
                    Some(key) => stmt.query_map([key], map)?.collect::<Result<Vec<_>, _>>()?,
                    None => stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?,
                };
                Ok(rows)
            })
            .await?;

        let mut identities = Vec::with_capacity(rows.len());
        for (identity_id, display_name, blob, active, enrolled_at) in rows {
            let values = bytes_to_embedding(&blob, self.embedding_dim)?;
            identities.push(Identity {
                identity_id,
                display_name,
                embedding: Embedding::new(values),
                enrolled_at: parse_ts(4, &enrolled_at)?,
                active,
            });
        }
        Ok(identities)
    }

    pub async fn count_identities(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM identities WHERE is_active = 1",
                    [],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    /// Create a session in the scheduled (inactive) state.
    pub async fn create_session(
        &self,
        name: &str,
        room_location: Option<&str>,
        scheduled_start: DateTime<Utc>,
        scheduled_end: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let name_owned = name.to_string();
        let room = room_location.map(str::to_string);
        let start = format_ts(&scheduled_start);
        let end = format_ts(&scheduled_end);

        let session_id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (name, room_location, scheduled_start, scheduled_end, is_active)
                     VALUES (?1, ?2, ?3, ?4, 0)",
                    rusqlite::params![name_owned, room, start, end],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        Ok(Session {
            session_id,
            name: name.to_string(),
            room_location: room_location.map(str::to_string),
            scheduled_start,
            scheduled_end,
            actual_start: None,
            actual_end: None,
            is_active: false,
        })
    }

    pub async fn session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        self.conn
            .call(move |conn| {
                let session = conn
                    .query_row(
                        "SELECT id, name, room_location, scheduled_start, scheduled_end,
                                actual_start, actual_end, is_active
                         FROM sessions WHERE id = ?1",
                        [session_id],
                        session_from_row,
                    )
                    .optional()?;
                Ok(session)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, room_location, scheduled_start, scheduled_end,
                            actual_start, actual_end, is_active
                     FROM sessions ORDER BY scheduled_start, id",
                )?;
                let rows = stmt.query_map([], session_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Scheduled → Active. Returns false if the session is not scheduled.
    pub async fn mark_started(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let at = format_ts(&at);
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE sessions SET is_active = 1, actual_start = ?1
                     WHERE id = ?2 AND is_active = 0 AND actual_end IS NULL",
                    rusqlite::params![at, session_id],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Active → Ended. Returns false if the session is not active.
    pub async fn mark_stopped(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let at = format_ts(&at);
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE sessions SET is_active = 0, actual_end = ?1
                     WHERE id = ?2 AND is_active = 1",
                    rusqlite::params![at, session_id],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Attendance ────────────────────────────────────────────────────────────

    /// Insert one attendance record if the session is still active and no
    /// record exists for the (identity, session) pair.
    ///
    /// Session check and insert run in one IMMEDIATE transaction, so a
    /// concurrent stop either lands before (SessionNotActive) or after the
    /// insert.
    pub async fn commit_check_in(&self, new: NewAttendance) -> Result<CommitResult, StoreError> {
        self.conn
            .call(move |conn| {
                let tx =
                    conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let active: Option<bool> = tx
                    .query_row(
                        "SELECT is_active FROM sessions WHERE id = ?1",
                        [new.session_id],
                        |row| row.get(0),
                    )
                    .optional()?;

                let result = match active {
                    None => CommitResult::SessionNotFound,
                    Some(false) => CommitResult::SessionNotActive,
                    Some(true) => {
                        let inserted = tx.execute(
                            "INSERT OR IGNORE INTO attendance_records
                                 (identity_id, session_id, check_in_time, confidence, status)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            rusqlite::params![
                                new.identity_id,
                                new.session_id,
                                format_ts(&new.check_in_time),
                                new.confidence as f64,
                                new.status.as_str(),
                            ],
                        )?;
                        if inserted == 1 {
                            CommitResult::Inserted(AttendanceRecord {
                                id: tx.last_insert_rowid(),
                                identity_id: new.identity_id,
                                session_id: new.session_id,
                                check_in_time: new.check_in_time,
                                confidence: new.confidence,
                                status: new.status,
                            })
                        } else {
                            CommitResult::Duplicate
                        }
                    }
                };
                tx.commit()?;
                Ok(result)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Attendance for a session in check-in order.
    pub async fn attendance_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity_id, session_id, check_in_time, confidence, status
                     FROM attendance_records WHERE session_id = ?1
                     ORDER BY check_in_time, id",
                )?;
                let rows = stmt.query_map([session_id], |row| {
                    let status: String = row.get(5)?;
                    Ok(AttendanceRecord {
                        id: row.get(0)?,
                        identity_id: row.get(1)?,
                        session_id: row.get(2)?,
                        check_in_time: parse_ts(3, &row.get::<_, String>(3)?)?,
                        confidence: row.get::<_, f64>(4)? as f32,
                        status: AttendanceStatus::parse(&status).ok_or_else(|| {
                            rusqlite::Error::FromSqlConversionFailure(
                                5,
                                rusqlite::types::Type::Text,
                                format!("unknown attendance status '{status}'").into(),
                            )
                        })?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }
}

// ── Row helpers ───────────────────────────────────────────────────────────────

/// (identity_id, display_name, embedding blob, is_active, enrolled_at)
type IdentityRow = (String, String, Vec<u8>, bool, String);

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let actual_start: Option<String> = row.get(5)?;
    let actual_end: Option<String> = row.get(6)?;
    Ok(Session {
        session_id: row.get(0)?,
        name: row.get(1)?,
        room_location: row.get(2)?,
        scheduled_start: parse_ts(3, &row.get::<_, String>(3)?)?,
        scheduled_end: parse_ts(4, &row.get::<_, String>(4)?)?,
        actual_start: actual_start.map(|s| parse_ts(5, &s)).transpose()?,
        actual_end: actual_end.map(|s| parse_ts(6, &s)).transpose()?,
        is_active: row.get(7)?,
    })
}

/// Fixed-width UTC timestamps so text order matches time order.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding(bytes: &[u8], dim: usize) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != dim * 4 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    Embedding::new(values.clone()).validate(dim)?;
    Ok(values)
}
