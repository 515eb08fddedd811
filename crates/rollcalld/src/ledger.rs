use chrono::{DateTime, Duration, Utc};
use rollcall_core::{LivenessState, LivenessVerdict, MatchResult, SessionId};
use thiserror::Error;

use crate::records::{AttendanceRecord, Session, SessionState};
use crate::store::{AttendanceStore, CommitResult, NewAttendance, StoreError};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {0} is already active")]
    SessionAlreadyActive(SessionId),
    #[error("session {0} has ended and cannot be restarted")]
    SessionEnded(SessionId),
    #[error("session {0} is not active")]
    SessionNotActive(SessionId),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of one check-in attempt. All variants are expected outcomes;
/// infrastructure failures are reported as [`LedgerError`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttendanceOutcome {
    Recorded(AttendanceRecord),
    AlreadyCheckedIn,
    NoMatch,
    /// Liveness was not LIVE; carries the rejected state.
    LivenessRejected(LivenessState),
    SessionNotActive,
}

impl AttendanceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceOutcome::Recorded(_) => "recorded",
            AttendanceOutcome::AlreadyCheckedIn => "already_checked_in",
            AttendanceOutcome::NoMatch => "no_match",
            AttendanceOutcome::LivenessRejected(_) => "liveness_rejected",
            AttendanceOutcome::SessionNotActive => "session_not_active",
        }
    }
}

/// Session lifecycle and at-most-once attendance.
///
/// Uniqueness per (identity, session) is enforced by the store's atomic
/// conditional insert, not by a read-then-write here: reading "no record
/// yet" and then inserting would let two kiosks both record the same
/// student.
#[derive(Clone)]
pub struct AttendanceLedger {
    store: AttendanceStore,
    late_grace: Duration,
}

impl AttendanceLedger {
    pub fn new(store: AttendanceStore, late_grace: Duration) -> Self {
        Self { store, late_grace }
    }

    pub fn store(&self) -> &AttendanceStore {
        &self.store
    }

    /// Scheduled → Active.
    pub async fn start(&self, session_id: SessionId) -> Result<Session, LedgerError> {
        self.start_at(session_id, Utc::now()).await
    }

    pub async fn start_at(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<Session, LedgerError> {
        if !self.store.mark_started(session_id, at).await? {
            let session = self.session(session_id).await?;
            return Err(match session.state() {
                SessionState::Active => LedgerError::SessionAlreadyActive(session_id),
                SessionState::Ended => LedgerError::SessionEnded(session_id),
                // Lost a race with a concurrent start/stop; report what we see.
                SessionState::Scheduled => LedgerError::SessionNotActive(session_id),
            });
        }
        tracing::info!(session_id, "session started");
        self.session(session_id).await
    }

    /// Active → Ended. Later check-ins fail fast with `SessionNotActive`.
    pub async fn stop(&self, session_id: SessionId) -> Result<Session, LedgerError> {
        self.stop_at(session_id, Utc::now()).await
    }

    pub async fn stop_at(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<Session, LedgerError> {
        if !self.store.mark_stopped(session_id, at).await? {
            // Distinguish unknown from inactive.
            self.session(session_id).await?;
            return Err(LedgerError::SessionNotActive(session_id));
        }
        tracing::info!(session_id, "session stopped");
        self.session(session_id).await
    }

    pub async fn session(&self, session_id: SessionId) -> Result<Session, LedgerError> {
        self.store
            .session(session_id)
            .await?
            .ok_or(LedgerError::SessionNotFound(session_id))
    }

    pub async fn check_in(
        &self,
        session_id: SessionId,
        matched: &MatchResult,
        liveness: &LivenessVerdict,
    ) -> Result<AttendanceOutcome, LedgerError> {
        self.check_in_at(session_id, matched, liveness, Utc::now())
            .await
    }

    /// Record attendance if, in order: the session is active, the match was
    /// accepted, and liveness is LIVE. Never retries.
    pub async fn check_in_at(
        &self,
        session_id: SessionId,
        matched: &MatchResult,
        liveness: &LivenessVerdict,
        at: DateTime<Utc>,
    ) -> Result<AttendanceOutcome, LedgerError> {
        let session = self.session(session_id).await?;
        if session.state() != SessionState::Active {
            tracing::debug!(session_id, state = ?session.state(), "check-in: session not active");
            return Ok(AttendanceOutcome::SessionNotActive);
        }

        let identity_id = match (&matched.identity_id, matched.matched) {
            (Some(id), true) => id.clone(),
            _ => {
                tracing::debug!(session_id, distance = matched.distance, "check-in: no match");
                return Ok(AttendanceOutcome::NoMatch);
            }
        };

        if !liveness.is_live() {
            tracing::info!(
                session_id,
                identity_id = %identity_id,
                liveness = %liveness.state,
                "check-in: liveness rejected"
            );
            return Ok(AttendanceOutcome::LivenessRejected(liveness.state));
        }

        let commit = self
            .store
            .commit_check_in(NewAttendance {
                identity_id: identity_id.clone(),
                session_id,
                check_in_time: at,
                confidence: matched.confidence,
                status: session.status_at(at, self.late_grace),
            })
            .await?;

        let outcome = match commit {
            CommitResult::Inserted(record) => {
                tracing::info!(
                    session_id,
                    identity_id = %identity_id,
                    confidence = record.confidence,
                    status = record.status.as_str(),
                    "attendance recorded"
                );
                AttendanceOutcome::Recorded(record)
            }
            CommitResult::Duplicate => {
                tracing::debug!(session_id, identity_id = %identity_id, "check-in: already recorded");
                AttendanceOutcome::AlreadyCheckedIn
            }
            // Stopped between the state read and the commit.
            CommitResult::SessionNotActive => AttendanceOutcome::SessionNotActive,
            CommitResult::SessionNotFound => return Err(LedgerError::SessionNotFound(session_id)),
        };
        Ok(outcome)
    }

    pub async fn attendance(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.session(session_id).await?;
        Ok(self.store.attendance_for_session(session_id).await?)
    }
}
