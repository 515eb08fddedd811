//! Session and attendance records shared by the store, ledger and CLI.

use chrono::{DateTime, Duration, Utc};
use rollcall_core::SessionId;
use serde::Serialize;

/// Lifecycle position of a session. Transitions are linear:
/// `Scheduled → Active → Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Scheduled,
    Active,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Scheduled => "scheduled",
            SessionState::Active => "active",
            SessionState::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub session_id: SessionId,
    pub name: String,
    pub room_location: Option<String>,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Session {
    pub fn state(&self) -> SessionState {
        if self.is_active {
            SessionState::Active
        } else if self.actual_end.is_some() {
            SessionState::Ended
        } else {
            SessionState::Scheduled
        }
    }

    /// Attendance status for a check-in at `at`.
    pub fn status_at(&self, at: DateTime<Utc>, late_grace: Duration) -> AttendanceStatus {
        if at > self.scheduled_start + late_grace {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::Present
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(AttendanceStatus::Present),
            "late" => Some(AttendanceStatus::Late),
            _ => None,
        }
    }
}

/// One committed check-in. At most one exists per (identity, session).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub identity_id: String,
    pub session_id: SessionId,
    pub check_in_time: DateTime<Utc>,
    pub confidence: f32,
    pub status: AttendanceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(is_active: bool, ended: bool) -> Session {
        let start = Utc::now();
        Session {
            session_id: 1,
            name: "CS101".to_string(),
            room_location: None,
            scheduled_start: start,
            scheduled_end: start + Duration::hours(1),
            actual_start: None,
            actual_end: ended.then_some(start),
            is_active,
        }
    }

    #[test]
    fn test_state_derivation() {
        assert_eq!(session(false, false).state(), SessionState::Scheduled);
        assert_eq!(session(true, false).state(), SessionState::Active);
        assert_eq!(session(false, true).state(), SessionState::Ended);
    }

    #[test]
    fn test_late_after_grace() {
        let s = session(true, false);
        let grace = Duration::minutes(15);
        assert_eq!(
            s.status_at(s.scheduled_start + Duration::minutes(10), grace),
            AttendanceStatus::Present
        );
        assert_eq!(
            s.status_at(s.scheduled_start + Duration::minutes(16), grace),
            AttendanceStatus::Late
        );
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(AttendanceStatus::parse("late"), Some(AttendanceStatus::Late));
        assert_eq!(AttendanceStatus::parse("absent"), None);
    }
}
