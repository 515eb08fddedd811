//! rollcalld — attendance service.
//!
//! Persistence, roster snapshot, session ledger, listener fan-out over a
//! Unix socket, and the kiosk capture loop built on top of `rollcall-core`.

pub mod config;
pub mod kiosk;
pub mod ledger;
pub mod listener;
pub mod notifier;
pub mod orchestrator;
pub mod records;
pub mod roster;
pub mod store;

pub use config::Config;
pub use kiosk::{
    spawn_stream, ClientError, KioskFrame, KioskStatus, KioskStream, RecognitionClient,
    RecognitionCooldown, RetryPolicy,
};
pub use ledger::{AttendanceLedger, AttendanceOutcome, LedgerError};
pub use listener::ListenerError;
pub use notifier::{AttendanceEvent, DeliveryError, EventSink, FanoutNotifier, ListenerId};
pub use orchestrator::{CheckInError, CheckInOrchestrator};
pub use records::{AttendanceRecord, AttendanceStatus, Session, SessionState};
pub use roster::{Roster, RosterEvent};
pub use store::{AttendanceStore, CommitResult, NewAttendance, StoreError};
