use std::sync::Arc;

use rollcall_core::{
    Embedding, EmbeddingError, EuclideanMatcher, LivenessVerdict, Matcher, SessionId,
};
use thiserror::Error;

use crate::ledger::{AttendanceLedger, AttendanceOutcome, LedgerError};
use crate::notifier::{AttendanceEvent, FanoutNotifier};
use crate::roster::Roster;

#[derive(Error, Debug)]
pub enum CheckInError {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] EmbeddingError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Glues matcher, ledger and notifier for one check-in request.
pub struct CheckInOrchestrator {
    roster: Arc<Roster>,
    matcher: Box<dyn Matcher>,
    ledger: AttendanceLedger,
    notifier: Arc<FanoutNotifier>,
    threshold: f32,
}

impl CheckInOrchestrator {
    pub fn new(
        roster: Arc<Roster>,
        ledger: AttendanceLedger,
        notifier: Arc<FanoutNotifier>,
        threshold: f32,
    ) -> Self {
        Self::with_matcher(roster, Box::new(EuclideanMatcher), ledger, notifier, threshold)
    }

    pub fn with_matcher(
        roster: Arc<Roster>,
        matcher: Box<dyn Matcher>,
        ledger: AttendanceLedger,
        notifier: Arc<FanoutNotifier>,
        threshold: f32,
    ) -> Self {
        Self {
            roster,
            matcher,
            ledger,
            notifier,
            threshold,
        }
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    pub fn notifier(&self) -> &Arc<FanoutNotifier> {
        &self.notifier
    }

    /// Match `embedding` against the current gallery and hand the result to
    /// the ledger. Only a `Recorded` outcome is published to listeners.
    pub async fn attempt_check_in(
        &self,
        session_id: SessionId,
        embedding: &Embedding,
        liveness: LivenessVerdict,
    ) -> Result<AttendanceOutcome, CheckInError> {
        // Held for the whole attempt; later enrollment changes don't apply.
        let gallery = self.roster.snapshot();
        let matched = self.matcher.compare(embedding, &gallery, self.threshold)?;

        let outcome = self.ledger.check_in(session_id, &matched, &liveness).await?;

        if let AttendanceOutcome::Recorded(record) = &outcome {
            let student_name = matched
                .display_name
                .clone()
                .unwrap_or_else(|| record.identity_id.clone());
            let event = AttendanceEvent::AttendanceUpdate {
                student_name,
                student_id: record.identity_id.clone(),
                check_in_time: record.check_in_time,
                confidence: record.confidence,
            };
            let delivered = self.notifier.publish(session_id, &event);
            tracing::debug!(session_id, delivered, "check-in published");
        }

        tracing::info!(session_id, outcome = outcome.as_str(), "check-in attempt");
        Ok(outcome)
    }
}
