//! Per-kiosk capture loop: liveness over incoming frames, a recognition
//! cooldown, and a bounded-retry call to the check-in service.
//!
//! Each stream exclusively owns its [`LivenessAnalyzer`]; nothing here is
//! shared between streams.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rollcall_core::{
    Embedding, FaceLandmarks, LivenessAnalyzer, LivenessConfig, LivenessSignals, LivenessState,
    LivenessVerdict, SessionId,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::ledger::{AttendanceOutcome, LedgerError};
use crate::orchestrator::{CheckInError, CheckInOrchestrator};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// The service refused the request; retrying would not change that.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Timeout | ClientError::Unavailable(_))
    }
}

impl From<CheckInError> for ClientError {
    fn from(e: CheckInError) -> Self {
        match e {
            CheckInError::Ledger(LedgerError::Store(_)) => ClientError::Unavailable(e.to_string()),
            other => ClientError::Rejected(other.to_string()),
        }
    }
}

/// Recognition service as seen from a kiosk.
pub trait RecognitionClient: Send + Sync + 'static {
    fn check_in(
        &self,
        session_id: SessionId,
        embedding: &Embedding,
        liveness: LivenessVerdict,
    ) -> impl Future<Output = Result<AttendanceOutcome, ClientError>> + Send;
}

impl RecognitionClient for CheckInOrchestrator {
    fn check_in(
        &self,
        session_id: SessionId,
        embedding: &Embedding,
        liveness: LivenessVerdict,
    ) -> impl Future<Output = Result<AttendanceOutcome, ClientError>> + Send {
        async move {
            self.attempt_check_in(session_id, embedding, liveness)
                .await
                .map_err(ClientError::from)
        }
    }
}

/// Minimum spacing between recognition attempts of one stream.
#[derive(Debug, Clone)]
pub struct RecognitionCooldown {
    period: Duration,
    last_attempt: Option<Instant>,
}

impl RecognitionCooldown {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_attempt: None,
        }
    }

    /// Take the slot if the cooldown has elapsed at `now`.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.remaining(now).is_zero() {
            self.last_attempt = Some(now);
            true
        } else {
            false
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_attempt {
            Some(last) => self.period.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

/// Timeout and bounded retry for kiosk → service calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Attempts after the first.
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.request_timeout(),
            retries: config.request_retries,
            backoff: config.retry_backoff(),
        }
    }
}

/// One captured frame after the external extractors ran. `None` means the
/// extractor reported no face.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KioskFrame {
    pub landmarks: Option<FaceLandmarks>,
    pub embedding: Option<Embedding>,
}

/// What the kiosk UI should show after a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum KioskStatus {
    NoFace,
    Checking(LivenessSignals),
    /// Liveness decided but the embedding extractor found no face.
    NoEmbedding,
    CoolingDown(Duration),
    Outcome(AttendanceOutcome),
    /// Transient failure after all retries. The loop keeps running.
    Unavailable(String),
    Rejected(String),
    InvalidFrame(String),
}

pub struct KioskStream<C> {
    stream_id: String,
    session_id: SessionId,
    analyzer: LivenessAnalyzer,
    cooldown: RecognitionCooldown,
    policy: RetryPolicy,
    client: Arc<C>,
}

impl<C: RecognitionClient> KioskStream<C> {
    pub fn new(
        stream_id: impl Into<String>,
        session_id: SessionId,
        client: Arc<C>,
        liveness: LivenessConfig,
        cooldown: Duration,
        policy: RetryPolicy,
    ) -> Self {
        let stream_id = stream_id.into();
        Self {
            analyzer: LivenessAnalyzer::new(stream_id.clone(), liveness),
            stream_id,
            session_id,
            cooldown: RecognitionCooldown::new(cooldown),
            policy,
            client,
        }
    }

    pub fn from_config(
        stream_id: impl Into<String>,
        session_id: SessionId,
        client: Arc<C>,
        config: &Config,
    ) -> Self {
        Self::new(
            stream_id,
            session_id,
            client,
            config.liveness.clone(),
            config.recognition_cooldown(),
            RetryPolicy::from_config(config),
        )
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Run one frame through liveness and, once liveness is decided and the
    /// cooldown allows, through the check-in service.
    pub async fn process(&mut self, frame: KioskFrame) -> KioskStatus {
        let verdict = match self.analyzer.observe(frame.landmarks.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(stream = %self.stream_id, error = %e, "invalid landmarks");
                return KioskStatus::InvalidFrame(e.to_string());
            }
        };

        if !verdict.state.is_decided() {
            return match verdict.state {
                LivenessState::NoFace => KioskStatus::NoFace,
                _ => KioskStatus::Checking(verdict.signals),
            };
        }

        let Some(embedding) = frame.embedding else {
            return KioskStatus::NoEmbedding;
        };

        let now = Instant::now();
        if !self.cooldown.try_acquire(now) {
            return KioskStatus::CoolingDown(self.cooldown.remaining(now));
        }

        match self.request(&embedding, verdict).await {
            Ok(outcome) => KioskStatus::Outcome(outcome),
            Err(e) if e.is_transient() => {
                tracing::warn!(stream = %self.stream_id, error = %e, "check-in service unavailable");
                KioskStatus::Unavailable(e.to_string())
            }
            Err(e) => {
                tracing::warn!(stream = %self.stream_id, error = %e, "check-in rejected");
                KioskStatus::Rejected(e.to_string())
            }
        }
    }

    async fn request(
        &self,
        embedding: &Embedding,
        verdict: LivenessVerdict,
    ) -> Result<AttendanceOutcome, ClientError> {
        let mut attempt = 0;
        loop {
            let call = self.client.check_in(self.session_id, embedding, verdict);
            let result = match tokio::time::timeout(self.policy.timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout),
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.policy.retries => {
                    attempt += 1;
                    tracing::warn!(
                        stream = %self.stream_id,
                        attempt,
                        error = %e,
                        backoff_ms = self.policy.backoff.as_millis() as u64,
                        "check-in failed, retrying"
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                }
                other => return other,
            }
        }
    }
}

/// Drive `stream` from a frame channel until the sender side closes.
/// Statuses are forwarded best effort; a dropped status receiver does not
/// stop check-ins.
pub fn spawn_stream<C: RecognitionClient>(
    mut stream: KioskStream<C>,
    mut frames: mpsc::Receiver<KioskFrame>,
    statuses: mpsc::Sender<KioskStatus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(stream = %stream.stream_id, session_id = stream.session_id, "kiosk stream started");
        while let Some(frame) = frames.recv().await {
            let status = stream.process(frame).await;
            if let KioskStatus::Outcome(outcome) = &status {
                tracing::info!(stream = %stream.stream_id, outcome = outcome.as_str(), "kiosk check-in");
            }
            if statuses.send(status).await.is_err() {
                tracing::trace!(stream = %stream.stream_id, "status receiver gone");
            }
        }
        tracing::info!(stream = %stream.stream_id, "kiosk stream stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::liveness::{FACE_MESH_POINTS, LEFT_EYE, RIGHT_EYE};
    use rollcall_core::Point3;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Step {
        Reply(Result<AttendanceOutcome, ClientError>),
        Hang,
    }

    /// Client that plays back a fixed script, then answers NoMatch.
    struct ScriptedClient {
        script: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RecognitionClient for ScriptedClient {
        fn check_in(
            &self,
            _session_id: SessionId,
            _embedding: &Embedding,
            _liveness: LivenessVerdict,
        ) -> impl Future<Output = Result<AttendanceOutcome, ClientError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Reply(Ok(AttendanceOutcome::NoMatch)));
            async move {
                match step {
                    Step::Reply(result) => result,
                    Step::Hang => std::future::pending().await,
                }
            }
        }
    }

    /// Valid mesh with open eyes; `depth` gives the z spread of a real face.
    fn landmarks(depth: bool) -> FaceLandmarks {
        let mut points: Vec<Point3> = (0..FACE_MESH_POINTS)
            .map(|i| {
                let z = if depth { (i % 5) as f32 * 0.02 } else { 0.0 };
                Point3::new(0.5, 0.5, z)
            })
            .collect();
        for (eye, x0) in [(LEFT_EYE, 0.3f32), (RIGHT_EYE, 0.6f32)] {
            points[eye.horizontal.0].x = x0;
            points[eye.horizontal.1].x = x0 + 0.1;
        }
        FaceLandmarks::new(points)
    }

    fn frame(depth: bool) -> KioskFrame {
        KioskFrame {
            landmarks: Some(landmarks(depth)),
            embedding: Some(Embedding::new(vec![1.0, 0.0])),
        }
    }

    /// Decides on the first face frame: depth alone is LIVE, flat is FAKE.
    fn fast_liveness() -> LivenessConfig {
        LivenessConfig {
            min_frames_for_live: 1,
            min_score_for_live: 1,
            ..LivenessConfig::default()
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(5),
            retries: 1,
            backoff: Duration::from_millis(500),
        }
    }

    fn stream(client: Arc<ScriptedClient>) -> KioskStream<ScriptedClient> {
        KioskStream::new(
            "kiosk-1",
            1,
            client,
            fast_liveness(),
            Duration::from_secs(3),
            policy(),
        )
    }

    #[test]
    fn test_cooldown_window() {
        let start = Instant::now();
        let mut c = RecognitionCooldown::new(Duration::from_secs(3));
        assert!(c.try_acquire(start));
        assert!(!c.try_acquire(start + Duration::from_secs(1)));
        assert_eq!(
            c.remaining(start + Duration::from_secs(1)),
            Duration::from_secs(2)
        );
        assert!(c.try_acquire(start + Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_no_face_and_warmup_do_not_call_service() {
        let client = ScriptedClient::new(vec![]);
        let mut s = KioskStream::new(
            "kiosk-1",
            1,
            client.clone(),
            LivenessConfig::default(),
            Duration::from_secs(3),
            policy(),
        );

        assert_eq!(s.process(KioskFrame::default()).await, KioskStatus::NoFace);
        assert!(matches!(
            s.process(frame(true)).await,
            KioskStatus::Checking(_)
        ));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_landmarks_reported() {
        let client = ScriptedClient::new(vec![]);
        let mut s = stream(client.clone());
        let bad = KioskFrame {
            landmarks: Some(FaceLandmarks::new(vec![Point3::default(); 10])),
            embedding: None,
        };
        assert!(matches!(
            s.process(bad).await,
            KioskStatus::InvalidFrame(_)
        ));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_embedding() {
        let client = ScriptedClient::new(vec![]);
        let mut s = stream(client.clone());
        let f = KioskFrame {
            embedding: None,
            ..frame(true)
        };
        assert_eq!(s.process(f).await, KioskStatus::NoEmbedding);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_throttles_attempts() {
        let client = ScriptedClient::new(vec![
            Step::Reply(Ok(AttendanceOutcome::AlreadyCheckedIn)),
            Step::Reply(Ok(AttendanceOutcome::AlreadyCheckedIn)),
        ]);
        let mut s = stream(client.clone());

        assert_eq!(
            s.process(frame(true)).await,
            KioskStatus::Outcome(AttendanceOutcome::AlreadyCheckedIn)
        );
        assert!(matches!(
            s.process(frame(true)).await,
            KioskStatus::CoolingDown(_)
        ));
        assert_eq!(client.calls(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(
            s.process(frame(true)).await,
            KioskStatus::Outcome(AttendanceOutcome::AlreadyCheckedIn)
        );
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fake_verdict_is_sent_for_rejection() {
        let client = ScriptedClient::new(vec![Step::Reply(Ok(
            AttendanceOutcome::LivenessRejected(LivenessState::Fake),
        ))]);
        let mut s = stream(client.clone());
        assert_eq!(
            s.process(frame(false)).await,
            KioskStatus::Outcome(AttendanceOutcome::LivenessRejected(LivenessState::Fake))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retried_once_then_succeeds() {
        let client = ScriptedClient::new(vec![
            Step::Hang,
            Step::Reply(Ok(AttendanceOutcome::NoMatch)),
        ]);
        let mut s = stream(client.clone());
        let started = Instant::now();

        assert_eq!(
            s.process(frame(true)).await,
            KioskStatus::Outcome(AttendanceOutcome::NoMatch)
        );
        assert_eq!(client.calls(), 2);
        assert!(started.elapsed() >= Duration::from_millis(5500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_surfaces_unavailable() {
        let client = ScriptedClient::new(vec![
            Step::Reply(Err(ClientError::Unavailable("db locked".into()))),
            Step::Hang,
        ]);
        let mut s = stream(client.clone());

        assert!(matches!(
            s.process(frame(true)).await,
            KioskStatus::Unavailable(_)
        ));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_not_retried() {
        let client = ScriptedClient::new(vec![Step::Reply(Err(ClientError::Rejected(
            "session 9 not found".into(),
        )))]);
        let mut s = stream(client.clone());
        assert!(matches!(
            s.process(frame(true)).await,
            KioskStatus::Rejected(_)
        ));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_stream_survives_failures() {
        let client = ScriptedClient::new(vec![
            Step::Hang,
            Step::Hang,
            Step::Reply(Ok(AttendanceOutcome::AlreadyCheckedIn)),
        ]);
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (status_tx, mut status_rx) = mpsc::channel(4);
        let handle = spawn_stream(stream(client.clone()), frame_rx, status_tx);

        frame_tx.send(frame(true)).await.unwrap();
        assert!(matches!(
            status_rx.recv().await.unwrap(),
            KioskStatus::Unavailable(_)
        ));

        tokio::time::advance(Duration::from_secs(3)).await;
        frame_tx.send(frame(true)).await.unwrap();
        assert_eq!(
            status_rx.recv().await.unwrap(),
            KioskStatus::Outcome(AttendanceOutcome::AlreadyCheckedIn)
        );

        drop(frame_tx);
        handle.await.unwrap();
        assert_eq!(client.calls(), 3);
    }
}
