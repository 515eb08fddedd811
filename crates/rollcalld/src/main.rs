use std::sync::Arc;

use anyhow::{Context, Result};
use rollcall_core::SessionId;
use rollcalld::{
    spawn_stream, AttendanceLedger, AttendanceStore, CheckInOrchestrator, Config,
    FanoutNotifier, KioskFrame, KioskStatus, KioskStream, Roster,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    tracing::info!(
        db_path = %config.db_path.display(),
        embedding_dim = config.embedding_dim,
        threshold = config.distance_threshold,
        socket_path = %config.socket_path.display(),
        "configuration loaded"
    );

    let store = AttendanceStore::open(&config.db_path, config.embedding_dim)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;

    let roster = Arc::new(
        Roster::load(&store)
            .await
            .context("loading roster")?,
    );

    let ledger = AttendanceLedger::new(store.clone(), config.late_grace());
    let notifier = Arc::new(FanoutNotifier::new());
    let orchestrator = Arc::new(CheckInOrchestrator::new(
        Arc::clone(&roster),
        ledger,
        Arc::clone(&notifier),
        config.distance_threshold,
    ));

    let socket = rollcalld::listener::bind(&config.socket_path).with_context(|| {
        format!("binding listener socket {}", config.socket_path.display())
    })?;
    let listeners = rollcalld::listener::serve(socket, notifier, config.listener_queue);

    // Enrollment changes made through the CLI land in the database; pick them up.
    let refresh = config.roster_refresh();
    let reload_store = store.clone();
    let reload_roster = Arc::clone(&roster);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(refresh);
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(e) = reload_roster.reload(&reload_store).await {
                tracing::warn!(error = %e, "roster reload failed");
            }
        }
    });

    if let Some(session_id) = config.kiosk_session {
        run_stdin_kiosk(session_id, orchestrator, &config);
    }

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    listeners.abort();
    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        tracing::debug!(error = %e, "removing listener socket");
    }

    Ok(())
}

/// Kiosk stream fed with JSON-lines frames from stdin, one
/// `{"landmarks": [...], "embedding": [...]}` object per captured frame.
fn run_stdin_kiosk(session_id: SessionId, orchestrator: Arc<CheckInOrchestrator>, config: &Config) {
    let (frame_tx, frame_rx) = mpsc::channel::<KioskFrame>(8);
    let (status_tx, mut status_rx) = mpsc::channel::<KioskStatus>(8);

    let stream = KioskStream::from_config("stdin", session_id, orchestrator, config);
    spawn_stream(stream, frame_rx, status_tx);

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "reading frames from stdin");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<KioskFrame>(&line) {
                Ok(frame) => {
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "skipping malformed frame"),
            }
        }
        tracing::info!("stdin closed, kiosk input finished");
    });

    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            match status {
                KioskStatus::Outcome(outcome) => {
                    tracing::info!(outcome = outcome.as_str(), "kiosk outcome")
                }
                KioskStatus::Unavailable(reason) => {
                    tracing::warn!(%reason, "kiosk: service unavailable")
                }
                other => tracing::debug!(status = ?other, "kiosk status"),
            }
        }
    });

    tracing::info!(session_id, "stdin kiosk attached");
}
