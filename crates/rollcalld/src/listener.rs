//! Dashboard transport: JSON lines over a Unix socket.
//!
//! A client connects, sends one `{"session_id": N}` line, gets a
//! `{"type":"subscribed","session_id":N}` acknowledgement once it is
//! registered, and from then on receives one attendance event per line.
//! Closing the connection unsubscribes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rollcall_core::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::notifier::FanoutNotifier;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("{0} exists and is not a socket")]
    NotASocket(PathBuf),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed before subscribing")]
    NoRequest,
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    session_id: SessionId,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Subscribed { session_id: SessionId },
    Error { message: String },
}

/// Bind the listener socket, replacing a stale socket file left by a
/// previous run.
pub fn bind(path: &Path) -> Result<UnixListener, ListenerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        use std::os::unix::fs::FileTypeExt;
        if !std::fs::symlink_metadata(path)?.file_type().is_socket() {
            return Err(ListenerError::NotASocket(path.to_path_buf()));
        }
        std::fs::remove_file(path)?;
        tracing::debug!(path = %path.display(), "removed stale socket");
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!(path = %path.display(), "listener socket bound");
    Ok(listener)
}

/// Accept dashboard connections until the task is aborted. Each connection
/// gets its own bounded queue of `queue` events.
pub fn serve(
    listener: UnixListener,
    notifier: Arc<FanoutNotifier>,
    queue: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let notifier = Arc::clone(&notifier);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &notifier, queue).await {
                            tracing::debug!(error = %e, "listener connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "listener accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

async fn handle_connection(
    stream: UnixStream,
    notifier: &FanoutNotifier,
    queue: usize,
) -> Result<(), ListenerError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let Some(line) = lines.next_line().await? else {
        return Err(ListenerError::NoRequest);
    };
    let request: SubscribeRequest = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(e) => {
            let reply = Reply::Error {
                message: format!("expected {{\"session_id\": <id>}}: {e}"),
            };
            write_line(&mut write, &reply).await?;
            return Err(e.into());
        }
    };

    let session_id = request.session_id;
    let (listener_id, mut events) = notifier.subscribe_channel(session_id, queue);
    let result = forward(&mut lines, &mut write, &mut events, session_id).await;
    notifier.unsubscribe(session_id, listener_id);
    result
}

async fn forward(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    write: &mut OwnedWriteHalf,
    events: &mut mpsc::Receiver<String>,
    session_id: SessionId,
) -> Result<(), ListenerError> {
    write_line(write, &Reply::Subscribed { session_id }).await?;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(payload) => {
                    write.write_all(payload.as_bytes()).await?;
                    write.write_all(b"\n").await?;
                }
                // Pruned by the notifier after a failed delivery.
                None => return Ok(()),
            },
            line = lines.next_line() => {
                if line?.is_none() {
                    return Ok(());
                }
            }
        }
    }
}

async fn write_line<T: Serialize>(
    write: &mut OwnedWriteHalf,
    value: &T,
) -> Result<(), ListenerError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AttendanceLedger, AttendanceOutcome};
    use crate::orchestrator::CheckInOrchestrator;
    use crate::roster::Roster;
    use crate::store::AttendanceStore;
    use chrono::Utc;
    use rollcall_core::{Embedding, Identity, LivenessState, LivenessVerdict};
    use serde_json::Value;

    fn socket_path() -> PathBuf {
        std::env::temp_dir().join(format!("rollcall-{}.sock", uuid::Uuid::new_v4()))
    }

    async fn connect(path: &Path) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
        let (read, write) = UnixStream::connect(path).await.unwrap().into_split();
        (BufReader::new(read).lines(), write)
    }

    async fn next_json(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Value {
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_socket_subscriber_receives_recorded_check_in() {
        let store = AttendanceStore::open(Path::new(":memory:"), 2)
            .await
            .unwrap();
        store
            .enroll(&Identity {
                identity_id: "S1".to_string(),
                display_name: "Ada Lovelace".to_string(),
                embedding: Embedding::new(vec![1.0, 0.0]),
                enrolled_at: Utc::now(),
                active: true,
            })
            .await
            .unwrap();
        let now = Utc::now();
        let sid = store
            .create_session("CS101", None, now, now + chrono::Duration::hours(1))
            .await
            .unwrap()
            .session_id;
        let roster = Arc::new(Roster::load(&store).await.unwrap());
        let ledger = AttendanceLedger::new(store, chrono::Duration::minutes(15));
        ledger.start(sid).await.unwrap();
        let notifier = Arc::new(FanoutNotifier::new());
        let orch = CheckInOrchestrator::new(roster, ledger, Arc::clone(&notifier), 0.6);

        let path = socket_path();
        let server = serve(bind(&path).unwrap(), Arc::clone(&notifier), 8);

        let (mut lines, mut write) = connect(&path).await;
        write
            .write_all(format!("{{\"session_id\": {sid}}}\n").as_bytes())
            .await
            .unwrap();
        let ack = next_json(&mut lines).await;
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["session_id"], sid);
        assert_eq!(notifier.listener_count(sid), 1);

        let outcome = orch
            .attempt_check_in(
                sid,
                &Embedding::new(vec![1.0, 0.05]),
                LivenessVerdict::from_state(LivenessState::Live),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, AttendanceOutcome::Recorded(_)));

        let event = next_json(&mut lines).await;
        assert_eq!(event["type"], "attendance_update");
        assert_eq!(event["student_id"], "S1");
        assert_eq!(event["student_name"], "Ada Lovelace");

        // Disconnecting unsubscribes.
        drop(write);
        drop(lines);
        for _ in 0..100 {
            if notifier.listener_count(sid) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(notifier.listener_count(sid), 0);

        server.abort();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_malformed_subscribe_gets_error_reply() {
        let notifier = Arc::new(FanoutNotifier::new());
        let path = socket_path();
        let server = serve(bind(&path).unwrap(), Arc::clone(&notifier), 8);

        let (mut lines, mut write) = connect(&path).await;
        write.write_all(b"hello\n").await.unwrap();
        let reply = next_json(&mut lines).await;
        assert_eq!(reply["type"], "error");
        assert!(lines.next_line().await.unwrap().is_none());
        assert_eq!(notifier.session_count(), 0);

        server.abort();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_but_not_files() {
        let path = socket_path();
        drop(bind(&path).unwrap());
        assert!(path.exists());
        // Stale socket from a previous run.
        let listener = bind(&path).unwrap();
        drop(listener);
        std::fs::remove_file(&path).unwrap();

        std::fs::write(&path, b"not a socket").unwrap();
        assert!(matches!(
            bind(&path).unwrap_err(),
            ListenerError::NotASocket(_)
        ));
        std::fs::remove_file(&path).unwrap();
    }
}
