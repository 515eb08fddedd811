use std::path::PathBuf;
use std::time::Duration;

use rollcall_core::liveness;
use rollcall_core::{LivenessConfig, SessionId};

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Fixed length of every enrolled embedding.
    pub embedding_dim: usize,
    /// Euclidean distance upper bound for a positive match.
    pub distance_threshold: f32,
    /// Minutes after the scheduled start before a check-in counts as late.
    pub late_grace_mins: i64,
    /// Minimum interval between recognition attempts from one stream.
    pub recognition_cooldown_ms: u64,
    /// Timeout for a single kiosk → service request.
    pub request_timeout_ms: u64,
    /// Extra attempts after the first failed request.
    pub request_retries: u32,
    /// Sleep between request attempts.
    pub retry_backoff_ms: u64,
    /// Per-listener queue depth; a full queue counts as a failed delivery.
    pub listener_queue: usize,
    /// Interval at which the daemon reloads the roster from the database.
    pub roster_refresh_secs: u64,
    /// Unix socket on which dashboards subscribe to a session's events.
    pub socket_path: PathBuf,
    /// When set, the daemon runs a kiosk stream for this session, reading
    /// extracted frames as JSON lines from stdin.
    pub kiosk_session: Option<SessionId>,
    pub liveness: LivenessConfig,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let socket_path = std::env::var("ROLLCALL_SOCKET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_RUNTIME_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join("rollcall/rollcall.sock")
            });

        Self {
            db_path,
            embedding_dim: env_parse("ROLLCALL_EMBEDDING_DIM", 128),
            distance_threshold: env_parse(
                "ROLLCALL_DISTANCE_THRESHOLD",
                rollcall_core::DEFAULT_DISTANCE_THRESHOLD,
            ),
            late_grace_mins: env_parse("ROLLCALL_LATE_GRACE_MINS", 15),
            recognition_cooldown_ms: env_parse("ROLLCALL_RECOGNITION_COOLDOWN_MS", 3000),
            request_timeout_ms: env_parse("ROLLCALL_REQUEST_TIMEOUT_MS", 5000),
            request_retries: env_parse("ROLLCALL_REQUEST_RETRIES", 1),
            retry_backoff_ms: env_parse("ROLLCALL_RETRY_BACKOFF_MS", 500),
            listener_queue: env_parse("ROLLCALL_LISTENER_QUEUE", 64),
            roster_refresh_secs: env_parse("ROLLCALL_ROSTER_REFRESH_SECS", 30),
            socket_path,
            kiosk_session: parse_kiosk_session(std::env::var("ROLLCALL_KIOSK_SESSION").ok()),
            liveness: LivenessConfig {
                movement_threshold: env_parse(
                    "ROLLCALL_LIVENESS_MOVEMENT_THRESHOLD",
                    liveness::MOVEMENT_THRESHOLD,
                ),
                blink_threshold: env_parse(
                    "ROLLCALL_LIVENESS_BLINK_THRESHOLD",
                    liveness::BLINK_THRESHOLD,
                ),
                depth_threshold: env_parse(
                    "ROLLCALL_LIVENESS_DEPTH_THRESHOLD",
                    liveness::DEPTH_THRESHOLD,
                ),
                min_frames_for_live: env_parse(
                    "ROLLCALL_LIVENESS_MIN_FRAMES",
                    liveness::MIN_FRAMES_FOR_LIVE,
                ),
                ..LivenessConfig::default()
            },
        }
    }

    pub fn late_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.late_grace_mins)
    }

    pub fn recognition_cooldown(&self) -> Duration {
        Duration::from_millis(self.recognition_cooldown_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn roster_refresh(&self) -> Duration {
        Duration::from_secs(self.roster_refresh_secs)
    }
}

fn parse_kiosk_session(raw: Option<String>) -> Option<SessionId> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(
                value = %raw,
                error = %e,
                "ignoring ROLLCALL_KIOSK_SESSION, not a session id"
            );
            None
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kiosk_session_parsing() {
        assert_eq!(parse_kiosk_session(None), None);
        assert_eq!(parse_kiosk_session(Some("7".to_string())), Some(7));
        assert_eq!(parse_kiosk_session(Some(" 12\n".to_string())), Some(12));
        assert_eq!(parse_kiosk_session(Some("abc".to_string())), None);
        assert_eq!(parse_kiosk_session(Some(String::new())), None);
    }
}
