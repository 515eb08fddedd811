//! `rollcall` — operator CLI over the attendance database.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rollcall_core::{Embedding, Identity, LivenessState, LivenessVerdict, SessionId};
use rollcalld::{
    AttendanceLedger, AttendanceOutcome, AttendanceStore, CheckInOrchestrator, Config,
    FanoutNotifier, Roster, Session,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rollcall", version, about = "Classroom attendance by face recognition")]
struct Cli {
    /// Database path (defaults to ROLLCALL_DB_PATH or the XDG data dir).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enroll or re-enroll a student from a JSON embedding file.
    Enroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// File holding the embedding as a JSON array of floats.
        #[arg(long)]
        embedding: PathBuf,
    },
    /// Exclude a student from matching without deleting them.
    Deactivate { id: String },
    /// Make a deactivated student matchable again.
    Activate { id: String },
    /// List enrolled students.
    Students {
        /// Include deactivated students.
        #[arg(long)]
        all: bool,
    },
    #[command(subcommand)]
    Session(SessionCommand),
    /// Run one check-in through the matcher and ledger.
    CheckIn {
        #[arg(long)]
        session: SessionId,
        #[arg(long)]
        embedding: PathBuf,
        /// Liveness verdict from the kiosk (LIVE, FAKE, CHECKING, NO_FACE).
        #[arg(long, default_value = "LIVE")]
        liveness: LivenessState,
    },
    /// Show attendance for a session.
    Attendance {
        session: SessionId,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    /// Schedule a session (RFC 3339 times).
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
    },
    Start { id: SessionId },
    Stop { id: SessionId },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    tracing::debug!(db_path = %config.db_path.display(), "opening database");

    let store = AttendanceStore::open(&config.db_path, config.embedding_dim)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let ledger = AttendanceLedger::new(store.clone(), config.late_grace());

    match cli.command {
        Command::Enroll {
            id,
            name,
            embedding,
        } => {
            let identity = Identity {
                identity_id: id,
                display_name: name,
                embedding: read_embedding(&embedding)?,
                enrolled_at: Utc::now(),
                active: true,
            };
            store
                .enroll(&identity)
                .await
                .with_context(|| format!("enrolling {}", identity.identity_id))?;
            println!(
                "enrolled {} ({})",
                identity.identity_id, identity.display_name
            );
        }
        Command::Deactivate { id } => set_active(&store, &id, false).await?,
        Command::Activate { id } => set_active(&store, &id, true).await?,
        Command::Students { all } => {
            let identities = if all {
                store.all_identities().await?
            } else {
                store.active_identities().await?
            };
            if identities.is_empty() {
                println!("no students enrolled");
            }
            for identity in identities {
                println!(
                    "{:<12} {:<30} {}  {}",
                    identity.identity_id,
                    identity.display_name,
                    if identity.active { "active  " } else { "inactive" },
                    identity.enrolled_at.format("%Y-%m-%d")
                );
            }
            println!("{} active", store.count_identities().await?);
        }
        Command::Session(cmd) => run_session(&ledger, cmd).await?,
        Command::CheckIn {
            session,
            embedding,
            liveness,
        } => {
            let query = read_embedding(&embedding)?;
            let roster = Arc::new(Roster::load(&store).await?);
            // No listeners in this process; live events come from rollcalld.
            let orchestrator = CheckInOrchestrator::new(
                roster,
                ledger,
                Arc::new(FanoutNotifier::new()),
                config.distance_threshold,
            );
            let outcome = orchestrator
                .attempt_check_in(session, &query, LivenessVerdict::from_state(liveness))
                .await?;
            println!("{}", describe_outcome(&outcome));
        }
        Command::Attendance { session, json } => {
            let records = ledger.attendance(session).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                if records.is_empty() {
                    println!("no attendance recorded for session {session}");
                }
                for r in records {
                    println!(
                        "{:<12} {}  {:<7}  confidence {:.2}",
                        r.identity_id,
                        r.check_in_time.format("%Y-%m-%d %H:%M:%S"),
                        r.status.as_str(),
                        r.confidence
                    );
                }
            }
        }
    }

    Ok(())
}

async fn run_session(ledger: &AttendanceLedger, cmd: SessionCommand) -> Result<()> {
    match cmd {
        SessionCommand::Create {
            name,
            room,
            start,
            end,
        } => {
            if end <= start {
                bail!("session end must be after its start");
            }
            let session = ledger
                .store()
                .create_session(&name, room.as_deref(), start, end)
                .await?;
            println!("created session {} ({})", session.session_id, session.name);
        }
        SessionCommand::Start { id } => {
            let session = ledger.start(id).await?;
            println!("session {} active", session.session_id);
        }
        SessionCommand::Stop { id } => {
            let session = ledger.stop(id).await?;
            println!("session {} ended", session.session_id);
        }
        SessionCommand::List => {
            let sessions = ledger.store().list_sessions().await?;
            if sessions.is_empty() {
                println!("no sessions");
            }
            for s in &sessions {
                println!("{}", describe_session(s));
            }
        }
    }
    Ok(())
}

async fn set_active(store: &AttendanceStore, id: &str, active: bool) -> Result<()> {
    if !store.set_active(id, active).await? {
        bail!("no student with id {id}");
    }
    println!("{id} {}", if active { "activated" } else { "deactivated" });
    Ok(())
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of numbers", path.display()))
}

fn describe_session(s: &Session) -> String {
    format!(
        "{:>4}  {:<20} {:<10} {:<9}  {} → {}",
        s.session_id,
        s.name,
        s.room_location.as_deref().unwrap_or("-"),
        s.state().as_str(),
        s.scheduled_start.format("%Y-%m-%d %H:%M"),
        s.scheduled_end.format("%H:%M"),
    )
}

fn describe_outcome(outcome: &AttendanceOutcome) -> String {
    match outcome {
        AttendanceOutcome::Recorded(r) => format!(
            "recorded {} ({}, confidence {:.2})",
            r.identity_id,
            r.status.as_str(),
            r.confidence
        ),
        AttendanceOutcome::AlreadyCheckedIn => "already checked in".to_string(),
        AttendanceOutcome::NoMatch => "no match".to_string(),
        AttendanceOutcome::LivenessRejected(state) => format!("liveness rejected ({state})"),
        AttendanceOutcome::SessionNotActive => "session not active".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_in() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "check-in",
            "--session",
            "3",
            "--embedding",
            "q.json",
            "--liveness",
            "fake",
        ])
        .unwrap();
        match cli.command {
            Command::CheckIn {
                session, liveness, ..
            } => {
                assert_eq!(session, 3);
                assert_eq!(liveness, LivenessState::Fake);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_session_create_times() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "session",
            "create",
            "--name",
            "CS101",
            "--start",
            "2026-10-19T09:00:00Z",
            "--end",
            "2026-10-19T10:30:00Z",
        ])
        .unwrap();
        let Command::Session(SessionCommand::Create { start, end, .. }) = cli.command else {
            panic!("expected session create");
        };
        assert_eq!((end - start).num_minutes(), 90);
    }

    #[test]
    fn test_bad_liveness_rejected() {
        assert!(Cli::try_parse_from([
            "rollcall",
            "check-in",
            "--session",
            "1",
            "--embedding",
            "q.json",
            "--liveness",
            "maybe",
        ])
        .is_err());
    }

    #[test]
    fn test_describe_outcome() {
        assert_eq!(
            describe_outcome(&AttendanceOutcome::LivenessRejected(LivenessState::Fake)),
            "liveness rejected (FAKE)"
        );
    }
}
