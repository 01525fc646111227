// ABOUTME: Session data types: queries, responses, session state, and status snapshots.
// ABOUTME: Everything here crosses the IPC boundary, so it is all serde-serializable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::supervisor::{ExitInfo, ProcessState};

/// Lifecycle of a session as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process spawned, waiting for its first prompt.
    Starting,
    /// Idle and accepting queries.
    Ready,
    /// A query is being answered.
    Busy,
    /// The process is gone; only an explicit start brings the name back.
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// One submission to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Monotonic within the session, starting at 1.
    pub id: u64,
    pub session_id: String,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

/// The framed output that answered a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub query_id: u64,
    pub text: String,
    pub completed_at: DateTime<Utc>,
    /// The process ended before the response was complete.
    pub truncated: bool,
}

/// Point-in-time view of a session for `status` and `list --all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub name: String,
    pub session_id: Option<String>,
    pub state: SessionState,
    pub process: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub queued: usize,
    pub in_flight: Option<u64>,
    pub served: u64,
    pub exit: Option<ExitInfo>,
}

impl SessionStatus {
    /// Status of a session whose process is still being spawned.
    pub fn starting(name: &str) -> Self {
        Self {
            name: name.to_string(),
            session_id: None,
            state: SessionState::Starting,
            process: ProcessState::NotStarted,
            pid: None,
            started_at: None,
            queued: 0,
            in_flight: None,
            served: 0,
            exit: None,
        }
    }
}

/// Activity reported by the router and aggregator; applied to session state by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The process showed its first prompt (or went quiet after startup).
    Ready,
    TurnStarted(u64),
    TurnFinished(u64),
    /// A timed-out query never drew any output; the process can no longer be trusted to pair replies.
    Unresponsive,
    Terminated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Terminated).unwrap();
        assert_eq!(json, "\"terminated\"");
        assert_eq!(SessionState::Busy.to_string(), "busy");
    }

    #[test]
    fn starting_status_has_no_process() {
        let status = SessionStatus::starting("LLaMA-v2");
        assert_eq!(status.state, SessionState::Starting);
        assert_eq!(status.process, ProcessState::NotStarted);
        assert!(status.pid.is_none());
    }
}
