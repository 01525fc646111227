// ABOUTME: Wire types for the CLI and daemon: tagged Request and Reply enums.
// ABOUTME: Encoded as JSON Lines, one message per line over the Unix socket.

//! Wire types for CLI ↔ daemon communication.
//!
//! JSON Lines over a Unix domain socket: the client writes one request per
//! line; the daemon answers with one reply line, or two for `query` (a
//! `queued` acknowledgement and then the final reply).

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::session::{Response, SessionState, SessionStatus};

/// Request sent from the CLI to the daemon.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Explicitly start a session.
    Start { model: String },
    /// Submit text, creating the session if needed.
    Query { model: String, text: String },
    Stop { model: String },
    List {
        #[serde(default)]
        all: bool,
    },
    Status { model: String },
    /// Withdraw a query that has not been written to the process yet.
    Cancel { model: String, query_id: u64 },
    /// Health check.
    Ping,
}

/// One `name, state` row of `list --all`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub name: String,
    pub state: SessionState,
}

/// Reply sent from the daemon to the CLI.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Started { model: String, session_id: String },
    /// The query is in the session FIFO; the final reply follows.
    Queued { query_id: u64 },
    Response { response: Response },
    Stopped { model: String },
    Sessions { names: Vec<String> },
    SessionStates { sessions: Vec<SessionEntry> },
    Status { status: Option<SessionStatus> },
    Cancelled { query_id: u64, cancelled: bool },
    Pong,
    Error { error: SessionError },
}

impl Reply {
    pub fn error(error: SessionError) -> Self {
        Self::Error { error }
    }
}

/// Serialize a message as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, SessionError> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| SessionError::Io(format!("encoding message: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Parse one JSON line (surrounding whitespace ignored).
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, SessionError> {
    serde_json::from_str(line.trim())
        .map_err(|e| SessionError::Io(format!("malformed message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format() {
        let line = encode_line(&Request::Query {
            model: "LLaMA-v2".into(),
            text: "hi".into(),
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(
            line.trim(),
            r#"{"type":"query","model":"LLaMA-v2","text":"hi"}"#
        );
    }

    #[test]
    fn list_all_defaults_to_false() {
        let request: Request = decode_line(r#"{"type":"list"}"#).unwrap();
        assert_eq!(request, Request::List { all: false });
    }

    #[test]
    fn error_reply_carries_kind() {
        let line = encode_line(&Reply::error(SessionError::NotFound("missing".into()))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["kind"], "not_found");

        let back: Reply = decode_line(&line).unwrap();
        assert_eq!(back, Reply::error(SessionError::NotFound("missing".into())));
    }

    #[test]
    fn garbage_is_io_error() {
        let err = decode_line::<Request>("not json").unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
    }
}
