// ABOUTME: Error taxonomy shared by the supervisor, registry, router, and aggregator.
// ABOUTME: Errors are cloneable so one spawn failure can be handed to every waiter.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure a session operation can surface to its caller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionError {
    /// No model with this name is configured.
    #[error("model '{0}' is not configured")]
    NotFound(String),

    /// The executable could not be started, or died immediately.
    #[error("failed to spawn '{model}': {message}")]
    SpawnError { model: String, message: String },

    /// Write or read attempted after the process ended or the session was stopped.
    #[error("channel closed: {0}")]
    ClosedChannel(String),

    /// The process exited while the query was outstanding.
    #[error("process for '{0}' terminated")]
    ProcessTerminated(String),

    /// No output at all arrived within the first-output window.
    #[error("no output from '{model}' within {waited_ms} ms")]
    Timeout { model: String, waited_ms: u64 },

    /// The query was cancelled before it was written.
    #[error("query {0} cancelled")]
    Cancelled(u64),

    /// The query text cannot be sent as a single submission.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Any other I/O failure (socket, filesystem).
    #[error("I/O error: {0}")]
    Io(String),
}

impl SessionError {
    pub fn spawn(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SpawnError {
            model: model.into(),
            message: message.into(),
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::ClosedChannel(message.into())
    }

    /// Process exit code the CLI reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotFound(_) => 2,
            Self::SpawnError { .. } => 3,
            Self::ClosedChannel(_) => 4,
            Self::ProcessTerminated(_) => 5,
            Self::Timeout { .. } => 6,
            Self::Cancelled(_) => 7,
            Self::InvalidInput(_) => 9,
            Self::Config(_) | Self::Io(_) => 1,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let errors = [
            SessionError::NotFound("m".into()),
            SessionError::spawn("m", "missing"),
            SessionError::closed("gone"),
            SessionError::ProcessTerminated("m".into()),
            SessionError::Timeout {
                model: "m".into(),
                waited_ms: 10,
            },
            SessionError::Cancelled(1),
            SessionError::InvalidInput("a/\nb".into()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(SessionError::exit_code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&0));
        // 8 is reserved for "daemon unreachable".
        assert!(!codes.contains(&8));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(SessionError::NotFound("missing".into())).unwrap();
        assert_eq!(json["kind"], "not_found");
        assert_eq!(json["detail"], "missing");

        let back: SessionError = serde_json::from_value(json).unwrap();
        assert_eq!(back, SessionError::NotFound("missing".into()));
    }

    #[test]
    fn display_names_the_model() {
        let err = SessionError::spawn("LLaMA-v2", "no such file");
        assert_eq!(err.to_string(), "failed to spawn 'LLaMA-v2': no such file");
    }
}
