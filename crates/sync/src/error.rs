//! Error types
//!
//! Both enums are `Clone` because one bootstrap result can be fanned out
//! to several waiting callers.

use chatsync_protocol::describe_error;
use thiserror::Error;

/// Failures talking to the backend
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("request to {path} failed: {message}")]
    Transport { path: String, message: String },

    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode {path} response: {message}")]
    Decode { path: String, message: String },

    #[error("event stream error: {0}")]
    EventStream(String),
}

impl BridgeError {
    /// Message suitable for showing inline on a session.
    ///
    /// For non-success responses the server usually sends a named error
    /// body; prefer its message over the raw status line.
    pub fn user_message(&self) -> String {
        match self {
            BridgeError::Status { status, body, .. } => {
                match serde_json::from_str::<serde_json::Value>(body) {
                    Ok(value) => describe_error(&value),
                    Err(_) if !body.trim().is_empty() => body.trim().to_string(),
                    Err(_) => format!("server returned {status}"),
                }
            }
            other => other.to_string(),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced through `SyncHandle`
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("sync engine is not running")]
    EngineClosed,

    #[error("no active session")]
    NoActiveSession,

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("message {0} not found")]
    MessageNotFound(String),

    #[error("permission {0} not found")]
    PermissionNotFound(String),

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("session {0} already has a prompt in flight")]
    SessionBusy(String),

    #[error("config error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_prefers_server_message() {
        let err = BridgeError::Status {
            path: "/session/ses_1/message".into(),
            status: 400,
            body: r#"{"name":"ProviderAuthError","data":{"message":"invalid api key"}}"#.into(),
        };
        assert_eq!(err.user_message(), "invalid api key");
    }

    #[test]
    fn status_error_falls_back_to_body_then_status() {
        let plain = BridgeError::Status {
            path: "/x".into(),
            status: 502,
            body: "bad gateway\n".into(),
        };
        assert_eq!(plain.user_message(), "bad gateway");

        let empty = BridgeError::Status {
            path: "/x".into(),
            status: 500,
            body: String::new(),
        };
        assert_eq!(empty.user_message(), "server returned 500");
    }
}
