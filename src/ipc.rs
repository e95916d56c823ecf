//! IPC protocol between input sources and the daemon
//!
//! Clients write newline-delimited JSON [`ClientMessage`]s to the daemon's
//! Unix socket. Only `status` gets a reply: one line holding the
//! [`GuardStatus`].

use crate::guard::GuardStatus;
use crate::{ActivityKind, PushPayload, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Socket name for IPC communication
pub const SOCKET_NAME: &str = "hsse-guard.sock";

/// Get the socket path for IPC communication
///
/// Uses XDG_RUNTIME_DIR if available, falls back to the temp dir
pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    runtime_dir.join(SOCKET_NAME)
}

/// Message from an input source to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Raw user input; only qualifying kinds touch the idle clock
    Activity { kind: ActivityKind },
    /// The user dismissed the warning or signed back in
    ResetTimer,
    /// Clear the unacknowledged counter of one channel, or all when omitted
    Acknowledge {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    /// A row change forwarded from the upstream store
    Push { channel: String, payload: PushPayload },
    /// A subscription status transition forwarded from the upstream store
    StatusChange {
        channel: String,
        status: SubscriptionStatus,
    },
    /// Ask for the current guard status
    Status,
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("daemon not running ({}): {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("socket i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("daemon closed the connection without replying")]
    NoReply,
}

fn connect(path: &Path) -> Result<UnixStream, IpcError> {
    UnixStream::connect(path).map_err(|source| IpcError::Connect {
        path: path.to_path_buf(),
        source,
    })
}

/// Send messages to the daemon without waiting for replies.
pub fn send(path: &Path, messages: &[ClientMessage]) -> Result<(), IpcError> {
    let mut stream = connect(path)?;
    for msg in messages {
        let json = serde_json::to_string(msg)?;
        writeln!(stream, "{json}")?;
    }
    stream.flush()?;
    Ok(())
}

/// Ask the daemon for its current status.
pub fn query_status(path: &Path) -> Result<GuardStatus, IpcError> {
    let mut stream = connect(path)?;
    let json = serde_json::to_string(&ClientMessage::Status)?;
    writeln!(stream, "{json}")?;
    stream.flush()?;

    let mut line = String::new();
    if BufReader::new(&stream).read_line(&mut line)? == 0 {
        return Err(IpcError::NoReply);
    }
    Ok(serde_json::from_str(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChangeKind;

    #[test]
    fn socket_path_ends_with_socket_name() {
        let path = socket_path();
        assert!(path.ends_with(SOCKET_NAME));
    }

    #[test]
    fn activity_message() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"activity","kind":"key_down"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Activity {
                kind: ActivityKind::KeyDown
            }
        );

        // Unknown input kinds still parse, they just don't qualify
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"activity","kind":"focus"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Activity {
                kind: ActivityKind::Other
            }
        );
    }

    #[test]
    fn acknowledge_channel_is_optional() {
        let one: ClientMessage =
            serde_json::from_str(r#"{"type":"acknowledge","channel":"incidents"}"#).unwrap();
        assert_eq!(
            one,
            ClientMessage::Acknowledge {
                channel: Some("incidents".into())
            }
        );

        let all: ClientMessage = serde_json::from_str(r#"{"type":"acknowledge"}"#).unwrap();
        assert_eq!(all, ClientMessage::Acknowledge { channel: None });
        assert_eq!(serde_json::to_string(&all).unwrap(), r#"{"type":"acknowledge"}"#);
    }

    #[test]
    fn push_message_carries_store_payload() {
        let json = r#"{
            "type": "push",
            "channel": "incident-notifications",
            "payload": {
                "eventType": "INSERT",
                "schema": "public",
                "table": "incidents",
                "new": {"id": 12, "severity": "critical"},
                "old": null,
                "commit_timestamp": "2026-01-31T12:45:31Z"
            }
        }"#;
        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::Push { channel, payload } => {
                assert_eq!(channel, "incident-notifications");
                assert_eq!(payload.event_type, ChangeKind::Insert);
                assert_eq!(payload.table, "incidents");
            }
            other => panic!("expected push, got {other:?}"),
        }
    }

    #[test]
    fn status_messages() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"status_change","channel":"incidents","status":"CHANNEL_ERROR"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::StatusChange {
                channel: "incidents".into(),
                status: SubscriptionStatus::ChannelError
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"status"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Status);
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"reset_timer"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ResetTimer);
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"sign_out"}"#).is_err());
    }

    #[test]
    fn send_without_daemon_reports_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let err = send(&path, &[ClientMessage::ResetTimer]).unwrap_err();
        assert!(matches!(err, IpcError::Connect { .. }));
        assert!(err.to_string().starts_with("daemon not running"));
    }
}
