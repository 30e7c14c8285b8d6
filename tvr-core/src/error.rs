//! Domain-specific error types for the TVR protocol.
//!
//! All fallible operations return `Result<T, RemoteError>`.
//! The type is `Clone` so a settled outcome can be handed to a late
//! callback and still be queried afterwards.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The canonical error type for the TVR protocol.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The version token offered by the peer is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The opcode named by the peer has no handler.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A line could not be parsed or carried bad arguments.
    #[error("malformed line: {0}")]
    Malformed(String),

    /// A line violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// An inbound line exceeded the codec limit.
    #[error("line too long: {size} bytes (max {max})")]
    LineTooLong { size: usize, max: usize },

    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/TLS layer reported an error.
    #[error("transport error: {0}")]
    Transport(Arc<std::io::Error>),

    /// The peer closed its side of the stream.
    #[error("peer closed the stream")]
    Eof,

    /// The connection was shut down locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// No line arrived within the keepalive window.
    #[error("no line received within {0:?}")]
    KeepaliveExpired(Duration),

    // ── Event Errors ─────────────────────────────────────────────
    /// An in-flight event was not answered before its deadline.
    #[error("event {id} timed out after {after:?}")]
    EventTimeout { id: String, after: Duration },

    /// A pending coalesced send was superseded before it went out.
    #[error("replaced by a newer value")]
    Replaced,

    /// The peer answered an event with `ERR`.
    #[error("peer reported failure: {0}")]
    Remote(String),

    // ── Settlement Errors ────────────────────────────────────────
    /// A settlable was settled twice.
    #[error("already settled")]
    AlreadySettled,

    /// A second completion callback was registered.
    #[error("callbacks already set")]
    CallbacksAlreadySet,

    /// An accessor was used before settlement.
    #[error("not finished")]
    NotFinished,

    /// A settlable was dropped without ever being settled.
    #[error("settlable abandoned before completion")]
    Abandoned,

    // ── Authentication Errors ────────────────────────────────────
    /// Unknown token or wrong pairing code.
    #[error("unauthorized")]
    Unauthorized,

    /// A collaborator the operation needs is not available right now.
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// The pairing session was cancelled by another party.
    #[error("pairing cancelled")]
    PairingCancelled,

    /// The paired-device store failed.
    #[error("pairing store error: {0}")]
    Store(String),

    // ── Channel Errors ───────────────────────────────────────────
    /// `send`/`publish` on a channel that was never added or was removed.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// `add_channel` on a channel that already exists.
    #[error("duplicate channel: {0}")]
    DuplicateChannel(String),

    // ── Handler Errors ───────────────────────────────────────────
    /// An operation handler reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),

    /// A handler or callback panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// TLS configuration could not be built.
    #[error("tls error: {0}")]
    Tls(String),
}

impl RemoteError {
    /// Stable snake_case tag used in JSON error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::UnsupportedOperation(_) => "unsupported_operation",
            Self::Malformed(_) | Self::LineTooLong { .. } => "malformed",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::Transport(_) | Self::Eof => "transport",
            Self::ConnectionClosed => "connection_closed",
            Self::KeepaliveExpired(_) | Self::EventTimeout { .. } => "timeout",
            Self::Replaced => "replaced",
            Self::Remote(_) => "remote",
            Self::AlreadySettled
            | Self::CallbacksAlreadySet
            | Self::NotFinished
            | Self::Abandoned => "settlement",
            Self::Unauthorized | Self::PairingCancelled => "unauthorized",
            Self::NotReady(_) => "not_ready",
            Self::Store(_) => "store",
            Self::UnknownChannel(_) | Self::DuplicateChannel(_) => "channel",
            Self::Handler(_) | Self::Panicked(_) => "handler",
            Self::Tls(_) => "tls",
        }
    }

    /// Returns `true` for errors that always end the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Eof | Self::ConnectionClosed | Self::KeepaliveExpired(_)
        )
    }

    /// JSON body carried by `!<id> ERR <payload>` responses.
    pub fn to_json_payload(&self) -> String {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
        .to_string()
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Conversions ──────────────────────────────────────────────────

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        RemoteError::Transport(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = RemoteError::LineTooLong {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));

        let e = RemoteError::EventTimeout {
            id: "AbC0".into(),
            after: Duration::from_millis(5000),
        };
        assert!(e.to_string().contains("AbC0"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: RemoteError = io_err.into();
        assert!(matches!(e, RemoteError::Transport(_)));
        assert!(e.is_fatal());
        // Clone keeps the shared io error.
        let copy = e.clone();
        assert_eq!(copy.to_string(), e.to_string());
    }

    #[test]
    fn replaced_and_timeout_are_distinct_kinds() {
        let replaced = RemoteError::Replaced;
        let timeout = RemoteError::EventTimeout {
            id: "abcd".into(),
            after: Duration::from_secs(5),
        };
        assert_ne!(replaced.kind(), timeout.kind());
        assert!(!replaced.is_fatal());
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn json_payload_shape() {
        let payload = RemoteError::UnsupportedOperation("FOO".into()).to_json_payload();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["kind"], "unsupported_operation");
        assert!(value["message"].as_str().unwrap().contains("FOO"));
        assert!(!payload.contains('\n'));
    }

    #[test]
    fn panic_message_extracts_text() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
