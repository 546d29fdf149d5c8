//! Error types for the transport.

use serde::{Deserialize, Serialize};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Which deadline was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// A referenced binary-content frame did not arrive in time.
    BinaryResolve,
    /// The peer did not answer an invocation in time.
    InvokeResponse,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::BinaryResolve => write!(f, "binary content resolve"),
            TimeoutKind::InvokeResponse => write!(f, "invoke response"),
        }
    }
}

/// Why a connection was marked bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadConnectionKind {
    /// The peer closed the connection deliberately.
    Disconnect,
    /// The connection dropped unexpectedly.
    ConnectionLost,
}

impl std::fmt::Display for BadConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BadConnectionKind::Disconnect => write!(f, "disconnect"),
            BadConnectionKind::ConnectionLost => write!(f, "connection lost"),
        }
    }
}

/// A dehydrated error received from (or sent to) the peer.
///
/// This is the wire form of an invoke error response: only the error's
/// name and message survive transport, everything else is dropped on
/// dehydration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error class name on the remote side.
    pub name: String,
    /// Human-readable error message.
    pub message: String,
}

impl RemoteError {
    /// Create a new remote error from name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Errors that can occur in the transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Protocol framing/parse error or type mismatch on an inbound frame.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// What was wrong with the message.
        reason: String,
    },

    /// A deadline was exceeded.
    #[error("{kind} timed out")]
    Timeout {
        /// Which deadline was exceeded.
        kind: TimeoutKind,
    },

    /// The connection dropped; all pending work is rejected with this.
    #[error("bad connection ({kind}): {message}")]
    BadConnection {
        /// Why the connection went bad.
        kind: BadConnectionKind,
        /// Additional detail from the connection layer.
        message: String,
    },

    /// The caller misused the API (double response send, rebound stream, ...).
    #[error("invalid action: {reason}")]
    InvalidAction {
        /// What the caller did wrong.
        reason: String,
    },

    /// A single blob exceeds the maximum the wire format can carry.
    #[error("binary payload too large: {size} bytes")]
    MaxSupportedBlobSizeExceeded {
        /// Size of the offending blob.
        size: usize,
    },

    /// A stream terminated with a close code before the operation completed.
    #[error("stream closed (code {code})")]
    StreamClosed {
        /// The close code the stream ended with.
        code: u32,
    },

    /// The peer answered an invocation with an error.
    #[error("remote error [{}]: {}", .0.name, .0.message)]
    Remote(RemoteError),
}

impl TransportError {
    /// Shorthand for an [`TransportError::InvalidMessage`].
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        TransportError::InvalidMessage {
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`TransportError::InvalidAction`].
    pub fn invalid_action(reason: impl Into<String>) -> Self {
        TransportError::InvalidAction {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`TransportError::BadConnection`].
    pub fn bad_connection(kind: BadConnectionKind, message: impl Into<String>) -> Self {
        TransportError::BadConnection {
            kind,
            message: message.into(),
        }
    }

    /// True if this error is a [`TransportError::BadConnection`].
    pub fn is_bad_connection(&self) -> bool {
        matches!(self, TransportError::BadConnection { .. })
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::InvalidMessage {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransportError::invalid_message("bad tuple").to_string(),
            "invalid message: bad tuple"
        );
        assert_eq!(
            TransportError::Timeout {
                kind: TimeoutKind::BinaryResolve
            }
            .to_string(),
            "binary content resolve timed out"
        );
        assert_eq!(
            TransportError::bad_connection(BadConnectionKind::ConnectionLost, "socket eof")
                .to_string(),
            "bad connection (connection lost): socket eof"
        );
        assert_eq!(
            TransportError::StreamClosed { code: 200 }.to_string(),
            "stream closed (code 200)"
        );
    }

    #[test]
    fn test_remote_error_serde_roundtrip() {
        let err = RemoteError::new("RangeError", "value out of range");
        let json = serde_json::to_string(&err).expect("serialize");
        let decoded: RemoteError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, decoded);
    }

    #[test]
    fn test_is_bad_connection() {
        let err = TransportError::bad_connection(BadConnectionKind::Disconnect, "");
        assert!(err.is_bad_connection());
        assert!(!TransportError::invalid_message("x").is_bad_connection());
    }
}
