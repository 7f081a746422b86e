//! Error types shared by every tether crate.
//!
//! - [`TransportError`]: how an operation or send attempt failed
//! - [`RemoteFault`]: a failure reported by the peer, carried on the wire
//! - [`CodecError`]: a frame could not be encoded or decoded

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// RemoteFault: wire-level failure report
// ─────────────────────────────────────────────────────────────────────────────

/// A failure the peer reported for one operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct RemoteFault {
    /// Machine-readable classification (e.g. `"connector"`, `"protocol"`).
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl RemoteFault {
    /// Build a fault.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Fault for traffic that arrived before the session was bound.
    #[must_use]
    pub fn handshake_required() -> Self {
        Self::new("protocol", "Handshake has not been completed")
    }
}

impl From<&TransportError> for RemoteFault {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Remote(fault) => fault.clone(),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// How a send attempt or an operation failed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No operational link was available.
    #[error("no operational link available")]
    Unavailable,

    /// The peer broke the protocol (duplicate id, unexpected payload, ...).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer failed the operation.
    #[error("remote failure: {0}")]
    Remote(RemoteFault),

    /// Repeated consistency checks found the peer no longer knew about the
    /// operation.
    #[error("Operation finished on remote server with unknown result")]
    InconsistencyExhausted,

    /// The handshake was rejected.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The session closed before the operation completed.
    #[error("session closed")]
    SessionClosed,

    /// A frame could not be encoded or decoded.
    #[error("{0}")]
    Codec(#[from] CodecError),
}

impl TransportError {
    /// Whether retrying on another link could help.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// Short machine-readable kind, used when a local failure is reported to
    /// the peer.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::ProtocolViolation(_) => "protocol",
            Self::Remote(_) => "remote",
            Self::InconsistencyExhausted => "inconsistent",
            Self::HandshakeRejected(_) => "handshake",
            Self::Cancelled => "cancelled",
            Self::SessionClosed => "closed",
            Self::Codec(_) => "codec",
        }
    }
}

impl From<RemoteFault> for TransportError {
    fn from(fault: RemoteFault) -> Self {
        Self::Remote(fault)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CodecError
// ─────────────────────────────────────────────────────────────────────────────

/// A frame could not be turned into an envelope or back.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Encoding failed.
    #[error("encode failed: {0}")]
    Encode(String),
    /// Decoding failed.
    #[error("decode failed: {0}")]
    Decode(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
