//! Listener and connector errors.

use tether_core::TransportError;
use thiserror::Error;

/// Failures opening, serving or dialing WebSocket links.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or accepting failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The WebSocket handshake or connection failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// The session handshake could not be sent.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The URL or header values are invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ServerError>;
