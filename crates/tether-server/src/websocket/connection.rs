//! Socket pump shared by the server and client sides.
//!
//! One pump owns one socket: it drains the link's outbound queue into the
//! socket, feeds inbound binary frames to the [`Endpoint`] and runs the
//! link's heartbeat. Both axum's and tungstenite's message types plug in
//! through [`WireMessage`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tether_rpc::{Endpoint, Frame, Link, run_heartbeat};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// What the pump does with one inbound socket message.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// An encoded envelope.
    Binary(Bytes),
    /// Peer liveness probe; the socket library answers it.
    Ping,
    /// Answer to one of our pings.
    Pong,
    /// Text frames are not part of the protocol.
    Text,
    /// The peer is closing.
    Close,
}

/// Conversion between link frames and a WebSocket library's message type.
pub trait WireMessage: Sized + Send {
    /// Socket message for an outbound frame.
    fn outbound(frame: Frame) -> Self;
    /// Classify an inbound socket message.
    fn inbound(self) -> Inbound;
}

impl WireMessage for axum::extract::ws::Message {
    fn outbound(frame: Frame) -> Self {
        match frame {
            Frame::Binary(data) => Self::Binary(data),
            Frame::Ping(data) => Self::Ping(data),
            Frame::Pong(data) => Self::Pong(data),
            Frame::Close => Self::Close(None),
        }
    }

    fn inbound(self) -> Inbound {
        match self {
            Self::Binary(data) => Inbound::Binary(data),
            Self::Ping(_) => Inbound::Ping,
            Self::Pong(_) => Inbound::Pong,
            Self::Text(_) => Inbound::Text,
            Self::Close(_) => Inbound::Close,
        }
    }
}

impl WireMessage for tokio_tungstenite::tungstenite::Message {
    fn outbound(frame: Frame) -> Self {
        match frame {
            Frame::Binary(data) => Self::Binary(data),
            Frame::Ping(data) => Self::Ping(data),
            Frame::Pong(data) => Self::Pong(data),
            Frame::Close => Self::Close(None),
        }
    }

    fn inbound(self) -> Inbound {
        match self {
            Self::Binary(data) => Inbound::Binary(data),
            Self::Ping(_) => Inbound::Ping,
            Self::Pong(_) => Inbound::Pong,
            Self::Text(_) => Inbound::Text,
            Self::Close(_) => Inbound::Close,
            // raw frames never surface from a reading stream
            Self::Frame(_) => Inbound::Text,
        }
    }
}

/// Heartbeat cadence for a pump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    /// Ping interval.
    pub interval: Duration,
    /// Silence tolerated before the link is closed.
    pub timeout: Duration,
}

/// Pump one socket until either side closes, the link is closed locally or
/// `cancel` fires. The link is closed on return.
#[instrument(skip_all, fields(link_id = %link.id()))]
pub async fn serve_link<S, M, E>(
    socket: S,
    link: Arc<Link>,
    mut frames: mpsc::Receiver<Frame>,
    endpoint: Arc<Endpoint>,
    heartbeat: Heartbeat,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<M, E>> + Sink<M> + Send + Unpin,
    M: WireMessage + Unpin,
    E: fmt::Display + Send,
{
    let (mut sink, mut stream) = socket.split();

    let heartbeat_cancel = cancel.child_token();
    let _heartbeat = tokio::spawn(run_heartbeat(
        Arc::clone(&link),
        heartbeat.interval,
        heartbeat.timeout,
        heartbeat_cancel.clone(),
    ));

    let writer = async {
        while let Some(frame) = frames.recv().await {
            let closing = frame == Frame::Close;
            if sink.send(M::outbound(frame)).await.is_err() {
                debug!("socket write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    };

    let reader = async {
        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "socket read failed");
                    break;
                }
            };
            match message.inbound() {
                Inbound::Binary(data) => endpoint.on_message(&link, &data).await,
                Inbound::Ping => link.mark_alive(),
                Inbound::Pong => endpoint.on_pong(&link),
                Inbound::Text => warn!("ignoring non-binary frame"),
                Inbound::Close => break,
            }
        }
    };

    tokio::select! {
        () = writer => {}
        () = reader => {}
        () = link.closed() => debug!("link closed, dropping socket"),
        () = cancel.cancelled() => debug!("pump cancelled"),
    }
    heartbeat_cancel.cancel();
    endpoint.on_close(&link);
}
