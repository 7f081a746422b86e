//! One physical connection.
//!
//! A [`Link`] is the transport-agnostic half of a socket: outbound frames go
//! into a bounded queue that the socket pump drains, inbound frames are fed
//! to the [`Endpoint`](crate::endpoint::Endpoint) by that same pump.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{LinkId, TransportError};
use tokio::sync::{Notify, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::{LINKS_CLOSED_TOTAL, LINKS_OPENED_TOTAL};
use crate::session::OperationContext;
use crate::spi::Credentials;

/// Outbound frame handed to the socket pump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// An encoded envelope.
    Binary(Bytes),
    /// Liveness probe.
    Ping(Bytes),
    /// Liveness answer.
    Pong(Bytes),
    /// Close the socket and stop pumping.
    Close,
}

type CloseListener = Box<dyn FnOnce(&Link) + Send>;

/// One physical full-duplex connection.
pub struct Link {
    id: LinkId,
    credentials: Credentials,
    tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
    closed_signal: CancellationToken,
    context: OnceLock<Arc<OperationContext>>,
    bound: Notify,
    close_listeners: Mutex<Vec<CloseListener>>,
    /// When this link was established.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
}

impl Link {
    /// Create a link whose outbound frames arrive on the returned receiver.
    pub fn channel(credentials: Credentials, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(LinkId::new(), credentials, tx)), rx)
    }

    /// Wrap an existing sender.
    pub fn new(id: LinkId, credentials: Credentials, tx: mpsc::Sender<Frame>) -> Self {
        let now = Instant::now();
        metrics::counter!(LINKS_OPENED_TOTAL).increment(1);
        Self {
            id,
            credentials,
            tx,
            closed: AtomicBool::new(false),
            closed_signal: CancellationToken::new(),
            context: OnceLock::new(),
            bound: Notify::new(),
            close_listeners: Mutex::new(Vec::new()),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
        }
    }

    /// Link id.
    pub fn id(&self) -> &LinkId {
        &self.id
    }

    /// Credentials the link presented when it was accepted or opened.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Whether frames can currently be queued.
    pub fn is_operational(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue an encoded envelope.
    ///
    /// Fails immediately with [`TransportError::Unavailable`] when the link
    /// is not operational; only waits for queue capacity otherwise.
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.push(Frame::Binary(frame)).await
    }

    /// Queue a ping.
    pub async fn send_ping(&self, data: Bytes) -> Result<(), TransportError> {
        self.push(Frame::Ping(data)).await
    }

    /// Queue a ping without waiting for capacity. A full queue skips the
    /// ping and is not an error: a peer that stops draining also stops
    /// answering, which the heartbeat notices on its own.
    pub fn try_send_ping(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_operational() {
            return Err(TransportError::Unavailable);
        }
        match self.tx.try_send(Frame::Ping(data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(link_id = %self.id, "outbound queue full, ping skipped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Unavailable),
        }
    }

    /// Queue a pong.
    pub async fn send_pong(&self, data: Bytes) -> Result<(), TransportError> {
        self.push(Frame::Pong(data)).await
    }

    async fn push(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_operational() {
            return Err(TransportError::Unavailable);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Unavailable)
    }

    /// Close the link. Only the first call has an effect; close listeners
    /// run exactly once.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(link_id = %self.id, "link closed");
        metrics::counter!(LINKS_CLOSED_TOTAL).increment(1);
        let _ = self.tx.try_send(Frame::Close);
        self.closed_signal.cancel();
        self.bound.notify_waiters();
        let listeners = std::mem::take(&mut *self.close_listeners.lock());
        for listener in listeners {
            listener(self);
        }
    }

    /// Resolves once [`close`](Self::close) has been called, even when the
    /// `Close` frame could not be queued.
    pub async fn closed(&self) {
        self.closed_signal.cancelled().await;
    }

    /// Register a listener for [`close`](Self::close). Runs immediately if
    /// the link is already closed.
    pub fn on_close(&self, listener: impl FnOnce(&Link) + Send + 'static) {
        let mut listeners = self.close_listeners.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(listeners);
            listener(self);
        } else {
            listeners.push(Box::new(listener));
        }
    }

    /// Bind the link to an operation context. The first binding wins and is
    /// returned to every later caller.
    pub fn bind(&self, context: Arc<OperationContext>) -> Arc<OperationContext> {
        let bound = Arc::clone(self.context.get_or_init(|| context));
        self.bound.notify_waiters();
        bound
    }

    /// The bound context, if the handshake has completed.
    pub fn context(&self) -> Option<Arc<OperationContext>> {
        self.context.get().cloned()
    }

    /// Wait until the link is bound. Returns `None` if it closes first.
    pub async fn bound(&self) -> Option<Arc<OperationContext>> {
        loop {
            let notified = self.bound.notified();
            if let Some(context) = self.context() {
                return Some(context);
            }
            if !self.is_operational() {
                return None;
            }
            notified.await;
        }
    }

    /// Mark the link as alive (pong or ping received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag. Returns `true` if the link showed
    /// activity since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last pong (or since the link opened).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("operational", &self.is_operational())
            .field("bound", &self.context.get().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    fn make_link() -> (Arc<Link>, mpsc::Receiver<Frame>) {
        Link::channel(Credentials::Anonymous, 8)
    }

    #[tokio::test]
    async fn send_queues_binary_frame() {
        let (link, mut rx) = make_link();
        link.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Binary(Bytes::from_static(b"hello"))));
    }

    #[tokio::test]
    async fn send_after_close_is_unavailable() {
        let (link, mut rx) = make_link();
        link.close();
        assert!(!link.is_operational());
        assert_matches!(
            link.send(Bytes::from_static(b"x")).await,
            Err(TransportError::Unavailable)
        );
        assert_eq!(rx.recv().await, Some(Frame::Close));
    }

    #[tokio::test]
    async fn send_after_pump_dropped_is_unavailable() {
        let (link, rx) = make_link();
        drop(rx);
        assert!(!link.is_operational());
        assert_matches!(
            link.send_ping(Bytes::new()).await,
            Err(TransportError::Unavailable)
        );
    }

    #[test]
    fn close_listeners_fire_once() {
        let (link, _rx) = make_link();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        link.on_close(move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        link.close();
        link.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_added_after_close_runs_immediately() {
        let (link, _rx) = make_link();
        link.close();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        link.on_close(move |_| flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn bound_returns_none_when_closed() {
        let (link, _rx) = make_link();
        let waiter = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.bound().await.is_none() })
        };
        tokio::task::yield_now().await;
        link.close();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn closed_fires_when_queue_is_full() {
        let (link, _rx) = Link::channel(Credentials::Anonymous, 1);
        link.send(Bytes::from_static(b"stuck")).await.unwrap();
        link.close();
        tokio::time::timeout(Duration::from_secs(1), link.closed())
            .await
            .expect("close signal fired");
    }

    #[tokio::test]
    async fn ping_on_full_queue_is_skipped() {
        let (link, mut rx) = Link::channel(Credentials::Anonymous, 1);
        link.send(Bytes::from_static(b"stuck")).await.unwrap();
        link.try_send_ping(Bytes::new()).unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Binary(Bytes::from_static(b"stuck"))));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert_matches!(link.try_send_ping(Bytes::new()), Err(TransportError::Unavailable));
    }

    #[test]
    fn mark_alive_and_check() {
        let (link, _rx) = make_link();
        assert!(link.check_alive());
        assert!(!link.check_alive());
        link.mark_alive();
        assert!(link.check_alive());
    }
}
