//! Requests received from the peer and serviced here.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde_json::Value;
use tether_core::{
    Envelope, OperationKind, OperationRequest, OperationResponse, Payload, RemoteFault, RequestId,
    TransportError, codec,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{Bookkeeping, OperationState};
use crate::link::Link;
use crate::metrics::{DELIVERY_FAILURES_TOTAL, INCONSISTENCY_RETIRED_TOTAL};
use crate::session::Session;
use crate::spi::Dispatcher;

/// Bookkeeping for one inbound request.
///
/// Sticky operations pin their replies to the first link a reply was
/// delivered on. The pin is guarded by an async mutex so sends of one
/// operation are serialized without blocking any other operation.
pub struct LocalOperation {
    book: Bookkeeping,
    kind: OperationKind,
    sticky: bool,
    session: Weak<Session>,
    bound: tokio::sync::Mutex<Option<Arc<Link>>>,
    cancel: CancellationToken,
}

impl fmt::Debug for LocalOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalOperation")
            .field("request_id", &self.book.request_id())
            .field("kind", &self.kind)
            .field("sticky", &self.sticky)
            .field("state", &self.book.state())
            .field("misses", &self.book.misses())
            .finish_non_exhaustive()
    }
}

impl LocalOperation {
    pub(crate) fn new(
        request_id: RequestId,
        kind: OperationKind,
        session: Weak<Session>,
        threshold: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            book: Bookkeeping::new(request_id, threshold),
            kind,
            sticky: kind.is_sticky(),
            session,
            bound: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Correlation id assigned by the peer.
    pub fn request_id(&self) -> RequestId {
        self.book.request_id()
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Whether replies stick to the first link used.
    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OperationState {
        self.book.state()
    }

    /// Current inconsistency streak.
    pub fn misses(&self) -> u32 {
        self.book.misses()
    }

    /// The link replies are pinned to, if any.
    pub async fn bound_link(&self) -> Option<Arc<Link>> {
        self.bound.lock().await.clone()
    }

    /// Run the dispatcher and deliver its outcome. Stops early, without
    /// replying, if the operation is cancelled.
    #[instrument(skip_all, fields(request_id = %self.request_id(), kind = ?self.kind))]
    pub async fn execute(self: Arc<Self>, dispatcher: Arc<dyn Dispatcher>, request: OperationRequest) {
        let scope = OperationScope {
            op: Arc::clone(&self),
        };
        let outcome = tokio::select! {
            outcome = dispatcher.dispatch(request, scope) => Some(outcome),
            () = self.cancel.cancelled() => None,
        };
        match outcome {
            Some(Ok(response)) => {
                let _ = self.handle_result(response).await;
            }
            Some(Err(fault)) => {
                let _ = self.handle_error(fault).await;
            }
            None => debug!("dispatch abandoned after cancellation"),
        }
    }

    /// Deliver the terminal result. Returns whether a link accepted it.
    ///
    /// Delivery failures are logged and swallowed: the operation is complete
    /// either way and the peer's consistency check retires its twin.
    pub async fn handle_result(&self, mut response: OperationResponse) -> bool {
        if !self.book.finish(OperationState::Completed) {
            return false;
        }
        response.last = true;
        let envelope = Envelope::new(self.request_id(), Payload::Response(response));
        let delivered = self.deliver(&envelope, false).await;
        self.forget();
        delivered.is_ok()
    }

    /// Deliver a failure. Errors may travel on any link, sticky or not.
    pub async fn handle_error(&self, fault: RemoteFault) -> bool {
        if !self.book.finish(OperationState::Failed) {
            return false;
        }
        let envelope = Envelope::exception(self.request_id(), fault);
        let delivered = self.deliver(&envelope, true).await;
        self.forget();
        delivered.is_ok()
    }

    /// Deliver an intermediate result.
    pub async fn send_update(&self, body: Value) -> Result<(), TransportError> {
        if self.book.state().is_terminal() {
            return Err(TransportError::Cancelled);
        }
        let envelope = Envelope::new(
            self.request_id(),
            Payload::Response(OperationResponse::update(self.kind, body)),
        );
        self.deliver(&envelope, false).await
    }

    async fn deliver(&self, envelope: &Envelope, any_link: bool) -> Result<(), TransportError> {
        let result = match codec::encode(envelope) {
            Ok(frame) => self.send_frame(frame, any_link).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &result {
            metrics::counter!(DELIVERY_FAILURES_TOTAL).increment(1);
            warn!(
                request_id = %self.request_id(),
                payload = envelope.payload.name(),
                error = %e,
                "failed to deliver local operation message"
            );
        }
        result
    }

    async fn send_frame(&self, frame: Bytes, any_link: bool) -> Result<(), TransportError> {
        let session = self.session.upgrade().ok_or(TransportError::SessionClosed)?;
        if !self.sticky || any_link {
            return session
                .try_send_message(&frame)
                .await
                .map(|_| ())
                .ok_or(TransportError::Unavailable);
        }

        let mut bound = self.bound.lock().await;
        if let Some(link) = bound.as_ref() {
            return link.send(frame).await;
        }
        let link = session
            .try_send_message(&frame)
            .await
            .ok_or(TransportError::Unavailable)?;
        debug!(request_id = %self.request_id(), link_id = %link.id(), "sticky operation bound");
        *bound = Some(link);
        Ok(())
    }

    /// Stop the operation. Returns `false` if it had already finished.
    pub fn cancel(&self) -> bool {
        if !self.book.finish(OperationState::Cancelled) {
            return false;
        }
        debug!(request_id = %self.request_id(), "local operation cancelled");
        self.cancel.cancel();
        self.forget();
        true
    }

    /// Consistency tick: cancel once the miss streak reaches the threshold.
    /// Returns whether the operation is still considered consistent.
    pub fn check(&self) -> bool {
        let valid = self.book.is_consistent();
        if !valid && self.cancel() {
            metrics::counter!(INCONSISTENCY_RETIRED_TOTAL, "direction" => "local").increment(1);
            debug!(
                request_id = %self.request_id(),
                "inconsistent with remote peer, local operation cancelled"
            );
        }
        valid
    }

    /// The peer did not advertise this operation.
    pub fn inconsistent(&self) -> bool {
        let _ = self.book.record_miss();
        self.check()
    }

    /// The peer advertised this operation.
    pub fn consistent(&self) {
        self.book.reset_misses();
    }

    fn forget(&self) {
        if let Some(session) = self.session.upgrade() {
            session.forget_local(self.request_id(), self);
        }
    }
}

/// Handle given to the [`Dispatcher`] for one operation.
#[derive(Clone)]
pub struct OperationScope {
    op: Arc<LocalOperation>,
}

impl OperationScope {
    /// Correlation id of the operation.
    pub fn request_id(&self) -> RequestId {
        self.op.request_id()
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.op.kind
    }

    /// Stream an intermediate result to the peer.
    pub async fn send_update(&self, body: Value) -> Result<(), TransportError> {
        self.op.send_update(body).await
    }

    /// Whether the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.op.cancel.is_cancelled()
    }

    /// Resolves when the operation is cancelled.
    pub async fn cancelled(&self) {
        self.op.cancel.cancelled().await;
    }
}
