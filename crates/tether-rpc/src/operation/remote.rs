//! Requests sent to the peer, awaiting their answer.

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::{
    ControlResponse, InfoLevel, OperationKind, OperationRequest, OperationResponse, Payload,
    RequestId, TransportError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Bookkeeping, OperationState};
use crate::link::Link;
use crate::metrics::{INCONSISTENCY_RETIRED_TOTAL, REMOTE_OPERATION_SECONDS};
use crate::session::Session;

/// What a remote operation is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteKind {
    /// A consistency/capability exchange, answered by a control response.
    Control,
    /// A connector operation, answered by operation responses.
    Operation(OperationKind),
}

/// A request to submit to the peer.
#[derive(Debug)]
pub enum RemoteRequest {
    /// Consistency tick or capability request.
    Control {
        /// Requested info snapshots.
        info_levels: Vec<InfoLevel>,
    },
    /// Connector operation.
    Operation {
        /// The request itself.
        request: OperationRequest,
        /// Receives intermediate results, if the caller wants them.
        updates: Option<mpsc::UnboundedSender<Value>>,
    },
}

impl RemoteRequest {
    /// Control request asking for `info_levels`.
    pub fn control(info_levels: Vec<InfoLevel>) -> Self {
        Self::Control { info_levels }
    }

    /// Operation whose intermediate results are discarded.
    pub fn operation(request: OperationRequest) -> Self {
        Self::Operation {
            request,
            updates: None,
        }
    }

    /// Operation whose intermediate results are streamed to the returned
    /// receiver.
    pub fn streaming(request: OperationRequest) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::Operation {
                request,
                updates: Some(tx),
            },
            rx,
        )
    }

    pub(crate) fn kind(&self) -> RemoteKind {
        match self {
            Self::Control { .. } => RemoteKind::Control,
            Self::Operation { request, .. } => RemoteKind::Operation(request.kind),
        }
    }
}

/// Terminal answer to a remote operation.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteReply {
    /// Final operation response.
    Operation(OperationResponse),
    /// Control response.
    Control(ControlResponse),
}

impl RemoteReply {
    /// The operation response, or a protocol violation for control replies.
    pub fn into_operation(self) -> Result<OperationResponse, TransportError> {
        match self {
            Self::Operation(response) => Ok(response),
            Self::Control(_) => Err(TransportError::ProtocolViolation(
                "control reply where an operation response was expected".into(),
            )),
        }
    }
}

type Outcome = Result<RemoteReply, TransportError>;

/// Bookkeeping for one outbound request.
pub struct RemoteOperation {
    book: Bookkeeping,
    kind: RemoteKind,
    session: Weak<Session>,
    completion: Mutex<Option<oneshot::Sender<Outcome>>>,
    updates: Option<mpsc::UnboundedSender<Value>>,
    created_at: Instant,
    sent_at: Mutex<Option<DateTime<Utc>>>,
}

impl fmt::Debug for RemoteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteOperation")
            .field("request_id", &self.book.request_id())
            .field("kind", &self.kind)
            .field("state", &self.book.state())
            .field("misses", &self.book.misses())
            .finish_non_exhaustive()
    }
}

impl RemoteOperation {
    pub(crate) fn new(
        request_id: RequestId,
        kind: RemoteKind,
        updates: Option<mpsc::UnboundedSender<Value>>,
        session: Weak<Session>,
        threshold: u32,
    ) -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let op = Arc::new(Self {
            book: Bookkeeping::new(request_id, threshold),
            kind,
            session,
            completion: Mutex::new(Some(tx)),
            updates,
            created_at: Instant::now(),
            sent_at: Mutex::new(None),
        });
        (op, rx)
    }

    /// Correlation id allocated by this side.
    pub fn request_id(&self) -> RequestId {
        self.book.request_id()
    }

    /// What the operation waits for.
    pub fn kind(&self) -> RemoteKind {
        self.kind
    }

    /// Whether this is a control exchange.
    pub fn is_control(&self) -> bool {
        self.kind == RemoteKind::Control
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OperationState {
        self.book.state()
    }

    /// Current inconsistency streak.
    pub fn misses(&self) -> u32 {
        self.book.misses()
    }

    /// When the request was handed to a link.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        *self.sent_at.lock()
    }

    pub(crate) fn mark_sent(&self) {
        *self.sent_at.lock() = Some(Utc::now());
    }

    /// Route a message the peer sent for this operation. Returns whether the
    /// operation reached a terminal state.
    pub fn handle_incoming_message(&self, link: &Link, payload: Payload) -> bool {
        match (payload, self.kind) {
            (Payload::Exception(fault), _) => {
                debug!(request_id = %self.request_id(), link_id = %link.id(), %fault, "remote failure");
                self.fail(TransportError::Remote(fault))
            }
            (Payload::Response(response), RemoteKind::Operation(kind)) if response.kind == kind => {
                if response.last {
                    self.complete(RemoteReply::Operation(response))
                } else {
                    if let Some(updates) = &self.updates {
                        let _ = updates.send(response.body);
                    }
                    false
                }
            }
            (Payload::ControlResponse(response), RemoteKind::Control) => {
                if let (Some(info), Some(session)) =
                    (response.connector_info.as_ref(), self.session.upgrade())
                {
                    session.set_peer_info(info.clone());
                }
                self.complete(RemoteReply::Control(response))
            }
            (other, _) => {
                warn!(
                    request_id = %self.request_id(),
                    link_id = %link.id(),
                    payload = other.name(),
                    "unexpected payload for remote operation"
                );
                self.fail(TransportError::ProtocolViolation(format!(
                    "unexpected {} for request {}",
                    other.name(),
                    self.request_id()
                )))
            }
        }
    }

    /// Resolve with a reply.
    pub fn complete(&self, reply: RemoteReply) -> bool {
        self.finish(OperationState::Completed, Ok(reply))
    }

    /// Resolve with an error.
    pub fn fail(&self, error: TransportError) -> bool {
        self.finish(OperationState::Failed, Err(error))
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.finish(OperationState::Cancelled, Err(TransportError::Cancelled))
    }

    fn finish(&self, state: OperationState, outcome: Outcome) -> bool {
        if !self.book.finish(state) {
            return false;
        }
        metrics::histogram!(REMOTE_OPERATION_SECONDS).record(self.created_at.elapsed().as_secs_f64());
        if let Some(tx) = self.completion.lock().take() {
            // the caller may have stopped waiting
            let _ = tx.send(outcome);
        }
        if let Some(session) = self.session.upgrade() {
            session.forget_remote(self.request_id(), self);
        }
        true
    }

    /// Consistency tick: fail once the miss streak reaches the threshold.
    /// Returns whether the operation is still considered consistent.
    pub fn check(&self) -> bool {
        let valid = self.book.is_consistent();
        if !valid && self.fail(TransportError::InconsistencyExhausted) {
            metrics::counter!(INCONSISTENCY_RETIRED_TOTAL, "direction" => "remote").increment(1);
            debug!(
                request_id = %self.request_id(),
                "inconsistent with remote peer, remote operation failed"
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
}

/// Caller-side handle for a submitted request.
#[derive(Debug)]
pub struct RemoteCall {
    request_id: RequestId,
    rx: oneshot::Receiver<Outcome>,
    session: Weak<Session>,
}

impl RemoteCall {
    pub(crate) fn new(request_id: RequestId, rx: oneshot::Receiver<Outcome>, session: Weak<Session>) -> Self {
        Self {
            request_id,
            rx,
            session,
        }
    }

    /// Correlation id of the request.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the terminal reply.
    pub async fn outcome(self) -> Result<RemoteReply, TransportError> {
        self.rx.await.unwrap_or(Err(TransportError::SessionClosed))
    }

    /// Stop waiting and tell the peer, best effort. Returns whether the
    /// operation was still pending.
    pub async fn cancel(self) -> bool {
        match self.session.upgrade() {
            Some(session) => session.cancel_remote(self.request_id).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bound_session, recv_envelope};
    use assert_matches::assert_matches;
    use serde_json::json;
    use tether_core::{ControlRequest, RemoteFault};

    fn get_request() -> RemoteRequest {
        RemoteRequest::operation(OperationRequest::new(OperationKind::Get, json!({"uid": "u1"})))
    }

    #[tokio::test]
    async fn response_completes_the_call() {
        let (session, mut links) = bound_session("S1", 1);
        let call = session.submit(get_request()).await.unwrap();
        let sent = recv_envelope(&mut links[0].1).await;
        assert_eq!(sent.message_id, call.request_id());
        assert_matches!(sent.payload, Payload::Request(_));

        let reply = OperationResponse::complete(OperationKind::Get, json!({"uid": "u1"}));
        assert!(session.receive_response(&links[0].0, call.request_id(), Payload::Response(reply.clone())));
        assert_eq!(call.outcome().await.unwrap(), RemoteReply::Operation(reply));
        assert!(session.remote_ids().is_empty());
    }

    #[tokio::test]
    async fn exception_fails_with_remote_fault() {
        let (session, links) = bound_session("S1", 1);
        let call = session.submit(get_request()).await.unwrap();
        let fault = RemoteFault::new("connector", "no such object");
        let _ = session.receive_response(&links[0].0, call.request_id(), Payload::Exception(fault.clone()));
        assert_matches!(call.outcome().await, Err(TransportError::Remote(f)) if f == fault);
    }

    #[tokio::test]
    async fn updates_stream_before_completion() {
        let (session, links) = bound_session("S1", 1);
        let (request, mut updates) = RemoteRequest::streaming(OperationRequest::new(
            OperationKind::Search,
            json!({}),
        ));
        let call = session.submit(request).await.unwrap();
        let id = call.request_id();
        for n in 0..3 {
            let update = OperationResponse::update(OperationKind::Search, json!(n));
            assert!(!session.receive_response(&links[0].0, id, Payload::Response(update)));
        }
        let last = OperationResponse::complete(OperationKind::Search, json!({"done": true}));
        assert!(session.receive_response(&links[0].0, id, Payload::Response(last)));

        assert_eq!(updates.recv().await, Some(json!(0)));
        assert_eq!(updates.recv().await, Some(json!(1)));
        assert_eq!(updates.recv().await, Some(json!(2)));
        assert!(call.outcome().await.is_ok());
    }

    #[tokio::test]
    async fn unexpected_payload_is_protocol_violation() {
        let (session, links) = bound_session("S1", 1);
        let call = session.submit(get_request()).await.unwrap();
        let _ = session.receive_response(
            &links[0].0,
            call.request_id(),
            Payload::ControlRequest(ControlRequest::default()),
        );
        assert_matches!(call.outcome().await, Err(TransportError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn mismatched_response_kind_is_protocol_violation() {
        let (session, links) = bound_session("S1", 1);
        let call = session.submit(get_request()).await.unwrap();
        let wrong = OperationResponse::complete(OperationKind::Delete, json!(null));
        let _ = session.receive_response(&links[0].0, call.request_id(), Payload::Response(wrong));
        assert_matches!(call.outcome().await, Err(TransportError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn control_response_stores_peer_info() {
        let (session, links) = bound_session("S1", 1);
        let call = session
            .submit(RemoteRequest::control(vec![InfoLevel::ConnectorInfo]))
            .await
            .unwrap();
        let response = ControlResponse {
            connector_info: Some(json!({"connectors": ["ldap"]})),
        };
        let _ = session.receive_response(&links[0].0, call.request_id(), Payload::ControlResponse(response));
        assert_matches!(call.outcome().await, Ok(RemoteReply::Control(_)));
        assert_eq!(session.peer_info(), Some(json!({"connectors": ["ldap"]})));
    }

    #[tokio::test]
    async fn cancel_notifies_peer_and_fails_call() {
        let (session, mut links) = bound_session("S1", 1);
        let call = session.submit(get_request()).await.unwrap();
        let id = call.request_id();
        let _ = recv_envelope(&mut links[0].1).await;

        assert!(call.cancel().await);
        let notice = recv_envelope(&mut links[0].1).await;
        assert_eq!(notice.message_id, id);
        assert_eq!(notice.payload, Payload::Cancel);
        assert!(session.remote_ids().is_empty());
    }

    #[tokio::test]
    async fn sent_at_is_recorded() {
        let (session, _links) = bound_session("S1", 1);
        let call = session.submit(get_request()).await.unwrap();
        let op = session.remote_operation(call.request_id()).unwrap();
        assert!(op.sent_at().is_some());
    }

    #[test]
    fn control_reply_is_not_an_operation_response() {
        let reply = RemoteReply::Control(ControlResponse::default());
        assert_matches!(reply.into_operation(), Err(TransportError::ProtocolViolation(_)));
    }
}
