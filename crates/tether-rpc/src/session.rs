//! Logical sessions spanning one or more links.
//!
//! A [`Session`] is keyed by a [`SessionId`] shared by both peers. It owns the
//! links that completed a handshake for that id, the names of the principals
//! that brought them, and the in-flight operations in both directions.
//!
//! Locks are never held across a send: every method that talks to links or
//! operations works on a snapshot taken under the lock.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tether_core::{
    ControlRequest, Envelope, Handshake, InfoLevel, LinkId, OperationRequest, Payload, RequestId,
    SessionId, TransportError, codec,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::link::Link;
use crate::metrics::{LOCAL_OPERATIONS_TOTAL, REMOTE_OPERATIONS_TOTAL, SESSIONS_CLOSED_TOTAL};
use crate::operation::{
    LocalOperation, RemoteCall, RemoteKind, RemoteOperation, RemoteReply, RemoteRequest,
};
use crate::principal::Principal;

// ─────────────────────────────────────────────────────────────────────────────
// OperationContext
// ─────────────────────────────────────────────────────────────────────────────

/// What a bound link acts for: the principal that opened the session and the
/// session itself.
pub struct OperationContext {
    principal: Arc<Principal>,
    session: Weak<Session>,
}

impl OperationContext {
    /// Principal whose dispatcher services inbound requests.
    pub fn principal(&self) -> &Arc<Principal> {
        &self.principal
    }

    /// The session, unless it has been dropped.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("principal", &self.principal.name())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

struct LinkEntry {
    principal: String,
    link: Arc<Link>,
}

type CloseListener = Box<dyn FnOnce(&Session) + Send>;

/// One logical session.
pub struct Session {
    id: SessionId,
    me: Weak<Session>,
    config: SessionConfig,
    context: Mutex<Option<Arc<OperationContext>>>,
    links: RwLock<Vec<LinkEntry>>,
    principals: Mutex<HashSet<String>>,
    local_ops: DashMap<RequestId, Arc<LocalOperation>>,
    remote_ops: DashMap<RequestId, Arc<RemoteOperation>>,
    next_request_id: AtomicU64,
    rr_index: AtomicUsize,
    ever_linked: AtomicBool,
    last_activity: Mutex<Instant>,
    running: AtomicBool,
    peer_info: RwLock<Option<Value>>,
    close_listeners: Mutex<Vec<CloseListener>>,
}

impl Session {
    /// Create a running session with no links.
    pub fn new(id: SessionId, config: SessionConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            config,
            context: Mutex::new(None),
            links: RwLock::new(Vec::new()),
            principals: Mutex::new(HashSet::new()),
            local_ops: DashMap::new(),
            remote_ops: DashMap::new(),
            next_request_id: AtomicU64::new(0),
            rr_index: AtomicUsize::new(0),
            ever_linked: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            running: AtomicBool::new(true),
            peer_info: RwLock::new(None),
            close_listeners: Mutex::new(Vec::new()),
        })
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Whether [`close`](Self::close) has not run yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether any registered link is operational.
    pub fn is_operational(&self) -> bool {
        self.links.read().iter().any(|e| e.link.is_operational())
    }

    /// Number of registered links.
    pub fn link_count(&self) -> usize {
        self.links.read().len()
    }

    /// Names of the principals currently attached.
    pub fn principals(&self) -> Vec<String> {
        self.principals.lock().iter().cloned().collect()
    }

    /// Capability snapshot last received from the peer.
    pub fn peer_info(&self) -> Option<Value> {
        self.peer_info.read().clone()
    }

    pub(crate) fn set_peer_info(&self, info: Value) {
        *self.peer_info.write() = Some(info);
    }

    /// Ids of inbound operations still being serviced.
    pub fn local_ids(&self) -> Vec<RequestId> {
        self.local_ops.iter().map(|e| *e.key()).collect()
    }

    /// Ids of outbound operations still awaiting a reply, control exchanges
    /// excluded.
    pub fn remote_ids(&self) -> Vec<RequestId> {
        self.remote_ops
            .iter()
            .filter(|e| !e.value().is_control())
            .map(|e| *e.key())
            .collect()
    }

    /// Look up an inbound operation.
    pub fn local_operation(&self, id: RequestId) -> Option<Arc<LocalOperation>> {
        self.local_ops.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Look up an outbound operation.
    pub fn remote_operation(&self, id: RequestId) -> Option<Arc<RemoteOperation>> {
        self.remote_ops.get(&id).map(|e| Arc::clone(e.value()))
    }

    fn local_snapshot(&self) -> Vec<Arc<LocalOperation>> {
        self.local_ops.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn remote_snapshot(&self) -> Vec<Arc<RemoteOperation>> {
        self.remote_ops.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn has_outstanding(&self) -> bool {
        !self.local_ops.is_empty() || !self.remote_ops.is_empty()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    // ── Handshake ───────────────────────────────────────────────────────

    /// Bind `link` to this session on behalf of `principal`.
    ///
    /// The operation context is created by the first handshake and shared by
    /// every later one. The link is registered only when the advertised id
    /// matches; the first link ever registered triggers the initial
    /// capability request.
    #[instrument(skip_all, fields(session_id = %self.id, link_id = %link.id(), principal = %principal.name()))]
    pub fn handshake(
        &self,
        principal: &Arc<Principal>,
        link: &Arc<Link>,
        message: &Handshake,
    ) -> Result<Arc<OperationContext>, TransportError> {
        if let Some(existing) = link.context() {
            debug!("link already bound, handshake ignored");
            return Ok(existing);
        }
        let context = {
            let mut guard = self.context.lock();
            Arc::clone(guard.get_or_insert_with(|| {
                Arc::new(OperationContext {
                    principal: Arc::clone(principal),
                    session: self.me.clone(),
                })
            }))
        };

        if message.session_id != self.id {
            return Err(TransportError::HandshakeRejected(format!(
                "session id mismatch: expected {}, got {}",
                self.id, message.session_id
            )));
        }
        if !self.is_running() {
            return Err(TransportError::HandshakeRejected("session is closed".into()));
        }

        let bound = link.bind(Arc::clone(&context));
        if !Arc::ptr_eq(&bound, &context) {
            // a concurrent handshake bound the link elsewhere first
            return Ok(bound);
        }
        let first = match self.attach_link(principal.name(), link) {
            Ok(first) => first,
            Err(e) => {
                link.close();
                return Err(e);
            }
        };
        info!(agent = %message.agent, "link joined session");

        if first && self.config.info_request_attempts > 0 {
            if let Some(session) = self.me.upgrade() {
                let _ = tokio::spawn(session.request_peer_info());
            }
        }
        Ok(bound)
    }

    /// Register a link. Returns whether it is the first link this session
    /// ever had, or an error when the session closed in the meantime.
    fn attach_link(&self, principal: &str, link: &Arc<Link>) -> Result<bool, TransportError> {
        let first = {
            let mut links = self.links.write();
            // close() flips `running` before draining `links`
            if !self.is_running() {
                return Err(TransportError::HandshakeRejected("session is closed".into()));
            }
            links.push(LinkEntry {
                principal: principal.to_string(),
                link: Arc::clone(link),
            });
            !self.ever_linked.swap(true, Ordering::AcqRel)
        };
        let _ = self.principals.lock().insert(principal.to_string());
        self.touch();

        let me = self.me.clone();
        link.on_close(move |closed| {
            if let Some(session) = me.upgrade() {
                session.detach_link(closed.id());
            }
        });
        Ok(first)
    }

    fn detach_link(&self, id: &LinkId) {
        self.links.write().retain(|e| e.link.id() != id);
        debug!(session_id = %self.id, link_id = %id, "link left session");
    }

    async fn request_peer_info(self: Arc<Self>) {
        for attempt in 1..=self.config.info_request_attempts {
            if !self.is_running() {
                return;
            }
            let outcome = match self
                .submit(RemoteRequest::control(vec![InfoLevel::ConnectorInfo]))
                .await
            {
                Ok(call) => call.outcome().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(RemoteReply::Control(_)) => {
                    debug!(session_id = %self.id, "peer info received");
                    return;
                }
                Ok(RemoteReply::Operation(_)) => return,
                Err(e) => {
                    warn!(session_id = %self.id, attempt, error = %e, "peer info request failed");
                }
            }
            tokio::time::sleep(self.config.info_retry_delay).await;
        }
    }

    // ── Delivery ────────────────────────────────────────────────────────

    /// Offer a send to each operational link, starting from a rotating
    /// index, until one accepts. Returns the accepting link.
    pub async fn try_send_with<F, Fut>(&self, mut send: F) -> Option<Arc<Link>>
    where
        F: FnMut(Arc<Link>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let links: Vec<Arc<Link>> = self
            .links
            .read()
            .iter()
            .filter(|e| e.link.is_operational())
            .map(|e| Arc::clone(&e.link))
            .collect();
        if links.is_empty() {
            return None;
        }
        let start = self.rr_index.fetch_add(1, Ordering::Relaxed) % links.len();
        for offset in 0..links.len() {
            let link = &links[(start + offset) % links.len()];
            if send(Arc::clone(link)).await {
                return Some(Arc::clone(link));
            }
        }
        None
    }

    /// Deliver an encoded envelope over any operational link.
    pub async fn try_send_message(&self, frame: &Bytes) -> Option<Arc<Link>> {
        self.try_send_with(|link| {
            let frame = frame.clone();
            async move { link.send(frame).await.is_ok() }
        })
        .await
    }

    // ── Outbound requests ───────────────────────────────────────────────

    fn next_request_id(&self) -> RequestId {
        loop {
            let raw = self.next_request_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if raw != 0 {
                return RequestId::new(raw);
            }
        }
    }

    /// Send a request to the peer.
    ///
    /// The operation is registered before the envelope is sent so a fast
    /// reply always finds it. Fails with [`TransportError::Unavailable`] when
    /// no link accepts the envelope.
    pub async fn submit(&self, request: RemoteRequest) -> Result<RemoteCall, TransportError> {
        if !self.is_running() {
            return Err(TransportError::SessionClosed);
        }
        let kind = request.kind();
        let (payload, updates) = match request {
            RemoteRequest::Control { info_levels } => (
                Payload::ControlRequest(ControlRequest {
                    info_levels,
                    local_request_ids: self.local_ids(),
                    remote_request_ids: self.remote_ids(),
                }),
                None,
            ),
            RemoteRequest::Operation { request, updates } => (Payload::Request(request), updates),
        };

        let (op, rx) = loop {
            let id = self.next_request_id();
            if let Entry::Vacant(slot) = self.remote_ops.entry(id) {
                let (op, rx) = RemoteOperation::new(
                    id,
                    kind,
                    updates,
                    self.me.clone(),
                    self.config.inconsistency_threshold,
                );
                let _ = slot.insert(Arc::clone(&op));
                break (op, rx);
            }
        };
        let id = op.request_id();
        let label = match kind {
            RemoteKind::Control => "control",
            RemoteKind::Operation(_) => "operation",
        };
        metrics::counter!(REMOTE_OPERATIONS_TOTAL, "kind" => label).increment(1);

        let frame = match codec::encode(&Envelope::new(id, payload)) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = op.fail(e.clone().into());
                return Err(e.into());
            }
        };
        if self.try_send_message(&frame).await.is_none() {
            let _ = op.fail(TransportError::Unavailable);
            return Err(TransportError::Unavailable);
        }
        op.mark_sent();
        debug!(session_id = %self.id, request_id = %id, "request submitted");
        Ok(RemoteCall::new(id, rx, self.me.clone()))
    }

    /// Stop waiting for an outbound request and tell the peer, best effort.
    pub async fn cancel_remote(&self, id: RequestId) -> bool {
        let Some(op) = self.remote_operation(id) else {
            return false;
        };
        if !op.cancelled() {
            return false;
        }
        match codec::encode(&Envelope::cancel(id)) {
            Ok(frame) => {
                if self.try_send_message(&frame).await.is_none() {
                    debug!(session_id = %self.id, request_id = %id, "cancel notice not delivered");
                }
            }
            Err(e) => warn!(request_id = %id, error = %e, "failed to encode cancel notice"),
        }
        true
    }

    /// Route a reply from the peer to the outbound operation it answers.
    /// Returns whether the operation reached a terminal state.
    pub fn receive_response(&self, link: &Link, id: RequestId, payload: Payload) -> bool {
        match self.remote_operation(id) {
            Some(op) => op.handle_incoming_message(link, payload),
            None => {
                debug!(
                    session_id = %self.id,
                    request_id = %id,
                    payload = payload.name(),
                    "reply for unknown request"
                );
                false
            }
        }
    }

    pub(crate) fn forget_remote(&self, id: RequestId, op: &RemoteOperation) {
        let _ = self
            .remote_ops
            .remove_if(&id, |_, held| std::ptr::eq(Arc::as_ptr(held), op));
    }

    // ── Inbound requests ────────────────────────────────────────────────

    /// Register an inbound request. A duplicate id is a protocol violation.
    pub fn receive_request(
        &self,
        id: RequestId,
        request: &OperationRequest,
    ) -> Result<Arc<LocalOperation>, TransportError> {
        if !self.is_running() {
            return Err(TransportError::SessionClosed);
        }
        if id.is_session_scoped() {
            return Err(TransportError::ProtocolViolation(
                "request id 0 is reserved".into(),
            ));
        }
        match self.local_ops.entry(id) {
            Entry::Occupied(_) => Err(TransportError::ProtocolViolation(format!(
                "duplicate request id {id}"
            ))),
            Entry::Vacant(slot) => {
                let op = LocalOperation::new(
                    id,
                    request.kind,
                    self.me.clone(),
                    self.config.inconsistency_threshold,
                );
                let _ = slot.insert(Arc::clone(&op));
                metrics::counter!(LOCAL_OPERATIONS_TOTAL, "kind" => request.kind.as_str()).increment(1);
                Ok(op)
            }
        }
    }

    /// The peer stopped waiting for an inbound request.
    pub fn receive_cancel(&self, id: RequestId) {
        if let Some(op) = self.local_operation(id) {
            let _ = op.cancel();
        }
    }

    pub(crate) fn forget_local(&self, id: RequestId, op: &LocalOperation) {
        let _ = self
            .local_ops
            .remove_if(&id, |_, held| std::ptr::eq(Arc::as_ptr(held), op));
    }

    // ── Consistency ─────────────────────────────────────────────────────

    /// Reconcile outstanding operations against the peer's advertised ids.
    ///
    /// An outbound operation the peer does not list among its local ones,
    /// or an inbound one it does not list among its remote ones, records a
    /// miss; a listed one starts its streak over.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub fn process_control_request(&self, request: &ControlRequest) {
        self.touch();
        let peer_local: HashSet<RequestId> = request.local_request_ids.iter().copied().collect();
        let peer_remote: HashSet<RequestId> = request.remote_request_ids.iter().copied().collect();

        for op in self.remote_snapshot() {
            if op.is_control() {
                continue;
            }
            if peer_local.contains(&op.request_id()) {
                op.consistent();
            } else {
                let _ = op.inconsistent();
            }
        }
        for op in self.local_snapshot() {
            if peer_remote.contains(&op.request_id()) {
                op.consistent();
            } else {
                let _ = op.inconsistent();
            }
        }
    }

    /// Periodic health and consistency tick. Returns whether the session
    /// still has a reason to exist.
    ///
    /// A session without operational links that has been idle past the
    /// inactivity timeout is closed once nothing is outstanding; outstanding
    /// operations are driven towards failure one miss per tick meanwhile.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn check_is_active(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let operational = self.is_operational();
        let idle = self.last_activity.lock().elapsed() > self.config.inactivity_timeout;

        if idle && !operational {
            if !self.has_outstanding() {
                info!("closing inactive session");
                self.close();
                return false;
            }
            for op in self.local_snapshot() {
                let _ = op.inconsistent();
            }
            for op in self.remote_snapshot() {
                let _ = op.inconsistent();
            }
            return self.has_outstanding();
        }

        for op in self.local_snapshot() {
            let _ = op.check();
        }
        for op in self.remote_snapshot() {
            // control exchanges are never advertised, so a lost reply only
            // shows up here
            let _ = if op.is_control() {
                op.inconsistent()
            } else {
                op.check()
            };
        }

        if operational {
            if let Err(e) = self.submit(RemoteRequest::control(Vec::new())).await {
                debug!(error = %e, "consistency request not sent");
            }
        }
        operational || self.has_outstanding()
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// A principal is going away. Its links leave the session; when no
    /// principal is left, outstanding work is shut down.
    pub fn principal_is_shutting_down(&self, principal: &str) {
        if !self.principals.lock().remove(principal) {
            return;
        }
        let leaving: Vec<Arc<Link>> = {
            let mut links = self.links.write();
            let (leaving, staying): (Vec<_>, Vec<_>) =
                links.drain(..).partition(|e| e.principal == principal);
            *links = staying;
            leaving.into_iter().map(|e| e.link).collect()
        };
        for link in leaving {
            link.close();
        }
        if self.principals.lock().is_empty() {
            self.shutdown();
        }
    }

    /// Cancel every inbound operation, fail every outbound one and drop the
    /// peer's capability snapshot.
    pub fn shutdown(&self) {
        for op in self.local_snapshot() {
            let _ = op.cancel();
        }
        for op in self.remote_snapshot() {
            let _ = op.fail(TransportError::SessionClosed);
        }
        *self.peer_info.write() = None;
        debug!(session_id = %self.id, "session shut down");
    }

    /// Close the session. Only the first call has an effect.
    pub fn close(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.principals.lock().clear();
        self.shutdown();
        let links = std::mem::take(&mut *self.links.write());
        for entry in links {
            entry.link.close();
        }
        let _ = self.context.lock().take();
        metrics::counter!(SESSIONS_CLOSED_TOTAL).increment(1);
        info!(session_id = %self.id, "session closed");

        let listeners = std::mem::take(&mut *self.close_listeners.lock());
        for listener in listeners {
            listener(self);
        }
    }

    /// Register a listener for [`close`](Self::close). Runs immediately if
    /// the session is already closed.
    pub fn on_close(&self, listener: impl FnOnce(&Session) + Send + 'static) {
        let mut listeners = self.close_listeners.lock();
        if self.is_running() {
            listeners.push(Box::new(listener));
        } else {
            drop(listeners);
            listener(self);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("links", &self.link_count())
            .field("local_ops", &self.local_ops.len())
            .field("remote_ops", &self.remote_ops.len())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationState;
    use crate::testing::{bound_session, echo_principal, recv_envelope, test_config};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tether_core::{OperationKind, OperationResponse};

    fn get_request() -> RemoteRequest {
        RemoteRequest::operation(OperationRequest::new(OperationKind::Get, json!({})))
    }

    fn peer_lists(local: &[u64], remote: &[u64]) -> ControlRequest {
        ControlRequest {
            info_levels: Vec::new(),
            local_request_ids: local.iter().copied().map(RequestId::new).collect(),
            remote_request_ids: remote.iter().copied().map(RequestId::new).collect(),
        }
    }

    #[tokio::test]
    async fn handshake_registers_link_and_principal() {
        let session = Session::new(SessionId::from("S1"), test_config());
        let principal = echo_principal("idm");
        let (link, _rx) = Link::channel(crate::spi::Credentials::Anonymous, 8);

        let context = session
            .handshake(&principal, &link, &Handshake::new(SessionId::from("S1")))
            .unwrap();
        assert_eq!(context.principal().name(), "idm");
        assert!(link.context().is_some());
        assert_eq!(session.link_count(), 1);
        assert_eq!(session.principals(), vec!["idm".to_string()]);
    }

    #[tokio::test]
    async fn handshake_with_wrong_session_id_is_rejected() {
        let session = Session::new(SessionId::from("S1"), test_config());
        let principal = echo_principal("idm");
        let (link, _rx) = Link::channel(crate::spi::Credentials::Anonymous, 8);

        let result = session.handshake(&principal, &link, &Handshake::new(SessionId::from("S2")));
        assert_matches!(result, Err(TransportError::HandshakeRejected(_)));
        assert_eq!(session.link_count(), 0);
        assert!(link.context().is_none());
    }

    #[tokio::test]
    async fn bound_link_cannot_join_a_second_session() {
        let s1 = Session::new(SessionId::from("S1"), test_config());
        let s2 = Session::new(SessionId::from("S2"), test_config());
        let principal = echo_principal("idm");
        let (link, _rx) = Link::channel(crate::spi::Credentials::Anonymous, 8);

        let _ = s1
            .handshake(&principal, &link, &Handshake::new(SessionId::from("S1")))
            .unwrap();
        let again = s2
            .handshake(&principal, &link, &Handshake::new(SessionId::from("S2")))
            .unwrap();

        assert_eq!(again.session().unwrap().id(), &SessionId::from("S1"));
        assert_eq!(s1.link_count(), 1);
        assert_eq!(s2.link_count(), 0);
        assert!(s2.principals().is_empty());
    }

    #[test]
    fn handshake_racing_close_never_leaves_a_link_behind() {
        for _ in 0..200 {
            let session = Session::new(SessionId::from("S1"), test_config());
            let principal = echo_principal("idm");
            let (link, _rx) = Link::channel(crate::spi::Credentials::Anonymous, 8);
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let closer = {
                let session = Arc::clone(&session);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let _ = barrier.wait();
                    session.close();
                })
            };
            let _ = barrier.wait();
            let _ = session.handshake(&principal, &link, &Handshake::new(SessionId::from("S1")));
            closer.join().unwrap();

            assert!(!session.is_running());
            assert_eq!(session.link_count(), 0);
            assert!(link.context().is_none() || !link.is_operational());
        }
    }

    #[tokio::test]
    async fn first_link_requests_peer_info() {
        let config = SessionConfig {
            info_request_attempts: 1,
            ..test_config()
        };
        let session = Session::new(SessionId::from("S1"), config);
        let principal = echo_principal("idm");
        let (link, mut rx) = Link::channel(crate::spi::Credentials::Anonymous, 8);
        let _ = session
            .handshake(&principal, &link, &Handshake::new(SessionId::from("S1")))
            .unwrap();

        let envelope = recv_envelope(&mut rx).await;
        assert_matches!(
            envelope.payload,
            Payload::ControlRequest(req) if req.wants(InfoLevel::ConnectorInfo)
        );
    }

    #[tokio::test]
    async fn closed_link_leaves_session() {
        let (session, links) = bound_session("S1", 2);
        links[0].0.close();
        assert_eq!(session.link_count(), 1);
        assert!(session.is_running());
        assert!(session.is_operational());
    }

    #[tokio::test]
    async fn try_send_skips_dead_links() {
        let (session, mut links) = bound_session("S1", 3);
        links[1].0.close();
        for _ in 0..4 {
            assert!(session.try_send_message(&Bytes::from_static(b"{}")).await.is_some());
        }
        let count = |rx: &mut tokio::sync::mpsc::Receiver<crate::link::Frame>| {
            let mut n = 0;
            while rx.try_recv().is_ok() {
                n += 1;
            }
            n
        };
        assert_eq!(count(&mut links[0].1) + count(&mut links[2].1), 4);
    }

    #[tokio::test]
    async fn try_send_without_links_is_none() {
        let session = Session::new(SessionId::from("S1"), test_config());
        assert!(session.try_send_message(&Bytes::from_static(b"{}")).await.is_none());
        assert_matches!(session.submit(get_request()).await, Err(TransportError::Unavailable));
        assert!(session.remote_ids().is_empty());
    }

    #[tokio::test]
    async fn request_ids_skip_zero_and_are_unique() {
        let (session, _links) = bound_session("S1", 1);
        session.next_request_id.store(u64::MAX, Ordering::Relaxed);
        let a = session.next_request_id();
        assert_eq!(a, RequestId::new(1));
        let b = session.next_request_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn duplicate_inbound_id_is_protocol_violation() {
        let (session, _links) = bound_session("S1", 1);
        let request = OperationRequest::new(OperationKind::Create, json!({}));
        let _ = session.receive_request(RequestId::new(4), &request).unwrap();
        assert_matches!(
            session.receive_request(RequestId::new(4), &request),
            Err(TransportError::ProtocolViolation(_))
        );
        assert_matches!(
            session.receive_request(RequestId::SESSION, &request),
            Err(TransportError::ProtocolViolation(_))
        );
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_to_their_own_replies() {
        let (session, links) = bound_session("S1", 2);
        let mut calls = Vec::new();
        for n in 0..20 {
            let request = OperationRequest::new(OperationKind::Get, json!({ "n": n }));
            calls.push(session.submit(RemoteRequest::operation(request)).await.unwrap());
        }

        // answer in reverse order, alternating links
        let mut ids: Vec<RequestId> = calls.iter().map(RemoteCall::request_id).collect();
        ids.reverse();
        for (i, id) in ids.iter().enumerate() {
            let reply = OperationResponse::complete(OperationKind::Get, json!({ "id": id.get() }));
            let link = &links[i % 2].0;
            assert!(session.receive_response(link, *id, Payload::Response(reply)));
        }
        for call in calls {
            let id = call.request_id();
            let reply = call.outcome().await.unwrap().into_operation().unwrap();
            assert_eq!(reply.body, json!({ "id": id.get() }));
        }
    }

    #[tokio::test]
    async fn remote_operation_fails_after_three_unmatched_ticks() {
        let (session, _links) = bound_session("S1", 1);
        let call = session.submit(get_request()).await.unwrap();
        let id = call.request_id().get();
        let op = session.remote_operation(call.request_id()).unwrap();

        session.process_control_request(&peer_lists(&[], &[]));
        session.process_control_request(&peer_lists(&[], &[]));
        assert_eq!(op.state(), OperationState::Pending);
        session.process_control_request(&peer_lists(&[], &[]));
        assert_eq!(op.state(), OperationState::Failed);
        assert_matches!(call.outcome().await, Err(TransportError::InconsistencyExhausted));
        assert!(!session.remote_ids().contains(&RequestId::new(id)));
    }

    #[tokio::test]
    async fn lost_control_reply_is_retired_by_ticks() {
        let (session, _links) = bound_session("S1", 1);
        let call = session.submit(RemoteRequest::control(Vec::new())).await.unwrap();
        let op = session.remote_operation(call.request_id()).unwrap();
        assert!(op.is_control());

        assert!(session.check_is_active().await);
        assert!(session.check_is_active().await);
        assert_eq!(op.misses(), 2);
        assert_eq!(op.state(), OperationState::Pending);

        assert!(session.check_is_active().await);
        assert_eq!(op.state(), OperationState::Failed);
        assert_matches!(call.outcome().await, Err(TransportError::InconsistencyExhausted));
    }

    #[tokio::test]
    async fn advertised_twice_then_missing_once_is_not_fatal() {
        let (session, _links) = bound_session("S1", 1);
        let call = session.submit(get_request()).await.unwrap();
        let id = call.request_id().get();
        let op = session.remote_operation(call.request_id()).unwrap();

        session.process_control_request(&peer_lists(&[id], &[]));
        session.process_control_request(&peer_lists(&[id], &[]));
        assert_eq!(op.misses(), 0);
        session.process_control_request(&peer_lists(&[], &[]));
        assert_eq!(op.misses(), 1);
        assert_eq!(op.state(), OperationState::Pending);

        session.process_control_request(&peer_lists(&[], &[]));
        session.process_control_request(&peer_lists(&[], &[]));
        assert_eq!(op.state(), OperationState::Failed);
    }

    #[tokio::test]
    async fn local_operation_cancelled_after_three_unmatched_ticks() {
        let (session, _links) = bound_session("S1", 1);
        let request = OperationRequest::new(OperationKind::Update, json!({}));
        let op = session.receive_request(RequestId::new(42), &request).unwrap();

        session.process_control_request(&peer_lists(&[], &[42]));
        session.process_control_request(&peer_lists(&[], &[]));
        session.process_control_request(&peer_lists(&[], &[]));
        assert_eq!(op.state(), OperationState::Pending);
        session.process_control_request(&peer_lists(&[], &[]));
        assert_eq!(op.state(), OperationState::Cancelled);
        assert!(session.local_ids().is_empty());
    }

    #[tokio::test]
    async fn control_exchanges_are_not_advertised() {
        let (session, _links) = bound_session("S1", 1);
        let _control = session.submit(RemoteRequest::control(Vec::new())).await.unwrap();
        let _op = session.submit(get_request()).await.unwrap();
        assert_eq!(session.remote_ids().len(), 1);
    }

    #[tokio::test]
    async fn tick_sends_consistency_request_with_id_lists() {
        let (session, mut links) = bound_session("S1", 1);
        let request = OperationRequest::new(OperationKind::Update, json!({}));
        let _ = session.receive_request(RequestId::new(42), &request).unwrap();

        assert!(session.check_is_active().await);
        let envelope = recv_envelope(&mut links[0].1).await;
        assert_matches!(
            envelope.payload,
            Payload::ControlRequest(req) if req.local_request_ids == vec![RequestId::new(42)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_linkless_session_closes() {
        let (session, links) = bound_session("S1", 1);
        links[0].0.close();
        assert!(!session.check_is_active().await);
        // not idle yet, but nothing left to do
        assert!(session.is_running());

        tokio::time::advance(Duration::from_secs(13 * 60)).await;
        assert!(!session.check_is_active().await);
        assert!(!session.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_keeps_outstanding_work_until_retired() {
        let (session, links) = bound_session("S1", 1);
        let request = OperationRequest::new(OperationKind::Update, json!({}));
        let op = session.receive_request(RequestId::new(1), &request).unwrap();
        links[0].0.close();
        tokio::time::advance(Duration::from_secs(13 * 60)).await;

        assert!(session.check_is_active().await);
        assert!(session.check_is_active().await);
        assert!(!session.check_is_active().await);
        assert_eq!(op.state(), OperationState::Cancelled);
        assert!(!session.check_is_active().await);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn close_is_idempotent_under_concurrency() {
        let (session, links) = bound_session("S1", 2);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        session.on_close(move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move { session.close() }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!session.is_running());
        assert!(links.iter().all(|(link, _)| !link.is_operational()));
        assert_eq!(session.link_count(), 0);
    }

    #[tokio::test]
    async fn last_principal_leaving_shuts_down_work() {
        let (session, _links) = bound_session("S1", 1);
        let request = OperationRequest::new(OperationKind::Update, json!({}));
        let local = session.receive_request(RequestId::new(42), &request).unwrap();
        let call = session.submit(get_request()).await.unwrap();

        session.principal_is_shutting_down("idm");
        assert_eq!(local.state(), OperationState::Cancelled);
        assert_matches!(call.outcome().await, Err(TransportError::SessionClosed));
        assert!(session.local_ids().is_empty());
        assert!(session.remote_ids().is_empty());
        assert_eq!(session.link_count(), 0);
    }

    #[tokio::test]
    async fn other_principal_keeps_session_alive() {
        let (session, _links) = bound_session("S1", 1);
        let guest = echo_principal("guest");
        let (link, _rx) = Link::channel(crate::spi::Credentials::Anonymous, 8);
        let _ = session
            .handshake(&guest, &link, &Handshake::new(SessionId::from("S1")))
            .unwrap();
        let request = OperationRequest::new(OperationKind::Update, json!({}));
        let local = session.receive_request(RequestId::new(42), &request).unwrap();

        session.principal_is_shutting_down("idm");
        assert_eq!(local.state(), OperationState::Pending);
        assert_eq!(session.link_count(), 1);
    }

    #[tokio::test]
    async fn response_racing_close_fails_cleanly() {
        let (session, _links) = bound_session("S1", 2);
        let request = OperationRequest::new(OperationKind::Create, json!({}));
        let op = session.receive_request(RequestId::new(42), &request).unwrap();

        let sender = {
            let op = Arc::clone(&op);
            tokio::spawn(async move {
                op.handle_result(OperationResponse::complete(OperationKind::Create, json!({})))
                    .await
            })
        };
        let closer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.close() })
        };
        let _delivered = sender.await.unwrap();
        closer.await.unwrap();
        assert!(op.state().is_terminal());
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn close_listener_added_after_close_runs() {
        let session = Session::new(SessionId::from("S1"), test_config());
        session.close();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        session.on_close(move |_| flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }
}
