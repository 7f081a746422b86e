//! Authenticated identities.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tether_core::{Handshake, SessionId, TransportError};
use tracing::{debug, info};

use crate::link::Link;
use crate::operation::{RemoteCall, RemoteRequest};
use crate::registry::SessionRegistry;
use crate::session::{OperationContext, Session};
use crate::spi::Dispatcher;

type CloseListener = Box<dyn FnOnce(&Principal) + Send>;

/// An authenticated identity, bound to the sessions its links joined.
pub struct Principal {
    name: String,
    dispatcher: Arc<dyn Dispatcher>,
    sessions: DashMap<SessionId, Weak<Session>>,
    running: AtomicBool,
    close_listeners: Mutex<Vec<CloseListener>>,
}

impl Principal {
    /// Create a principal whose inbound requests run on `dispatcher`.
    pub fn new(name: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            dispatcher,
            sessions: DashMap::new(),
            running: AtomicBool::new(true),
            close_listeners: Mutex::new(Vec::new()),
        })
    }

    /// Principal name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatcher for inbound requests.
    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Whether [`close`](Self::close) has not run yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Look up or create the advertised session and join `link` to it.
    pub fn handshake(
        self: &Arc<Self>,
        registry: &SessionRegistry,
        link: &Arc<Link>,
        message: &Handshake,
    ) -> Result<Arc<OperationContext>, TransportError> {
        if !self.is_running() {
            return Err(TransportError::HandshakeRejected(format!(
                "principal {} is shutting down",
                self.name
            )));
        }
        let session = registry.get_or_create(&message.session_id);
        let context = session.handshake(self, link, message)?;

        let id = session.id().clone();
        if self
            .sessions
            .insert(id.clone(), Arc::downgrade(&session))
            .is_none()
        {
            let me = Arc::downgrade(self);
            session.on_close(move |_| {
                if let Some(principal) = me.upgrade() {
                    let _ = principal.sessions.remove(&id);
                }
            });
        }
        Ok(context)
    }

    /// Live sessions this principal has joined.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter_map(|e| e.value().upgrade())
            .filter(|s| s.is_running())
            .collect()
    }

    /// Whether any joined session has an operational link.
    pub fn is_operational(&self) -> bool {
        self.sessions().iter().any(|s| s.is_operational())
    }

    /// Submit a request on the first session with an operational link.
    pub async fn try_submit(&self, request: RemoteRequest) -> Result<RemoteCall, TransportError> {
        let session = self
            .sessions()
            .into_iter()
            .find(|s| s.is_operational())
            .ok_or(TransportError::Unavailable)?;
        session.submit(request).await
    }

    /// Leave every joined session. Only the first call has an effect.
    pub fn close(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter_map(|e| e.value().upgrade())
            .collect();
        self.sessions.clear();
        for session in sessions {
            session.principal_is_shutting_down(&self.name);
        }
        info!(principal = %self.name, "principal closed");

        let listeners = std::mem::take(&mut *self.close_listeners.lock());
        for listener in listeners {
            listener(self);
        }
    }

    /// Register a listener for [`close`](Self::close). Runs immediately if
    /// the principal is already closed.
    pub fn on_close(&self, listener: impl FnOnce(&Principal) + Send + 'static) {
        let mut listeners = self.close_listeners.lock();
        if self.is_running() {
            listeners.push(Box::new(listener));
        } else {
            drop(listeners);
            debug!(principal = %self.name, "close listener added after close");
            listener(self);
        }
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::Credentials;
    use crate::testing::{echo_dispatcher, test_config};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tether_core::{OperationKind, OperationRequest};

    fn join(
        registry: &SessionRegistry,
        principal: &Arc<Principal>,
        session: &str,
    ) -> (Arc<Link>, tokio::sync::mpsc::Receiver<crate::link::Frame>) {
        let (link, rx) = Link::channel(Credentials::Anonymous, 16);
        let _ = principal
            .handshake(registry, &link, &Handshake::new(SessionId::from(session)))
            .unwrap();
        (link, rx)
    }

    #[tokio::test]
    async fn handshake_creates_and_tracks_session() {
        let registry = SessionRegistry::new(test_config());
        let principal = registry.principal("idm", echo_dispatcher());
        let (_link, _rx) = join(&registry, &principal, "S1");

        assert_eq!(principal.sessions().len(), 1);
        assert!(principal.is_operational());
        assert!(registry.get(&SessionId::from("S1")).is_some());
    }

    #[tokio::test]
    async fn try_submit_uses_operational_session() {
        let registry = SessionRegistry::new(test_config());
        let principal = registry.principal("idm", echo_dispatcher());
        let (link, _rx) = join(&registry, &principal, "S1");

        let request = RemoteRequest::operation(OperationRequest::new(OperationKind::Test, json!({})));
        assert!(principal.try_submit(request).await.is_ok());

        link.close();
        let request = RemoteRequest::operation(OperationRequest::new(OperationKind::Test, json!({})));
        assert_matches!(principal.try_submit(request).await, Err(TransportError::Unavailable));
    }

    #[tokio::test]
    async fn close_leaves_sessions_and_fires_listeners_once() {
        let registry = SessionRegistry::new(test_config());
        let principal = registry.principal("idm", echo_dispatcher());
        let (link, _rx) = join(&registry, &principal, "S1");
        let session = registry.get(&SessionId::from("S1")).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        principal.on_close(move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        principal.close();
        principal.close();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!link.is_operational());
        assert!(session.principals().is_empty());
        assert!(principal.sessions().is_empty());
    }

    #[tokio::test]
    async fn closed_principal_cannot_handshake() {
        let registry = SessionRegistry::new(test_config());
        let principal = registry.principal("idm", echo_dispatcher());
        principal.close();
        let (link, _rx) = Link::channel(Credentials::Anonymous, 4);
        assert_matches!(
            principal.handshake(&registry, &link, &Handshake::new(SessionId::from("S1"))),
            Err(TransportError::HandshakeRejected(_))
        );
    }
}
