//! Owner of every live session and principal.
//!
//! One registry is created per endpoint (or shared by a client and a server
//! in the same process) and torn down with [`SessionRegistry::shutdown`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tether_core::SessionId;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::metrics::SESSIONS_ACTIVE;
use crate::principal::Principal;
use crate::session::Session;
use crate::spi::Dispatcher;

/// Sessions keyed by id, principals keyed by name.
#[derive(Debug)]
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    principals: DashMap<String, Arc<Principal>>,
    closed: AtomicBool,
}

impl SessionRegistry {
    /// Empty registry creating sessions with `config`.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            principals: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Tuning applied to new sessions.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The session for `id`, created if absent or closed.
    ///
    /// Concurrent callers for the same new id all get the same session.
    pub fn get_or_create(&self, id: &SessionId) -> Arc<Session> {
        let session = match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_running() {
                    Arc::clone(slot.get())
                } else {
                    let session = Session::new(id.clone(), self.config.clone());
                    let _ = slot.insert(Arc::clone(&session));
                    session
                }
            }
            Entry::Vacant(slot) => {
                let session = Session::new(id.clone(), self.config.clone());
                let _ = slot.insert(Arc::clone(&session));
                debug!(session_id = %id, "session created");
                session
            }
        };
        self.record_gauge();
        session
    }

    /// The session for `id`, if present.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Remove the session for `id` without closing it.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, s)| s);
        self.record_gauge();
        removed
    }

    /// Number of sessions held.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is held.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// The principal named `name`, created with `dispatcher` if absent or
    /// closed.
    pub fn principal(&self, name: &str, dispatcher: Arc<dyn Dispatcher>) -> Arc<Principal> {
        match self.principals.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_running() {
                    Arc::clone(slot.get())
                } else {
                    let principal = Principal::new(name, dispatcher);
                    let _ = slot.insert(Arc::clone(&principal));
                    principal
                }
            }
            Entry::Vacant(slot) => Arc::clone(slot.insert(Principal::new(name, dispatcher)).value()),
        }
    }

    /// Close and forget a principal.
    pub fn close_principal(&self, name: &str) -> bool {
        match self.principals.remove(name) {
            Some((_, principal)) => {
                principal.close();
                true
            }
            None => false,
        }
    }

    /// Run one health tick on every session and evict the ones with no
    /// reason to exist. Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let sessions = self.sessions();
        let verdicts = join_all(sessions.iter().map(|s| s.check_is_active())).await;

        let mut evicted = 0;
        for (session, active) in sessions.iter().zip(verdicts) {
            if active {
                continue;
            }
            session.close();
            if self
                .sessions
                .remove_if(session.id(), |_, held| Arc::ptr_eq(held, session))
                .is_some()
            {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, remaining = self.sessions.len(), "sessions evicted");
        }
        self.record_gauge();
        evicted
    }

    /// Close every principal and session. Only the first call has an effect.
    pub fn shutdown(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let principals: Vec<Arc<Principal>> =
            self.principals.iter().map(|e| Arc::clone(e.value())).collect();
        self.principals.clear();
        for principal in principals {
            principal.close();
        }
        let sessions = self.sessions();
        self.sessions.clear();
        for session in &sessions {
            session.close();
        }
        self.record_gauge();
        info!(sessions = sessions.len(), "session registry shut down");
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_gauge(&self) {
        metrics::gauge!(SESSIONS_ACTIVE).set(self.sessions.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use crate::spi::Credentials;
    use crate::testing::{echo_dispatcher, test_config};
    use tether_core::Handshake;

    #[tokio::test]
    async fn concurrent_handshakes_yield_one_session() {
        let registry = Arc::new(SessionRegistry::new(test_config()));
        let mut tasks = Vec::new();
        let mut receivers = Vec::new();
        for n in 0..16 {
            let (link, rx) = Link::channel(Credentials::Anonymous, 8);
            receivers.push(rx);
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let principal = registry.principal(&format!("p{}", n % 2), echo_dispatcher());
                let context = principal
                    .handshake(&registry, &link, &Handshake::new(SessionId::from("S1")))
                    .unwrap();
                Arc::as_ptr(&context.session().unwrap()) as usize
            }));
        }
        let mut pointers = Vec::new();
        for task in tasks {
            pointers.push(task.await.unwrap());
        }
        pointers.dedup();
        assert_eq!(pointers.len(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&SessionId::from("S1")).unwrap().link_count(), 16);
    }

    #[tokio::test]
    async fn closed_session_is_replaced() {
        let registry = SessionRegistry::new(test_config());
        let first = registry.get_or_create(&SessionId::from("S1"));
        first.close();
        let second = registry.get_or_create(&SessionId::from("S1"));
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_running());
    }

    #[tokio::test]
    async fn sweep_evicts_dead_sessions() {
        let registry = SessionRegistry::new(test_config());
        let _idle = registry.get_or_create(&SessionId::from("S1"));
        let principal = registry.principal("idm", echo_dispatcher());
        let (link, _rx) = Link::channel(Credentials::Anonymous, 8);
        let _ = principal
            .handshake(&registry, &link, &Handshake::new(SessionId::from("S2")))
            .unwrap();

        assert_eq!(registry.sweep().await, 1);
        assert!(registry.get(&SessionId::from("S1")).is_none());
        assert!(registry.get(&SessionId::from("S2")).is_some());
    }

    #[tokio::test]
    async fn same_principal_is_reused_until_closed() {
        let registry = SessionRegistry::new(test_config());
        let a = registry.principal("idm", echo_dispatcher());
        let b = registry.principal("idm", echo_dispatcher());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.close_principal("idm"));
        let c = registry.principal("idm", echo_dispatcher());
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn shutdown_closes_everything_once() {
        let registry = SessionRegistry::new(test_config());
        let session = registry.get_or_create(&SessionId::from("S1"));
        let principal = registry.principal("idm", echo_dispatcher());
        registry.shutdown();
        registry.shutdown();
        assert!(!session.is_running());
        assert!(!principal.is_running());
        assert!(registry.is_empty());
    }
}
