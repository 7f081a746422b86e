//! Shared fixtures for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{
    Envelope, Handshake, OperationRequest, OperationResponse, RemoteFault, SessionId, codec,
};
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::link::{Frame, Link};
use crate::principal::Principal;
use crate::session::Session;
use crate::spi::{Credentials, Dispatcher, OperationScope};

/// Default tuning without the automatic capability request, so tests see
/// only the traffic they cause.
pub(crate) fn test_config() -> SessionConfig {
    SessionConfig {
        info_request_attempts: 0,
        ..SessionConfig::default()
    }
}

/// Answers every request with its own body.
pub(crate) struct Echo;

#[async_trait]
impl Dispatcher for Echo {
    async fn dispatch(
        &self,
        request: OperationRequest,
        _scope: OperationScope,
    ) -> Result<OperationResponse, RemoteFault> {
        Ok(OperationResponse::complete(request.kind, request.body))
    }
}

pub(crate) fn echo_dispatcher() -> Arc<dyn Dispatcher> {
    Arc::new(Echo)
}

pub(crate) fn echo_principal(name: &str) -> Arc<Principal> {
    Principal::new(name, echo_dispatcher())
}

/// A session with `links` handshaked links owned by principal `idm`.
pub(crate) fn bound_session(
    id: &str,
    links: usize,
) -> (Arc<Session>, Vec<(Arc<Link>, mpsc::Receiver<Frame>)>) {
    let session = Session::new(SessionId::from(id), test_config());
    let principal = echo_principal("idm");
    let handshake = Handshake::new(SessionId::from(id));
    let links = (0..links)
        .map(|_| {
            let (link, rx) = Link::channel(Credentials::Anonymous, 64);
            let _ = session.handshake(&principal, &link, &handshake).unwrap();
            (link, rx)
        })
        .collect();
    (session, links)
}

/// Next envelope queued on a link, skipping control frames.
pub(crate) async fn recv_envelope(rx: &mut mpsc::Receiver<Frame>) -> Envelope {
    loop {
        match rx.recv().await {
            Some(Frame::Binary(bytes)) => return codec::decode(&bytes).unwrap(),
            Some(_) => {}
            None => panic!("link queue closed before an envelope arrived"),
        }
    }
}
