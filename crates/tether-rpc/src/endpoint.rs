//! Inbound demultiplexer.
//!
//! The socket pump hands every received frame to [`Endpoint::on_message`],
//! which decodes it and routes it: handshakes bind the link to a session,
//! requests become local operations, replies resolve remote operations and
//! control traffic drives the consistency protocol.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tether_core::{
    ControlResponse, Envelope, Handshake, OperationRequest, Payload, RemoteFault, RequestId,
    SessionId, TransportError, codec,
};
use tracing::{debug, info, instrument, warn};

use crate::link::Link;
use crate::metrics::DECODE_FAILURES_TOTAL;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::spi::{Authenticator, Dispatcher, InfoProvider, NoInfo, SharedSecretAuthenticator};

/// Which side of the handshake this endpoint plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Opens links and sends the handshake request.
    Client,
    /// Accepts links, authenticates them and answers the handshake.
    Server,
}

/// Routes inbound frames for every link of one process side.
pub struct Endpoint {
    role: Role,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    authenticator: Arc<dyn Authenticator>,
    info: Arc<dyn InfoProvider>,
}

impl Endpoint {
    /// Endpoint with no info to share and an authenticator that rejects
    /// everyone.
    pub fn new(role: Role, registry: Arc<SessionRegistry>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            role,
            registry,
            dispatcher,
            authenticator: Arc::new(SharedSecretAuthenticator::default()),
            info: Arc::new(NoInfo),
        }
    }

    /// Replace the authenticator used for server-side handshakes.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Replace the provider answering capability requests.
    #[must_use]
    pub fn with_info_provider(mut self, info: Arc<dyn InfoProvider>) -> Self {
        self.info = info;
        self
    }

    /// Handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Registry owning this endpoint's sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Client side: ask the peer to bind `link` to `session_id`.
    pub async fn connect(&self, link: &Arc<Link>, session_id: &SessionId) -> Result<(), TransportError> {
        if self.role != Role::Client {
            return Err(TransportError::ProtocolViolation(
                "only a client endpoint initiates handshakes".into(),
            ));
        }
        let frame = codec::encode(&Envelope::handshake_request(Handshake::new(session_id.clone())))?;
        link.send(frame).await
    }

    /// Handle one inbound binary frame.
    #[instrument(skip_all, fields(link_id = %link.id()))]
    pub async fn on_message(&self, link: &Arc<Link>, frame: &[u8]) {
        let envelope = match codec::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::counter!(DECODE_FAILURES_TOTAL).increment(1);
                warn!(error = %e, len = frame.len(), "dropping undecodable frame");
                return;
            }
        };
        let Envelope {
            message_id,
            payload,
        } = envelope;
        match payload {
            Payload::HandshakeRequest(handshake) => {
                self.on_handshake_request(link, message_id, handshake).await;
            }
            Payload::HandshakeResponse(handshake) => self.on_handshake_response(link, &handshake),
            payload => self.on_session_message(link, message_id, payload).await,
        }
    }

    /// Ping from the peer.
    pub async fn on_ping(&self, link: &Arc<Link>, data: Bytes) {
        link.mark_alive();
        if let Err(e) = link.send_pong(data).await {
            debug!(link_id = %link.id(), error = %e, "pong not sent");
        }
    }

    /// Pong from the peer.
    pub fn on_pong(&self, link: &Arc<Link>) {
        link.mark_alive();
    }

    /// The socket behind `link` is gone.
    pub fn on_close(&self, link: &Arc<Link>) {
        link.close();
    }

    // ── Handshake ───────────────────────────────────────────────────────

    async fn on_handshake_request(&self, link: &Arc<Link>, message_id: RequestId, handshake: Handshake) {
        if self.role != Role::Server {
            warn!("handshake request received by a client endpoint, ignoring");
            return;
        }
        if let Some(context) = link.context() {
            // already bound: answer again with the bound session
            if let Some(session) = context.session() {
                let response = Envelope::handshake_response(message_id, Handshake::new(session.id().clone()));
                reply(link, &response).await;
            }
            return;
        }

        let Some(name) = self.authenticator.authenticate(link.credentials()).await else {
            warn!(session_id = %handshake.session_id, "handshake rejected: authentication failed");
            reject(link, message_id, RemoteFault::new("handshake", "authentication failed")).await;
            return;
        };

        // the answer is queued first so the client is bound before any
        // session traffic reaches it
        let response =
            Envelope::handshake_response(message_id, Handshake::new(handshake.session_id.clone()));
        reply(link, &response).await;

        let principal = self.registry.principal(&name, Arc::clone(&self.dispatcher));
        match principal.handshake(&self.registry, link, &handshake) {
            Ok(_) => info!(principal = %name, session_id = %handshake.session_id, "link bound"),
            Err(e) => {
                // the client already bound on the response above; the
                // exception tells it the session never took the link
                warn!(principal = %name, error = %e, "handshake failed");
                reject(link, message_id, RemoteFault::from(&e)).await;
            }
        }
    }

    fn on_handshake_response(&self, link: &Arc<Link>, handshake: &Handshake) {
        if self.role != Role::Client {
            warn!("handshake response received by a server endpoint, ignoring");
            return;
        }
        if link.context().is_some() {
            return;
        }
        let name = link.credentials().identity().unwrap_or("anonymous").to_string();
        let principal = self.registry.principal(&name, Arc::clone(&self.dispatcher));
        match principal.handshake(&self.registry, link, handshake) {
            Ok(_) => info!(session_id = %handshake.session_id, "link bound"),
            Err(e) => {
                warn!(error = %e, "handshake failed");
                link.close();
            }
        }
    }

    // ── Session traffic ─────────────────────────────────────────────────

    async fn on_session_message(&self, link: &Arc<Link>, message_id: RequestId, payload: Payload) {
        let Some(session) = link.context().and_then(|c| c.session()) else {
            self.on_unbound_message(link, message_id, &payload).await;
            return;
        };

        match payload {
            Payload::Request(request) => self.on_request(link, &session, message_id, request).await,
            Payload::Cancel => session.receive_cancel(message_id),
            Payload::ControlRequest(request) => {
                session.process_control_request(&request);
                let connector_info = if request.info_levels.is_empty() {
                    None
                } else {
                    self.info.snapshot(&request.info_levels)
                };
                let response = Envelope::new(
                    message_id,
                    Payload::ControlResponse(ControlResponse { connector_info }),
                );
                reply(link, &response).await;
            }
            Payload::Exception(fault) if self.role == Role::Client && message_id.is_session_scoped() => {
                warn!(%fault, "session refused by peer after binding");
                link.close();
            }
            payload @ (Payload::Response(_) | Payload::Exception(_) | Payload::ControlResponse(_)) => {
                let _ = session.receive_response(link, message_id, payload);
            }
            Payload::HandshakeRequest(_) | Payload::HandshakeResponse(_) => {
                debug!("handshake routed as session traffic, ignoring");
            }
        }
    }

    async fn on_request(
        &self,
        link: &Arc<Link>,
        session: &Arc<Session>,
        message_id: RequestId,
        request: OperationRequest,
    ) {
        match session.receive_request(message_id, &request) {
            Ok(op) => {
                let dispatcher = link
                    .context()
                    .map_or_else(|| Arc::clone(&self.dispatcher), |c| c.principal().dispatcher());
                let _ = tokio::spawn(op.execute(dispatcher, request));
            }
            Err(e) => {
                warn!(request_id = %message_id, error = %e, "request refused");
                reply(link, &Envelope::exception(message_id, RemoteFault::from(&e))).await;
            }
        }
    }

    async fn on_unbound_message(&self, link: &Arc<Link>, message_id: RequestId, payload: &Payload) {
        match payload {
            Payload::Request(_) | Payload::ControlRequest(_) => {
                warn!(request_id = %message_id, payload = payload.name(), "request before handshake");
                reply(link, &Envelope::exception(message_id, RemoteFault::handshake_required())).await;
            }
            Payload::Exception(fault) if self.role == Role::Client && message_id.is_session_scoped() => {
                warn!(%fault, "handshake rejected by peer");
                link.close();
            }
            other => debug!(payload = other.name(), "message before handshake, dropping"),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("role", &self.role)
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Answer a failed handshake and drop the link.
async fn reject(link: &Link, message_id: RequestId, fault: RemoteFault) {
    reply(link, &Envelope::exception(message_id, fault)).await;
    link.close();
}

/// Answer on the link the message arrived on; failures are logged only.
async fn reply(link: &Link, envelope: &Envelope) {
    let result = match codec::encode(envelope) {
        Ok(frame) => link.send(frame).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        debug!(
            link_id = %link.id(),
            request_id = %envelope.message_id,
            payload = envelope.payload.name(),
            error = %e,
            "reply not sent"
        );
    }
}
