//! Dialing side: open a link to a remote tether server.

use std::sync::Arc;

use tether_core::SessionId;
use tether_rpc::{Credentials, Endpoint, Link};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::auth::authorization_header;
use super::connection::{Heartbeat, serve_link};
use crate::config::ServerConfig;
use crate::errors::{Result, ServerError};

/// A dialed link and the task pumping its socket.
#[derive(Debug)]
pub struct ClientLink {
    /// The link, joined to the endpoint once the server answers the
    /// handshake (see [`Link::bound`]).
    pub link: Arc<Link>,
    /// Socket pump; finishes when the link closes.
    pub task: JoinHandle<()>,
}

/// Dial `url`, start pumping and send the handshake for `session_id`.
///
/// Returns as soon as the handshake is queued; await [`Link::bound`] to know
/// whether the server accepted it.
pub async fn connect(
    url: &str,
    credentials: Credentials,
    session_id: &SessionId,
    endpoint: Arc<Endpoint>,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Result<ClientLink> {
    let mut request = url.into_client_request()?;
    if let Some(value) = authorization_header(&credentials) {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
        let _ = request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (socket, _response) = connect_async(request).await?;
    let (link, frames) = Link::channel(credentials, config.send_queue);
    info!(%url, link_id = %link.id(), "link dialed");

    let heartbeat = Heartbeat {
        interval: config.heartbeat_interval(),
        timeout: config.heartbeat_timeout(),
    };
    let task = tokio::spawn(serve_link(
        socket,
        Arc::clone(&link),
        frames,
        Arc::clone(&endpoint),
        heartbeat,
        cancel,
    ));

    if let Err(e) = endpoint.connect(&link, session_id).await {
        link.close();
        return Err(e.into());
    }
    Ok(ClientLink { link, task })
}
