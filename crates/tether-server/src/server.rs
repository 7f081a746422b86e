//! `TetherServer`: Axum WebSocket listener plus health and metrics routes.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tether_rpc::{
    Credentials, Dispatcher, Endpoint, InfoProvider, Link, Role, SessionConfig, SessionRegistry,
    SharedSecretAuthenticator, run_consistency_monitor,
};
use tether_settings::TetherSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::errors::Result;
use crate::health::{self, HealthResponse};
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_REJECTED_TOTAL,
};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::auth::credentials_from_headers;
use crate::websocket::connection::{Heartbeat, serve_link};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
    endpoint: Arc<Endpoint>,
    shutdown: Arc<ShutdownCoordinator>,
    connections: Arc<AtomicUsize>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

/// The tether WebSocket server.
pub struct TetherServer {
    config: ServerConfig,
    endpoint: Arc<Endpoint>,
    shutdown: Arc<ShutdownCoordinator>,
    connections: Arc<AtomicUsize>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl TetherServer {
    /// Serve `endpoint`, which should play [`Role::Server`].
    pub fn new(config: ServerConfig, endpoint: Endpoint) -> Self {
        if endpoint.role() != Role::Server {
            warn!("tether server built around a client endpoint; handshakes will be ignored");
        }
        Self {
            config,
            endpoint: Arc::new(endpoint),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Build the listener, registry and authenticator from loaded settings.
    pub fn from_settings(
        settings: &TetherSettings,
        dispatcher: Arc<dyn Dispatcher>,
        info: Arc<dyn InfoProvider>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(SessionConfig::from(&settings.session)));
        let endpoint = Endpoint::new(Role::Server, registry, dispatcher)
            .with_authenticator(Arc::new(SharedSecretAuthenticator::from(&settings.auth)))
            .with_info_provider(info);
        Self::new(ServerConfig::from(settings), endpoint)
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::new(self.config.clone()),
            endpoint: Arc::clone(&self.endpoint),
            shutdown: Arc::clone(&self.shutdown),
            connections: Arc::clone(&self.connections),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and start serving, together with the
    /// consistency monitor. Both stop when shutdown starts.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let registry = Arc::clone(self.endpoint.registry());
        let interval = registry.config().control_interval;
        let serve_token = self.shutdown.token();
        let monitor_token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { serve_token.cancelled().await })
                .into_future();
            let monitor = run_consistency_monitor(registry, interval, monitor_token);
            let (served, ()) = tokio::join!(serve, monitor);
            if let Err(e) = served {
                error!(error = %e, "listener failed");
            }
        });
        info!(%addr, "tether server listening");
        Ok((addr, handle))
    }

    /// Stop accepting, close every session and wait for `handles`.
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown
            .graceful_shutdown(self.endpoint.registry(), handles, None)
            .await;
    }

    /// The endpoint routing inbound frames.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open WebSocket links.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

// ── Connection cap ──────────────────────────────────────────────────────

/// One reserved connection; released on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let _ = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        let slot = Self(Arc::clone(counter));
        slot.record();
        Some(slot)
    }

    #[allow(clippy::cast_precision_loss)]
    fn record(&self) {
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(self.0.load(Ordering::Acquire) as f64);
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
        self.record();
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        metrics::counter!(WS_REJECTED_TOTAL, "reason" => "draining").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    let Some(slot) = ConnectionSlot::acquire(&state.connections, state.config.max_connections)
    else {
        metrics::counter!(WS_REJECTED_TOTAL, "reason" => "limit").increment(1);
        warn!(max = state.config.max_connections, "connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };
    let credentials = credentials_from_headers(&headers);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, credentials, state, slot))
}

async fn serve_socket(socket: WebSocket, credentials: Credentials, state: AppState, slot: ConnectionSlot) {
    metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
    let (link, frames) = Link::channel(credentials, state.config.send_queue);
    info!(link_id = %link.id(), "link accepted");
    let heartbeat = Heartbeat {
        interval: state.config.heartbeat_interval(),
        timeout: state.config.heartbeat_timeout(),
    };
    serve_link(
        socket,
        link,
        frames,
        Arc::clone(&state.endpoint),
        heartbeat,
        state.shutdown.token(),
    )
    .await;
    metrics::counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    drop(slot);
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.load(Ordering::Acquire),
        state.endpoint.registry().len(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
