//! # tether-server
//!
//! WebSocket carriage for tether sessions.
//!
//! - **Listener**: Axum `/ws` upgrade with a connection cap, plus `/health` and `/metrics`
//! - **Dialer**: tungstenite client that opens links to a remote listener
//! - **Pump**: one task per socket feeding the [`tether_rpc::Endpoint`] and running heartbeats
//! - **Shutdown**: coordinated cancellation of listener, pumps and sessions

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{Result, ServerError};
pub use health::HealthResponse;
pub use server::TetherServer;
pub use shutdown::ShutdownCoordinator;
pub use websocket::client::{ClientLink, connect};
