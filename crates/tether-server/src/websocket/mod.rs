//! WebSocket plumbing: credentials, the socket pump and the dialing side.

pub mod auth;
pub mod client;
pub mod connection;
