//! # tether-rpc
//!
//! Session multiplexing over groups of physical links.
//!
//! - **Links**: one per socket, with a bounded outbound queue and close listeners
//! - **Sessions**: a shared id binding many links, with round-robin and sticky delivery
//! - **Operations**: inbound (`LocalOperation`) and outbound (`RemoteOperation`) lifecycles
//! - **Consistency**: periodic exchange of outstanding ids, retiring orphans after
//!   consecutive misses
//! - **Endpoint**: handshake, authentication and inbound routing for either role

#![deny(unsafe_code)]

pub mod config;
pub mod endpoint;
pub mod heartbeat;
pub mod link;
pub mod metrics;
pub mod monitor;
pub mod operation;
pub mod principal;
pub mod registry;
pub mod session;
pub mod spi;

#[cfg(test)]
mod testing;

pub use config::SessionConfig;
pub use endpoint::{Endpoint, Role};
pub use heartbeat::{HeartbeatResult, run_heartbeat};
pub use link::{Frame, Link};
pub use monitor::{run_consistency_monitor, spawn_consistency_monitor};
pub use operation::{
    LocalOperation, OperationState, RemoteCall, RemoteKind, RemoteOperation, RemoteReply,
    RemoteRequest,
};
pub use principal::Principal;
pub use registry::SessionRegistry;
pub use session::{OperationContext, Session};
pub use spi::{
    Authenticator, Credentials, Dispatcher, InfoProvider, NoInfo, OperationScope,
    SharedSecretAuthenticator, StaticInfo,
};
