//! # tether-core
//!
//! Foundation types shared by every tether crate:
//!
//! - **Branded IDs**: `SessionId`, `LinkId` as newtypes, plus the numeric `RequestId`
//! - **Envelopes**: `Envelope` and the closed `Payload` sum type carried between peers
//! - **Codec**: JSON encode/decode of envelopes into binary frames
//! - **Errors**: `TransportError` taxonomy via `thiserror`, `RemoteFault` wire errors
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;

pub use envelope::{
    ControlRequest, ControlResponse, Envelope, Handshake, InfoLevel, OperationKind,
    OperationRequest, OperationResponse, Payload, PayloadTag,
};
pub use errors::{CodecError, RemoteFault, TransportError};
pub use ids::{LinkId, RequestId, SessionId};
