//! The wire unit exchanged between peers.
//!
//! Every frame carries one [`Envelope`]: a correlation id plus a [`Payload`].
//! The payload is a closed sum type; each variant maps onto one of the four
//! kinds the transport distinguishes (request, response, exception, control).
//! The bodies of individual connector operations stay opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RemoteFault;
use crate::ids::{RequestId, SessionId};

/// One framed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Correlates the envelope with exactly one local or remote operation.
    /// Handshakes use [`RequestId::SESSION`].
    pub message_id: RequestId,
    /// The tagged body.
    pub payload: Payload,
}

impl Envelope {
    /// Build an envelope.
    #[must_use]
    pub fn new(message_id: RequestId, payload: Payload) -> Self {
        Self {
            message_id,
            payload,
        }
    }

    /// Handshake sent by the connecting side.
    #[must_use]
    pub fn handshake_request(handshake: Handshake) -> Self {
        Self::new(RequestId::SESSION, Payload::HandshakeRequest(handshake))
    }

    /// Handshake answer sent by the accepting side.
    #[must_use]
    pub fn handshake_response(message_id: RequestId, handshake: Handshake) -> Self {
        Self::new(message_id, Payload::HandshakeResponse(handshake))
    }

    /// Exception reply for `message_id`.
    #[must_use]
    pub fn exception(message_id: RequestId, fault: RemoteFault) -> Self {
        Self::new(message_id, Payload::Exception(fault))
    }

    /// Cancellation notice for `message_id`.
    #[must_use]
    pub fn cancel(message_id: RequestId) -> Self {
        Self::new(message_id, Payload::Cancel)
    }
}

/// The coarse kind of a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadTag {
    /// A request that creates a local operation on the receiver.
    Request,
    /// A (partial or final) result for a remote operation.
    Response,
    /// A failure reported by the peer for a remote operation.
    Exception,
    /// Handshake, cancellation and consistency traffic.
    Control,
}

/// Tagged envelope body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Payload {
    /// Opening handshake from the connecting side.
    HandshakeRequest(Handshake),
    /// Handshake acknowledgement from the accepting side.
    HandshakeResponse(Handshake),
    /// A connector operation request.
    Request(OperationRequest),
    /// A connector operation response (intermediate or final).
    Response(OperationResponse),
    /// The peer failed the operation.
    Exception(RemoteFault),
    /// The peer stopped waiting for the operation.
    Cancel,
    /// Consistency / capability request.
    ControlRequest(ControlRequest),
    /// Answer to a [`Payload::ControlRequest`].
    ControlResponse(ControlResponse),
}

impl Payload {
    /// Coarse kind of this payload.
    #[must_use]
    pub fn tag(&self) -> PayloadTag {
        match self {
            Self::Request(_) => PayloadTag::Request,
            Self::Response(_) => PayloadTag::Response,
            Self::Exception(_) => PayloadTag::Exception,
            Self::HandshakeRequest(_)
            | Self::HandshakeResponse(_)
            | Self::Cancel
            | Self::ControlRequest(_)
            | Self::ControlResponse(_) => PayloadTag::Control,
        }
    }

    /// Whether the payload concerns the whole session rather than one
    /// operation.
    #[must_use]
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            Self::HandshakeRequest(_)
                | Self::HandshakeResponse(_)
                | Self::ControlRequest(_)
                | Self::ControlResponse(_)
        )
    }

    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::HandshakeRequest(_) => "handshake_request",
            Self::HandshakeResponse(_) => "handshake_response",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Exception(_) => "exception",
            Self::Cancel => "cancel",
            Self::ControlRequest(_) => "control_request",
            Self::ControlResponse(_) => "control_response",
        }
    }
}

/// Session binding announcement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session the link wants to join.
    pub session_id: SessionId,
    /// Free-form peer software identifier.
    #[serde(default)]
    pub agent: String,
}

impl Handshake {
    /// Handshake for `session_id` advertising this crate's version.
    #[must_use]
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            agent: format!("tether/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// The finite set of connector operations the transport carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Authenticate an account against the resource.
    Authenticate,
    /// Create an object.
    Create,
    /// Delete an object.
    Delete,
    /// Fetch one object.
    Get,
    /// Resolve a username to a uid.
    ResolveUsername,
    /// Fetch the resource schema.
    Schema,
    /// Run a script inside the connector.
    ScriptOnConnector,
    /// Run a script on the target resource.
    ScriptOnResource,
    /// Query objects (streams results).
    Search,
    /// Fetch changes since a token (streams deltas).
    Sync,
    /// Test the connector configuration.
    Test,
    /// Update an object.
    Update,
    /// Validate the connector configuration.
    Validate,
    /// Execute a batch of tasks.
    Batch,
    /// Subscribe to connector events.
    ConnectorEventSubscription,
    /// Subscribe to sync events.
    SyncEventSubscription,
}

impl OperationKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 16] = [
        Self::Authenticate,
        Self::Create,
        Self::Delete,
        Self::Get,
        Self::ResolveUsername,
        Self::Schema,
        Self::ScriptOnConnector,
        Self::ScriptOnResource,
        Self::Search,
        Self::Sync,
        Self::Test,
        Self::Update,
        Self::Validate,
        Self::Batch,
        Self::ConnectorEventSubscription,
        Self::SyncEventSubscription,
    ];

    /// Wire name, also used as a metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Get => "get",
            Self::ResolveUsername => "resolve_username",
            Self::Schema => "schema",
            Self::ScriptOnConnector => "script_on_connector",
            Self::ScriptOnResource => "script_on_resource",
            Self::Search => "search",
            Self::Sync => "sync",
            Self::Test => "test",
            Self::Update => "update",
            Self::Validate => "validate",
            Self::Batch => "batch",
            Self::ConnectorEventSubscription => "connector_event_subscription",
            Self::SyncEventSubscription => "sync_event_subscription",
        }
    }

    /// Whether every message of this operation must travel on the link it
    /// first answered on.
    #[must_use]
    pub fn is_sticky(self) -> bool {
        matches!(
            self,
            Self::Batch | Self::ConnectorEventSubscription | Self::SyncEventSubscription
        )
    }
}

/// A connector operation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    /// Which operation to run.
    pub kind: OperationKind,
    /// Target connector, opaque to the transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_key: Option<String>,
    /// Operation arguments.
    #[serde(default)]
    pub body: Value,
}

impl OperationRequest {
    /// Build a request without a connector key.
    #[must_use]
    pub fn new(kind: OperationKind, body: Value) -> Self {
        Self {
            kind,
            connector_key: None,
            body,
        }
    }

    /// Set the connector key.
    #[must_use]
    pub fn with_connector_key(mut self, key: impl Into<String>) -> Self {
        self.connector_key = Some(key.into());
        self
    }
}

/// A connector operation response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    /// Operation this answers.
    pub kind: OperationKind,
    /// Result payload.
    #[serde(default)]
    pub body: Value,
    /// `false` for intermediate updates, `true` for the terminal result.
    #[serde(default = "default_last")]
    pub last: bool,
}

fn default_last() -> bool {
    true
}

impl OperationResponse {
    /// Terminal response.
    #[must_use]
    pub fn complete(kind: OperationKind, body: Value) -> Self {
        Self {
            kind,
            body,
            last: true,
        }
    }

    /// Intermediate update.
    #[must_use]
    pub fn update(kind: OperationKind, body: Value) -> Self {
        Self {
            kind,
            body,
            last: false,
        }
    }
}

/// What a control request asks the peer to include in its answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoLevel {
    /// The peer's connector/operation metadata snapshot.
    ConnectorInfo,
}

/// Consistency and capability request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    /// Requested info snapshots.
    #[serde(default)]
    pub info_levels: Vec<InfoLevel>,
    /// Ids the sender currently services as local operations.
    #[serde(default)]
    pub local_request_ids: Vec<RequestId>,
    /// Ids the sender currently awaits as remote operations.
    #[serde(default)]
    pub remote_request_ids: Vec<RequestId>,
}

impl ControlRequest {
    /// Whether the given info level was requested.
    #[must_use]
    pub fn wants(&self, level: InfoLevel) -> bool {
        self.info_levels.contains(&level)
    }
}

/// Answer to a [`ControlRequest`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    /// Connector info snapshot, when requested and available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_info: Option<Value>,
}
