//! Interfaces the transport consumes from its embedder.
//!
//! - [`Dispatcher`] executes inbound connector operations
//! - [`InfoProvider`] answers capability requests
//! - [`Authenticator`] turns link credentials into a principal name

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tether_core::{InfoLevel, OperationRequest, OperationResponse, RemoteFault};
use tether_settings::AuthSettings;

pub use crate::operation::OperationScope;

/// Executes inbound connector operations.
///
/// The returned response is always delivered as the terminal message;
/// intermediate results go through [`OperationScope::send_update`].
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Run one operation.
    async fn dispatch(
        &self,
        request: OperationRequest,
        scope: OperationScope,
    ) -> Result<OperationResponse, RemoteFault>;
}

/// Answers capability/info requests from the peer.
pub trait InfoProvider: Send + Sync {
    /// Snapshot for the requested levels, or `None` when nothing is available.
    fn snapshot(&self, levels: &[InfoLevel]) -> Option<Value>;
}

/// Provider with nothing to share.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoInfo;

impl InfoProvider for NoInfo {
    fn snapshot(&self, _levels: &[InfoLevel]) -> Option<Value> {
        None
    }
}

/// Provider that always returns the same snapshot.
#[derive(Clone, Debug)]
pub struct StaticInfo(pub Value);

impl InfoProvider for StaticInfo {
    fn snapshot(&self, levels: &[InfoLevel]) -> Option<Value> {
        levels
            .contains(&InfoLevel::ConnectorInfo)
            .then(|| self.0.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authentication
// ─────────────────────────────────────────────────────────────────────────────

/// Identity material presented by a link.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Username and password.
    Basic {
        /// Account name.
        username: String,
        /// Secret.
        password: String,
    },
    /// Subject of a verified client certificate.
    ClientCertificate {
        /// Certificate subject (e.g. `CN=idm`).
        subject: String,
    },
    /// Identity established by an upstream proxy.
    PreAuthenticated {
        /// Asserted principal name.
        name: String,
    },
    /// No identity presented.
    Anonymous,
}

impl Credentials {
    /// The claimed identity, if any.
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Basic { username, .. } => Some(username),
            Self::ClientCertificate { subject } => Some(subject),
            Self::PreAuthenticated { name } => Some(name),
            Self::Anonymous => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::ClientCertificate { subject } => f
                .debug_struct("ClientCertificate")
                .field("subject", subject)
                .finish(),
            Self::PreAuthenticated { name } => {
                f.debug_struct("PreAuthenticated").field("name", name).finish()
            }
            Self::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Decides which principal a link acts as.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Principal name for the credentials, or `None` to reject the link.
    async fn authenticate(&self, credentials: &Credentials) -> Option<String>;
}

/// Accepts basic credentials carrying a shared secret, plus certificate and
/// pre-authenticated identities from a trusted list.
#[derive(Clone, Default)]
pub struct SharedSecretAuthenticator {
    secret: Option<String>,
    trusted: HashSet<String>,
    anonymous: Option<String>,
}

impl SharedSecretAuthenticator {
    /// Accept basic credentials whose password equals `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Self::default()
        }
    }

    /// Also accept certificate or pre-authenticated `identity`.
    #[must_use]
    pub fn trust(mut self, identity: impl Into<String>) -> Self {
        let _ = self.trusted.insert(identity.into());
        self
    }

    /// Bind anonymous links to `principal`.
    #[must_use]
    pub fn allow_anonymous(mut self, principal: impl Into<String>) -> Self {
        self.anonymous = Some(principal.into());
        self
    }
}

impl From<&AuthSettings> for SharedSecretAuthenticator {
    fn from(settings: &AuthSettings) -> Self {
        Self {
            secret: settings.shared_secret.clone(),
            trusted: settings.trusted_identities.iter().cloned().collect(),
            anonymous: settings.anonymous_principal.clone(),
        }
    }
}

impl fmt::Debug for SharedSecretAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecretAuthenticator")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("trusted", &self.trusted)
            .field("anonymous", &self.anonymous)
            .finish()
    }
}

#[async_trait]
impl Authenticator for SharedSecretAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Option<String> {
        match credentials {
            Credentials::Basic { username, password } => {
                let secret = self.secret.as_deref()?;
                constant_time_eq(secret.as_bytes(), password.as_bytes())
                    .then(|| username.clone())
            }
            Credentials::ClientCertificate { subject: name }
            | Credentials::PreAuthenticated { name } => {
                self.trusted.contains(name).then(|| name.clone())
            }
            Credentials::Anonymous => self.anonymous.clone(),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
