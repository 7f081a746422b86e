//! Listener, authentication and logging settings.

use serde::{Deserialize, Serialize};

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (0 picks an ephemeral port).
    pub port: u16,
    /// Maximum simultaneously open links.
    pub max_connections: usize,
    /// Largest accepted frame, in bytes.
    pub max_message_size: usize,
    /// Per-link outbound queue capacity, in frames.
    pub send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8759,
            max_connections: 64,
            max_message_size: 16 * 1024 * 1024,
            send_queue: 1024,
        }
    }
}

/// Credentials accepted by the shared-secret authenticator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Password expected on basic credentials. `None` rejects basic auth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
    /// Identities accepted from certificates or upstream pre-authentication.
    pub trusted_identities: Vec<String>,
    /// Principal name given to anonymous links. `None` rejects them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous_principal: Option<String>,
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit newline-delimited JSON instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.port, 8759);
        assert_eq!(s.max_connections, 64);
        assert_eq!(s.send_queue, 1024);
    }

    #[test]
    fn auth_parses_partial_json() {
        let auth: AuthSettings =
            serde_json::from_str(r#"{"trustedIdentities": ["CN=idm"]}"#).unwrap();
        assert_eq!(auth.trusted_identities, vec!["CN=idm".to_string()]);
        assert!(auth.shared_secret.is_none());
    }
}
