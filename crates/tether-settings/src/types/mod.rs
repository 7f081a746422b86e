//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so partial JSON files only need the keys they change.

mod server;
mod session;

pub use server::*;
pub use session::*;

use serde::{Deserialize, Serialize};

use crate::SettingsError;

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "session": { "controlIntervalSecs": 60 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Session lifecycle and consistency tuning.
    pub session: SessionSettings,
    /// Link liveness probing.
    pub heartbeat: HeartbeatSettings,
    /// Credentials accepted by the shared-secret authenticator.
    pub auth: AuthSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject combinations that would make the transport misbehave.
    pub fn validate(&self) -> crate::Result<()> {
        if self.session.inconsistency_threshold == 0 {
            return Err(SettingsError::Invalid {
                field: "session.inconsistencyThreshold",
                reason: "must be at least 1",
            });
        }
        if self.session.control_interval_secs == 0 {
            return Err(SettingsError::Invalid {
                field: "session.controlIntervalSecs",
                reason: "must be at least 1",
            });
        }
        if self.heartbeat.interval_secs == 0
            || self.heartbeat.timeout_secs < self.heartbeat.interval_secs
        {
            return Err(SettingsError::Invalid {
                field: "heartbeat.timeoutSecs",
                reason: "must be at least heartbeat.intervalSecs, which must be positive",
            });
        }
        Ok(())
    }
}
