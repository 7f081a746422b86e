//! Runtime tuning for sessions, derived from [`SessionSettings`].

use std::time::Duration;

use tether_settings::SessionSettings;

/// Tuning applied to every session a registry creates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Interval between consistency ticks.
    pub control_interval: Duration,
    /// Consecutive unmatched ticks before an operation is retired.
    pub inconsistency_threshold: u32,
    /// Idle window after which a linkless session may be closed.
    pub inactivity_timeout: Duration,
    /// Attempts for the initial info request (0 disables it).
    pub info_request_attempts: u32,
    /// Delay between info request attempts.
    pub info_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            control_interval: settings.control_interval(),
            inconsistency_threshold: settings.inconsistency_threshold.max(1),
            inactivity_timeout: settings.inactivity_timeout(),
            info_request_attempts: settings.info_request_attempts,
            info_retry_delay: settings.info_retry_delay(),
        }
    }
}
