//! Session lifecycle and link liveness settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session lifecycle and consistency tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Seconds between consistency ticks.
    pub control_interval_secs: u64,
    /// Consecutive unmatched ticks before an operation is retired.
    pub inconsistency_threshold: u32,
    /// Seconds without control traffic after which a linkless session is
    /// eligible for closing.
    pub inactivity_timeout_secs: u64,
    /// How many times the initial info request is sent before giving up.
    pub info_request_attempts: u32,
    /// Delay between info request attempts, in milliseconds.
    pub info_retry_delay_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            control_interval_secs: 120,
            inconsistency_threshold: 3,
            inactivity_timeout_secs: 720,
            info_request_attempts: 3,
            info_retry_delay_ms: 1000,
        }
    }
}

impl SessionSettings {
    /// Consistency tick interval.
    pub fn control_interval(&self) -> Duration {
        Duration::from_secs(self.control_interval_secs)
    }

    /// Inactivity window.
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    /// Delay between info request attempts.
    pub fn info_retry_delay(&self) -> Duration {
        Duration::from_millis(self.info_retry_delay_ms)
    }
}

/// Link liveness probing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Seconds between pings.
    pub interval_secs: u64,
    /// Seconds without a pong before the link is closed.
    pub timeout_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 90,
        }
    }
}

impl HeartbeatSettings {
    /// Ping interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Pong timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
