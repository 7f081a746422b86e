//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why a settings file could not be turned into [`crate::TetherSettings`].
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON.
    #[error("malformed settings in {}: {source}", path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// Valid JSON whose merged shape does not fit the settings types.
    #[error("settings do not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),

    /// A value the transport cannot run with.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// camelCase path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_names_the_file() {
        let source = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err = SettingsError::Parse {
            path: PathBuf::from("/etc/tether/settings.json"),
            source,
        };
        assert!(err.to_string().starts_with("malformed settings in /etc/tether/settings.json"));
    }

    #[test]
    fn invalid_display() {
        let err = SettingsError::Invalid {
            field: "session.inconsistencyThreshold",
            reason: "must be at least 1",
        };
        assert_eq!(
            err.to_string(),
            "invalid session.inconsistencyThreshold: must be at least 1"
        );
    }
}
