//! Common error types for readycheck.

use thiserror::Error;

/// Common error type for readycheck operations.
///
/// Transport, timeout and authentication errors never escape a probe: they
/// are folded into a failed probe result. Configuration errors are fatal
/// and surface before any polling starts.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {seconds:.1}s: {operation}")]
    Timeout { operation: String, seconds: f64 },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Provisioner error: {0}")]
    Provisioner(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type alias using common Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a timeout error for an operation bounded by `limit`.
    pub fn timeout(operation: impl Into<String>, limit: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            seconds: limit.as_secs_f64(),
        }
    }

    /// Whether this error came from a configuration problem.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_message() {
        let err = Error::timeout("dial 127.0.0.1:1337", Duration::from_millis(2500));
        assert_eq!(err.to_string(), "Timed out after 2.5s: dial 127.0.0.1:1337");
    }

    #[test]
    fn test_is_configuration() {
        assert!(Error::Configuration("bad".into()).is_configuration());
        assert!(!Error::Transport("refused".into()).is_configuration());
    }
}
