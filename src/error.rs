//! WolfLeader Error Types

use thiserror::Error;

/// Result type alias for WolfLeader operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfLeader error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination service errors
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Stale observation: decided at index {expected}, service is at index {observed}")]
    StaleObservation { expected: u64, observed: u64 },

    // Encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::CoordinationUnavailable(e.to_string())
    }
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CoordinationUnavailable(_)
                | Error::SessionLost(_)
                | Error::StaleObservation { .. }
        )
    }

    /// Check if this error means the cached session can no longer hold locks
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Error::SessionLost(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::CoordinationUnavailable("down".into()).is_retryable());
        assert!(Error::SessionLost("gone".into()).is_retryable());
        assert!(Error::StaleObservation { expected: 3, observed: 7 }.is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_only_session_lost_invalidates() {
        assert!(Error::SessionLost("gone".into()).invalidates_session());
        assert!(!Error::CoordinationUnavailable("down".into()).invalidates_session());
    }
}
