//! Error types for the frontier coordinator.

use thiserror::Error;

/// The main error type for the frontier crates.
#[derive(Error, Debug)]
pub enum FrontierError {
    /// The store could not be reached (I/O, refused, dropped, timed out).
    ///
    /// Transient: the coordinator retries it with backoff.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The retry budget for a store operation was exhausted.
    #[error("Fatal store error: {operation} failed {attempts} consecutive times: {last_error}")]
    FatalStore {
        /// Store operation that kept failing.
        operation: String,
        /// Number of consecutive failed attempts.
        attempts: u32,
        /// Message of the last failure.
        last_error: String,
    },

    /// The store answered with an error that retrying will not fix.
    #[error("Store error: {0}")]
    Store(String),

    /// A processing callback failed.
    #[error("Processing error: {0}")]
    Processing(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A payload could not be canonicalized for fingerprinting.
    #[error("Invalid work item: {0}")]
    InvalidItem(String),

    /// A queue entry did not have the expected `<sequence>|<json>` shape.
    #[error("Malformed queue entry: {0}")]
    MalformedEntry(String),
}

impl FrontierError {
    /// Whether the error is a transient store failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, FrontierError::StoreUnavailable(_))
    }
}

/// Result type alias using FrontierError.
pub type Result<T> = std::result::Result<T, FrontierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_store_unavailable() {
        let err = FrontierError::StoreUnavailable("connection refused".to_string());
        assert_eq!(format!("{}", err), "Store unavailable: connection refused");
    }

    #[test]
    fn test_error_display_fatal_store() {
        let err = FrontierError::FatalStore {
            operation: "pop".to_string(),
            attempts: 5,
            last_error: "broken pipe".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Fatal store error: pop failed 5 consecutive times: broken pipe"
        );
    }

    #[test]
    fn test_error_display_config() {
        let err = FrontierError::Config("REDIS_PORT is not a number".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: REDIS_PORT is not a number"
        );
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: FrontierError = json_err.into();
        assert!(matches!(err, FrontierError::Serialization(_)));
    }

    #[test]
    fn test_only_store_unavailable_is_transient() {
        assert!(FrontierError::StoreUnavailable("x".into()).is_transient());
        assert!(!FrontierError::Store("WRONGTYPE".into()).is_transient());
        assert!(!FrontierError::Config("x".into()).is_transient());
        assert!(!FrontierError::MalformedEntry("x".into()).is_transient());
    }
}
