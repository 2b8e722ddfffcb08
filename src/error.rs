//! Error types for the session store.

use sea_orm::DbErr;

/// Result type for session store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while storing or loading sessions.
///
/// Only [`Error::TransientConnection`] is handled inside the crate (by the
/// executor's retry loop); every other variant reaches the caller unmodified.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection was lost mid-operation.
    #[error("transient connection error: {0}")]
    TransientConnection(#[source] DbErr),

    /// Any other failure reported by the database.
    #[error("query error: {0}")]
    Query(#[source] DbErr),

    /// A sealed payload failed authentication and was withheld.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// A session could not be serialized, or a stored payload is malformed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Every allowed attempt ended in a transient connection error.
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// The transient error seen on the final attempt.
        #[source]
        source: DbErr,
    },

    /// Invalid option or option combination, raised at construction.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an integrity error
    pub fn integrity<S: Into<String>>(msg: S) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::integrity("tag mismatch");
        assert!(matches!(err, Error::Integrity(_)));
        assert_eq!(err.to_string(), "integrity check failed: tag mismatch");
    }

    #[test]
    fn test_retries_exhausted_keeps_cause() {
        let err = Error::RetriesExhausted {
            attempts: 4,
            source: DbErr::Conn(sea_orm::RuntimeErr::Internal("connection lost".into())),
        };
        assert!(err.to_string().starts_with("gave up after 4 attempts"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_serde_json_error_maps_to_serialization() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
