//! Error types for fieldsync.

use thiserror::Error;

/// Errors surfaced by the fieldsync library and CLI.
#[derive(Debug, Error)]
pub enum FieldsyncError {
    /// The local SQLite store failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration could not be read, parsed or written.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A queue item or cached record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested transition is not allowed for the item's current status.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A caller passed an argument the store or engine cannot accept.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// JSON (de)serialization failed.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Filesystem access failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote API could not be reached.
    #[error("Network error: {0}")]
    Network(String),
}

impl FieldsyncError {
    /// Whether this error comes from the storage substrate.
    ///
    /// Storage failures are never retried by the engine; they are reported to
    /// the caller as an environment problem.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FieldsyncError::NotFound("queue item 42".to_string());
        assert_eq!(err.to_string(), "Not found: queue item 42");
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: FieldsyncError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, FieldsyncError::Parse(_)));
        assert!(!err.is_storage());
    }

    #[test]
    fn test_is_storage() {
        assert!(FieldsyncError::Database("locked".to_string()).is_storage());
        assert!(!FieldsyncError::Network("timeout".to_string()).is_storage());
    }
}
