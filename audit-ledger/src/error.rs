//! Error types for the audit ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// Every error leaves the ledger exactly as it was before the call.
#[derive(Error, Debug)]
pub enum Error {
    /// An event with this id has already been committed
    #[error("Event already exists: {0}")]
    AlreadyExists(String),

    /// No event with this id
    #[error("Event not found: {0}")]
    NotFound(String),

    /// Payload is not a well-formed structured value
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Identifier fields are empty or malformed
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Record store I/O failure
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Range scan or index failure while answering a query
    #[error("Query failure: {0}")]
    QueryFailure(String),

    /// A guarded key was already present at commit time
    #[error("Commit conflict on key {key}")]
    Conflict {
        /// Key whose put-if-absent guard failed
        key: String,
    },

    /// Stored bytes do not decode to a record
    #[error("Corrupted record: {0}")]
    Corrupted(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when retrying the same call cannot succeed
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Error::StorageUnavailable(_) | Error::Io(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::StorageUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_id() {
        let err = Error::AlreadyExists("ev-1".to_string());
        assert_eq!(err.to_string(), "Event already exists: ev-1");

        let err = Error::Conflict { key: "ev-2".to_string() };
        assert!(err.to_string().contains("ev-2"));
    }

    #[test]
    fn test_permanence() {
        assert!(Error::AlreadyExists("x".into()).is_permanent());
        assert!(Error::InvalidPayload("x".into()).is_permanent());
        assert!(!Error::StorageUnavailable("disk".into()).is_permanent());
    }
}
