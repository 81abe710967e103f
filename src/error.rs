//! Error types for the engine.
//!
//! The crate uses a hierarchical error system:
//! - [`SinkError`] is the top-level error returned by all public APIs
//! - Specific error types ([`StorageError`], [`QueueError`], [`SyncError`])
//!   provide detail
//!
//! Client-visible failures are carried by [`SyncError`] kinds and surfaced as
//! typed notifications; the remaining kinds are internal and never cross the
//! client boundary as anything but a boolean command completion.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{EntityType, Identifier};

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, SinkError>;

/// Top-level error enum for all engine operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Storage layer error (I/O, corruption, transactions).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Command queue error.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Synchronization error against the remote source.
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Requested entity not found.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// The entity's latest revision is already a tombstone.
    #[error("Entity already removed: {ty} {id}")]
    AlreadyRemoved {
        /// Entity type of the removed entity.
        ty: EntityType,
        /// Identifier of the removed entity.
        id: Identifier,
    },

    /// A framed buffer failed verification.
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    /// A command carried an empty or malformed identifier.
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-buffer error with the given message.
    pub fn invalid_buffer(msg: impl Into<String>) -> Self {
        Self::InvalidBuffer(msg.into())
    }

    /// Creates an invalid-identifier error with the given message.
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is an already-removed error.
    pub fn is_already_removed(&self) -> bool {
        matches!(self, Self::AlreadyRemoved { .. })
    }
}

/// Storage-related errors.
///
/// These errors indicate problems with the underlying storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database file or data is corrupted.
    #[error("Database corrupted: {0}")]
    Corrupt(String),

    /// Environment could not be opened or created.
    #[error("Environment error: {0}")]
    Env(String),

    /// Environment file not found at expected path.
    #[error("Environment not found: {0}")]
    EnvNotFound(PathBuf),

    /// Environment is locked by another writer.
    #[error("Environment is locked by another writer")]
    Locked,

    /// Transaction failed (commit, rollback, etc.).
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database schema version is newer than this build understands.
    #[error("Database version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected database version.
        expected: u32,
        /// Actual database version found on disk.
        found: u32,
    },

    /// Key not present in the scanned database.
    #[error("Key not found")]
    KeyNotFound,
}

impl StorageError {
    /// Creates a corruption error with the given message.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Creates an environment error with the given message.
    pub fn env(msg: impl Into<String>) -> Self {
        Self::Env(msg.into())
    }

    /// Creates a serialization error with the given message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

// Conversions from redb error types
impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        StorageError::Env(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        StorageError::Env(err.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Transaction(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Transaction(format!("Commit failed: {}", err))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Env(format!("Table error: {}", err))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        StorageError::Env(format!("Storage error: {}", err))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// Also allow direct conversion to SinkError for convenience
impl From<redb::Error> for SinkError {
    fn from(err: redb::Error) -> Self {
        SinkError::Storage(StorageError::from(err))
    }
}

impl From<redb::DatabaseError> for SinkError {
    fn from(err: redb::DatabaseError) -> Self {
        SinkError::Storage(StorageError::from(err))
    }
}

impl From<redb::TransactionError> for SinkError {
    fn from(err: redb::TransactionError) -> Self {
        SinkError::Storage(StorageError::from(err))
    }
}

impl From<redb::CommitError> for SinkError {
    fn from(err: redb::CommitError) -> Self {
        SinkError::Storage(StorageError::from(err))
    }
}

impl From<redb::TableError> for SinkError {
    fn from(err: redb::TableError) -> Self {
        SinkError::Storage(StorageError::from(err))
    }
}

impl From<redb::StorageError> for SinkError {
    fn from(err: redb::StorageError) -> Self {
        SinkError::Storage(StorageError::from(err))
    }
}

impl From<bincode::Error> for SinkError {
    fn from(err: bincode::Error) -> Self {
        SinkError::Storage(StorageError::from(err))
    }
}

/// Command queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue has no entry past the replayed cursor.
    #[error("No message found")]
    NoMessageFound,

    /// A queued entry could not be decoded.
    #[error("Invalid queue entry at revision {revision}: {reason}")]
    InvalidEntry {
        /// Queue revision of the bad entry.
        revision: u64,
        /// Why decoding failed.
        reason: String,
    },
}

/// Errors from the remote source, as reported by the adapter.
///
/// These are the only error kinds surfaced to clients (via notifications).
/// The kind determines both status mapping and replay behavior: transient
/// kinds halt outbound replay without advancing, the rest are logged and
/// skipped.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Could not establish a connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server did not answer at all.
    #[error("No server: {0}")]
    NoServer(String),

    /// Credentials were rejected.
    #[error("Login failed: {0}")]
    Login(String),

    /// The resource is misconfigured.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An established connection broke.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Payload could not be transmitted.
    #[error("Transmission error: {0}")]
    Transmission(String),

    /// Anything the adapter could not classify.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SyncError {
    /// Whether outbound replay should halt on this error rather than skip.
    ///
    /// Connectivity and setup problems are expected to clear up, so the
    /// failed revision is retried on the next revision pulse. Everything
    /// else is treated as permanent for this revision.
    pub fn halts_replay(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_)
                | SyncError::NoServer(_)
                | SyncError::Login(_)
                | SyncError::Configuration(_)
                | SyncError::ConnectionLost(_)
        )
    }

    /// The numeric code carried in notifications.
    pub fn code(&self) -> u32 {
        match self {
            SyncError::Unknown(_) => 0,
            SyncError::NoServer(_) => 1,
            SyncError::Login(_) => 2,
            SyncError::Configuration(_) => 3,
            SyncError::Connection(_) => 4,
            SyncError::ConnectionLost(_) => 5,
            SyncError::Transmission(_) => 6,
        }
    }
}

/// Not found errors for specific lookups.
#[derive(Debug, Error)]
pub enum NotFoundError {
    /// No live revision exists for the identifier.
    #[error("Entity not found: {ty} {id}")]
    Entity {
        /// Entity type that was looked up.
        ty: EntityType,
        /// Identifier that was looked up.
        id: Identifier,
    },

    /// The exact (identifier, revision) pair does not exist.
    #[error("Revision not found: {0}")]
    Revision(u64),

    /// No revision strictly older than the given one exists.
    #[error("No previous revision of {id} before {revision}")]
    PreviousRevision {
        /// Identifier that was looked up.
        id: Identifier,
        /// Upper bound the lookup used.
        revision: u64,
    },
}

impl NotFoundError {
    /// Creates an entity-not-found error.
    pub fn entity(ty: EntityType, id: Identifier) -> Self {
        Self::Entity { ty, id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityType;

    #[test]
    fn error_display() {
        let err = SinkError::config("missing storage root");
        assert_eq!(err.to_string(), "Configuration error: missing storage root");
    }

    #[test]
    fn storage_error_display() {
        let err = StorageError::VersionMismatch {
            expected: 2,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "Database version mismatch: expected 2, found 1"
        );
    }

    #[test]
    fn is_not_found() {
        let err: SinkError = NotFoundError::entity(EntityType::Mail, Identifier::nil()).into();
        assert!(err.is_not_found());
        assert!(!err.is_storage());
    }

    #[test]
    fn sync_error_replay_classification() {
        assert!(SyncError::Connection("refused".into()).halts_replay());
        assert!(SyncError::NoServer("timeout".into()).halts_replay());
        assert!(!SyncError::Transmission("short write".into()).halts_replay());
        assert!(!SyncError::Unknown("?".into()).halts_replay());
    }

    #[test]
    fn sync_error_codes_are_distinct() {
        let errs = [
            SyncError::Unknown(String::new()),
            SyncError::NoServer(String::new()),
            SyncError::Login(String::new()),
            SyncError::Configuration(String::new()),
            SyncError::Connection(String::new()),
            SyncError::ConnectionLost(String::new()),
            SyncError::Transmission(String::new()),
        ];
        let mut codes: Vec<u32> = errs.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn error_conversion_chain() {
        fn inner() -> Result<()> {
            Err(StorageError::corrupt("test corruption"))?
        }
        let result = inner();
        assert!(result.unwrap_err().is_storage());
    }
}
