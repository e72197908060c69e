//! Storage error types.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The storage engine's deadlock detector chose this transaction as the
    /// victim. Never surfaced to clients; drives a restart.
    #[error("deadlock detected")]
    Deadlock,

    /// A lock could not be granted without waiting. Never surfaced to
    /// clients; drives a restart.
    #[error("lock not granted")]
    NotGranted,

    /// The requested record was not found.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// The kind of record (e.g., "entry", "transaction").
        entity: String,
        /// The key that was looked up.
        key: String,
    },

    /// Failed to establish or maintain the store connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// A transaction operation failed.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// A persisted record could not be decoded against the schema.
    #[error("decode error: {0}")]
    Decode(String),

    /// A raw SQLite error.
    #[error("query error: {0}")]
    Query(#[from] rusqlite::Error),

    /// JSON encoding of an entry record failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the storage crate.
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    // -- Constructors --------------------------------------------------------

    /// Creates a [`StorageError::NotFound`] for the given record kind and key.
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    // -- Predicates ----------------------------------------------------------

    /// Returns `true` if this is a [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if the error is transient and the whole operation
    /// should restart from a clean state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Deadlock | Self::NotGranted)
    }
}

/// Maps a SQLite failure, folding the busy/locked codes into the transient
/// [`StorageError::NotGranted`] so the driver restarts instead of failing.
pub fn map_sqlite(e: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        match err.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                return StorageError::NotGranted;
            }
            _ => {}
        }
    }
    StorageError::Query(e)
}
