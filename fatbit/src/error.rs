use std::sync::PoisonError;
use thiserror::Error;

/// Failures reported by a [`crate::store::TableStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("row already exists: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("batch limit exceeded: {0}")]
    BatchLimitExceeded(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AppError {

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serde error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{type_name} serializes to {chars} chars, fat entity holds at most {max_chars}")]
    ObjectTooLargeForFatEntity { type_name: String, chars: usize, max_chars: usize },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Batch spans partitions: expected `{expected}`, found `{found}`")]
    CrossPartitionBatch { expected: String, found: String },

    #[error("Table context unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown index: {0}")]
    UnknownIndex(String),

    #[error("Key decoding error: {0}")]
    KeyDecoding(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl AppError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::Store(StoreError::NotFound(_)))
    }

    /// Lost an optimistic-concurrency race: the row appeared or changed underneath us.
    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Store(StoreError::Conflict(_) | StoreError::PreconditionFailed(_)))
    }
}

impl<T> From<PoisonError<T>> for AppError
{
    fn from(e: PoisonError<T>) -> Self {
        AppError::Custom(format!("Poison error: {:?}", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_and_conflict_are_classified() {
        assert!(AppError::from(StoreError::NotFound("p/r".into())).is_not_found());
        assert!(AppError::from(StoreError::Conflict("p/r".into())).is_conflict());
        assert!(AppError::from(StoreError::PreconditionFailed("etag".into())).is_conflict());
        assert!(!AppError::from(StoreError::Unavailable("down".into())).is_conflict());
        assert!(!AppError::Custom("x".into()).is_not_found());
    }

    #[test]
    fn too_large_message_names_the_type() {
        let err = AppError::ObjectTooLargeForFatEntity { type_name: "Customer".into(), chars: 10, max_chars: 5 };
        assert_eq!(err.to_string(), "Customer serializes to 10 chars, fat entity holds at most 5");
    }
}
