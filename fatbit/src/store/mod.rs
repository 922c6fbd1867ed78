//! The storage collaborator: the handful of primitives the table store must offer.

pub mod redb_store;

use crate::entity::{TableEntity, WILDCARD_ETAG};
use crate::error::StoreError;
use crate::filter::Filter;
use crate::settings::{MAX_BATCH_BYTES, MAX_BATCH_ROWS};
use crate::AppError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use redb_store::RedbTableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    InsertOrMerge,
    InsertOrReplace,
    Delete,
    Replace,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableOperation {
    pub kind: OperationKind,
    pub entity: TableEntity,
}

impl TableOperation {
    /// Deletes always carry the wildcard ETag so they succeed whatever the row's version.
    pub fn new(kind: OperationKind, mut entity: TableEntity) -> Self {
        if kind == OperationKind::Delete {
            entity.etag = Some(WILDCARD_ETAG.to_string());
        }
        Self { kind, entity }
    }
}

/// One entity group transaction: a single partition, bounded in count and bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TableBatch {
    pub partition_key: String,
    pub kind: OperationKind,
    pub operations: Vec<TableOperation>,
    pub encoded_bytes: usize,
}

impl TableBatch {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Checks the group transaction limits; a violation is a bug in the caller.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.operations.len() > MAX_BATCH_ROWS {
            return Err(StoreError::BatchLimitExceeded(format!("{} operations, at most {}", self.operations.len(), MAX_BATCH_ROWS)).into());
        }
        let mut bytes = 0usize;
        for op in &self.operations {
            if op.entity.partition_key != self.partition_key {
                return Err(AppError::CrossPartitionBatch {
                    expected: self.partition_key.clone(),
                    found: op.entity.partition_key.clone(),
                });
            }
            bytes += op.entity.encoded_size()?;
        }
        if bytes > MAX_BATCH_BYTES {
            return Err(StoreError::BatchLimitExceeded(format!("{} bytes, at most {}", bytes, MAX_BATCH_BYTES)).into());
        }
        Ok(())
    }
}

/// Opaque resume point of a segmented query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationToken {
    pub next_partition_key: String,
    pub next_row_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySegment {
    pub rows: Vec<TableEntity>,
    pub continuation: Option<ContinuationToken>,
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// Returns true when the table was created by this call.
    async fn create_table_if_absent(&self, table: &str) -> Result<bool, AppError>;
    async fn delete_table(&self, table: &str) -> Result<bool, AppError>;
    async fn retrieve(&self, table: &str, partition_key: &str, row_key: &str) -> Result<Option<TableEntity>, AppError>;
    /// Returns the row as stored, carrying its new ETag and timestamp.
    async fn execute_single(&self, table: &str, op: TableOperation) -> Result<TableEntity, AppError>;
    /// Applies all operations atomically or none of them.
    async fn execute_batch(&self, table: &str, batch: &TableBatch) -> Result<Vec<TableEntity>, AppError>;
    async fn query_segment(&self, table: &str, filter: &Filter, token: Option<ContinuationToken>) -> Result<QuerySegment, AppError>;
}
