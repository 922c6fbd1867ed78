//! Embedded table store on top of `redb`, honouring the cloud store's contract:
//! ETags, conditional writes, single-partition atomic batches and segmented queries.

use crate::edm::EdmValue;
use crate::entity::{TableEntity, WILDCARD_ETAG};
use crate::error::StoreError;
use crate::filter::Filter;
use crate::settings::FatbitSettings;
use crate::store::{ContinuationToken, OperationKind, QuerySegment, TableBatch, TableOperation, TableStore};
use crate::{debug, info, warn, AppError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::backends::InMemoryBackend;
use redb::{Database, ReadTransaction, ReadableTable, StorageError, Table, TableDefinition, TableError, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::{env, fs};

const CATALOG: TableDefinition<&str, u64> = TableDefinition::new("__fatbit_catalog");

type RowKey = (&'static str, &'static str);

fn rows_def(table: &str) -> TableDefinition<'_, RowKey, &'static [u8]> {
    TableDefinition::new(table)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    version: u64,
    timestamp: DateTime<Utc>,
    properties: BTreeMap<String, EdmValue>,
}

impl StoredRow {
    fn etag(&self) -> String {
        etag_of(self.version)
    }

    fn to_entity(&self, partition_key: &str, row_key: &str) -> TableEntity {
        TableEntity {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            timestamp: Some(self.timestamp),
            etag: Some(self.etag()),
            properties: self.properties.clone(),
        }
    }
}

fn etag_of(version: u64) -> String {
    format!("W/\"{}\"", version)
}

#[derive(Clone)]
pub struct RedbTableStore {
    db: Arc<Database>,
    page_size: usize,
}

impl RedbTableStore {
    pub fn new(db: Arc<Database>, page_size: usize) -> Result<Self, AppError> {
        if page_size == 0 {
            return Err(AppError::Configuration("page_size must be positive".to_string()));
        }
        Ok(Self { db, page_size })
    }

    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self, AppError> {
        let db = Database::create(path.as_ref())?;
        info!("Opened table store at {:?}", path.as_ref());
        Self::new(Arc::new(db), page_size)
    }

    /// Opens the file at `path` with the configured query page size.
    pub fn from_settings(path: impl AsRef<Path>, settings: &FatbitSettings) -> Result<Self, AppError> {
        Self::open(path, settings.query.page_size)
    }

    pub fn in_memory(page_size: usize) -> Result<Self, AppError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::new(Arc::new(db), page_size)
    }

    /// A file-backed store under the temp dir, with a random suffix so runs never collide.
    pub fn temp(name: &str, page_size: usize) -> Result<Self, AppError> {
        let dir = env::temp_dir().join("fatbit");
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Self::open(dir.join(format!("{}_{}.redb", name, rand::random::<u64>())), page_size)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, AppError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        match tokio::task::spawn_blocking(move || f(&db)).await {
            Ok(res) => res.map_err(unavailable_on_io),
            Err(e) => Err(StoreError::Unavailable(format!("store task failed: {}", e)).into()),
        }
    }
}

/// Failed disk I/O surfaces as [`StoreError::Unavailable`]; everything else is passed through.
fn unavailable_on_io(err: AppError) -> AppError {
    let storage = match &err {
        AppError::RedbStorage(e) => Some(e),
        AppError::RedbTransaction(redb::TransactionError::Storage(e)) => Some(e),
        AppError::RedbTable(TableError::Storage(e)) => Some(e),
        AppError::RedbCommit(redb::CommitError::Storage(e)) => Some(e),
        _ => None,
    };
    let reason = match (storage, &err) {
        (Some(StorageError::Io(e)), _) | (None, AppError::Io(e)) => Some(e.to_string()),
        _ => None,
    };
    match reason {
        Some(reason) => {
            warn!("Table store I/O failure: {}", reason);
            StoreError::Unavailable(reason).into()
        }
        None => err,
    }
}

fn ensure_table_write(tx: &WriteTransaction, table: &str) -> Result<(), AppError> {
    let catalog = tx.open_table(CATALOG)?;
    if catalog.get(table)?.is_none() {
        return Err(StoreError::TableNotFound(table.to_string()).into());
    }
    Ok(())
}

fn ensure_table_read(tx: &ReadTransaction, table: &str) -> Result<(), AppError> {
    let catalog = match tx.open_table(CATALOG) {
        Ok(catalog) => catalog,
        Err(TableError::TableDoesNotExist(_)) => return Err(StoreError::TableNotFound(table.to_string()).into()),
        Err(e) => return Err(e.into()),
    };
    if catalog.get(table)?.is_none() {
        return Err(StoreError::TableNotFound(table.to_string()).into());
    }
    Ok(())
}

fn etag_matches(requested: Option<&str>, row: &StoredRow) -> bool {
    match requested {
        None | Some(WILDCARD_ETAG) => true,
        Some(tag) => tag == row.etag(),
    }
}

fn apply(rows: &mut Table<RowKey, &'static [u8]>, op: &TableOperation, now: DateTime<Utc>) -> Result<TableEntity, AppError> {
    let pk = op.entity.partition_key.as_str();
    let rk = op.entity.row_key.as_str();
    let location = || format!("{}/{}", pk, rk);
    let existing: Option<StoredRow> = rows
        .get((pk, rk))?
        .map(|guard| serde_json::from_slice::<StoredRow>(guard.value()))
        .transpose()?;
    let next_version = existing.as_ref().map_or(1, |r| r.version + 1);

    let properties = match (op.kind, existing) {
        (OperationKind::Insert, Some(_)) => return Err(StoreError::Conflict(location()).into()),
        (OperationKind::Insert, None) | (OperationKind::InsertOrReplace, _) => op.entity.properties.clone(),
        (OperationKind::InsertOrMerge, current) => {
            let mut merged = current.map(|r| r.properties).unwrap_or_default();
            merged.extend(op.entity.properties.clone());
            merged
        }
        (OperationKind::Replace | OperationKind::Delete, None) => return Err(StoreError::NotFound(location()).into()),
        (OperationKind::Replace | OperationKind::Delete, Some(current)) => {
            if !etag_matches(op.entity.etag.as_deref(), &current) {
                return Err(StoreError::PreconditionFailed(format!("{} is at {}", location(), current.etag())).into());
            }
            if op.kind == OperationKind::Delete {
                rows.remove((pk, rk))?;
                return Ok(TableEntity::new(pk, rk));
            }
            op.entity.properties.clone()
        }
    };

    let stored = StoredRow { version: next_version, timestamp: now, properties };
    rows.insert((pk, rk), serde_json::to_vec(&stored)?.as_slice())?;
    Ok(stored.to_entity(pk, rk))
}

fn apply_all(db: &Database, table: &str, ops: &[TableOperation]) -> Result<Vec<TableEntity>, AppError> {
    let tx = db.begin_write()?;
    let result = ensure_table_write(&tx, table).and_then(|_| {
        let mut rows = tx.open_table(rows_def(table))?;
        let now = Utc::now();
        ops.iter().map(|op| apply(&mut rows, op, now)).collect::<Result<Vec<_>, AppError>>()
    });
    match result {
        Ok(written) => {
            tx.commit()?;
            Ok(written)
        }
        Err(e) => {
            tx.abort()?;
            Err(e)
        }
    }
}

#[async_trait]
impl TableStore for RedbTableStore {
    async fn create_table_if_absent(&self, table: &str) -> Result<bool, AppError> {
        let table = table.to_string();
        self.blocking(move |db| {
            let tx = db.begin_write()?;
            let created = {
                let mut catalog = tx.open_table(CATALOG)?;
                if catalog.get(table.as_str())?.is_some() {
                    false
                } else {
                    catalog.insert(table.as_str(), Utc::now().timestamp_millis() as u64)?;
                    tx.open_table(rows_def(&table))?;
                    true
                }
            };
            tx.commit()?;
            if created {
                info!("Created table {}", table);
            }
            Ok(created)
        })
        .await
    }

    async fn delete_table(&self, table: &str) -> Result<bool, AppError> {
        let table = table.to_string();
        self.blocking(move |db| {
            let tx = db.begin_write()?;
            let deleted = {
                let mut catalog = tx.open_table(CATALOG)?;
                let removed = catalog.remove(table.as_str())?.is_some();
                removed
            };
            if deleted {
                tx.delete_table(rows_def(&table))?;
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    async fn retrieve(&self, table: &str, partition_key: &str, row_key: &str) -> Result<Option<TableEntity>, AppError> {
        let (table, pk, rk) = (table.to_string(), partition_key.to_string(), row_key.to_string());
        self.blocking(move |db| {
            let tx = db.begin_read()?;
            ensure_table_read(&tx, &table)?;
            let rows = tx.open_table(rows_def(&table))?;
            let found = rows.get((pk.as_str(), rk.as_str()))?;
            match found {
                Some(guard) => {
                    let stored: StoredRow = serde_json::from_slice(guard.value())?;
                    Ok(Some(stored.to_entity(&pk, &rk)))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn execute_single(&self, table: &str, op: TableOperation) -> Result<TableEntity, AppError> {
        let table = table.to_string();
        self.blocking(move |db| {
            let mut written = apply_all(db, &table, std::slice::from_ref(&op))?;
            written.pop().ok_or_else(|| AppError::Custom("no result for single operation".to_string()))
        })
        .await
    }

    async fn execute_batch(&self, table: &str, batch: &TableBatch) -> Result<Vec<TableEntity>, AppError> {
        batch.validate()?;
        let table = table.to_string();
        let ops = batch.operations.clone();
        debug!("Executing {} batch of {} rows on {}", batch.kind, ops.len(), table);
        self.blocking(move |db| apply_all(db, &table, &ops)).await
    }

    async fn query_segment(&self, table: &str, filter: &Filter, token: Option<ContinuationToken>) -> Result<QuerySegment, AppError> {
        let table = table.to_string();
        let filter = filter.clone();
        let page_size = self.page_size;
        self.blocking(move |db| {
            let tx = db.begin_read()?;
            ensure_table_read(&tx, &table)?;
            let rows = tx.open_table(rows_def(&table))?;
            let pinned = filter.partition_key().map(|s| s.to_string());
            let (start_pk, start_rk) = match token {
                Some(t) => (t.next_partition_key, t.next_row_key),
                None => (pinned.clone().unwrap_or_default(), String::new()),
            };

            let mut matched = Vec::new();
            let mut continuation = None;
            for item in rows.range((start_pk.as_str(), start_rk.as_str())..)? {
                let (key, value) = item?;
                let (pk, rk) = key.value();
                if pinned.as_deref().is_some_and(|p| p != pk) {
                    break;
                }
                if matched.len() == page_size {
                    continuation = Some(ContinuationToken { next_partition_key: pk.to_string(), next_row_key: rk.to_string() });
                    break;
                }
                let stored: StoredRow = serde_json::from_slice(value.value())?;
                let entity = stored.to_entity(pk, rk);
                if filter.matches(&entity) {
                    matched.push(entity);
                }
            }
            Ok(QuerySegment { rows: matched, continuation })
        })
        .await
    }
}
