//! CRUD and query primitives over one logical table, speaking in [`TableRow`]s.
//!
//! Multi-row writes go through the [`BatchPlanner`]; queries follow every
//! continuation token and hand callers one lazy stream of rows.

use crate::batch::BatchPlanner;
use crate::edm::EdmValue;
use crate::entity::{TableEntity, TableRow, INDEXED_PROPERTY};
use crate::fat_entity::FatEntityCodec;
use crate::filter::Filter;
use crate::key_encoder::{clean_table_name, encode_key};
use crate::settings::FatbitSettings;
use crate::store::{ContinuationToken, OperationKind, TableBatch, TableOperation, TableStore};
use crate::{debug, AppError, DomainObject};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type RowStream<T> = BoxStream<'static, Result<TableRow<T>, AppError>>;

enum Cursor {
    Start,
    Next(ContinuationToken),
    Done,
}

#[derive(Clone)]
pub struct RowService {
    store: Arc<dyn TableStore>,
    table: String,
    codec: FatEntityCodec,
    planner: BatchPlanner,
    concurrency: usize,
}

impl RowService {
    pub fn new(store: Arc<dyn TableStore>, table: &str, settings: &FatbitSettings) -> Result<Self, AppError> {
        settings.validate()?;
        Ok(Self {
            store,
            table: clean_table_name(table),
            codec: FatEntityCodec::from_settings(&settings.codec),
            planner: BatchPlanner::from_settings(&settings.batch),
            concurrency: settings.batch.concurrency,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn codec(&self) -> &FatEntityCodec {
        &self.codec
    }

    pub async fn create_table_if_absent(&self) -> Result<bool, AppError> {
        self.store.create_table_if_absent(&self.table).await
    }

    /// Merges only touch the columns they carry, so every slot is written to clear stale tails.
    fn encode<T: DomainObject>(&self, kind: OperationKind, row: &TableRow<T>) -> Result<TableEntity, AppError> {
        let mut entity = row.to_entity(&self.codec)?;
        if kind == OperationKind::InsertOrMerge {
            for i in 0..self.codec.max_slots() {
                entity.properties.entry(FatEntityCodec::slot_name(i)).or_insert_with(|| EdmValue::String(String::new()));
            }
            entity.properties.entry(INDEXED_PROPERTY.to_string()).or_insert_with(|| EdmValue::String(String::new()));
        }
        Ok(entity)
    }

    async fn write<T: DomainObject>(&self, kind: OperationKind, row: &TableRow<T>) -> Result<TableRow<T>, AppError> {
        let entity = self.encode(kind, row)?;
        let stored = self.store.execute_single(&self.table, TableOperation::new(kind, entity)).await?;
        let mut out = row.clone();
        out.etag = stored.etag;
        out.timestamp = stored.timestamp;
        Ok(out)
    }

    pub async fn insert<T: DomainObject>(&self, row: &TableRow<T>) -> Result<TableRow<T>, AppError> {
        self.write(OperationKind::Insert, row).await
    }

    pub async fn insert_or_merge<T: DomainObject>(&self, row: &TableRow<T>) -> Result<TableRow<T>, AppError> {
        self.write(OperationKind::InsertOrMerge, row).await
    }

    pub async fn insert_or_replace<T: DomainObject>(&self, row: &TableRow<T>) -> Result<TableRow<T>, AppError> {
        self.write(OperationKind::InsertOrReplace, row).await
    }

    /// Honours `row.etag`; `None` replaces whatever version is stored.
    pub async fn replace<T: DomainObject>(&self, row: &TableRow<T>) -> Result<TableRow<T>, AppError> {
        self.write(OperationKind::Replace, row).await
    }

    /// Returns false when the row was already gone.
    pub async fn delete<T: DomainObject>(&self, row: &TableRow<T>) -> Result<bool, AppError> {
        self.delete_key(&row.partition_key, &row.row_key).await
    }

    pub async fn delete_key(&self, partition_key: &str, row_key: &str) -> Result<bool, AppError> {
        self.delete_entity(TableEntity::new(encode_key(partition_key), encode_key(row_key))).await
    }

    async fn delete_entity(&self, entity: TableEntity) -> Result<bool, AppError> {
        match self.store.execute_single(&self.table, TableOperation::new(OperationKind::Delete, entity)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!("Delete of absent row ignored in {}", self.table);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Plans batches for rows of one logical group; rows are split per partition first.
    pub fn plan<T: DomainObject>(&self, kind: OperationKind, rows: &[TableRow<T>]) -> Result<Vec<TableBatch>, AppError> {
        let mut by_partition: BTreeMap<String, Vec<TableEntity>> = BTreeMap::new();
        for row in rows {
            let entity = self.encode(kind, row)?;
            by_partition.entry(entity.partition_key.clone()).or_default().push(entity);
        }
        let mut batches = Vec::new();
        for (_, entities) in by_partition {
            batches.extend(self.planner.plan(entities, kind)?);
        }
        Ok(batches)
    }

    /// Runs the batches concurrently and waits for all of them; the first failure is reported.
    pub async fn execute_batches(&self, batches: Vec<TableBatch>) -> Result<usize, AppError> {
        let results: Vec<Result<usize, AppError>> = stream::iter(batches)
            .map(|batch| self.execute_batch(batch))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        let mut written = 0;
        for r in results {
            written += r?;
        }
        Ok(written)
    }

    async fn execute_batch(&self, batch: TableBatch) -> Result<usize, AppError> {
        match self.store.execute_batch(&self.table, &batch).await {
            Ok(_) => Ok(batch.len()),
            // one absent row fails the whole group, fall back to row-by-row idempotent deletes
            Err(e) if e.is_not_found() && batch.kind == OperationKind::Delete => {
                debug!("Delete batch on {} hit an absent row, deleting {} rows one by one", batch.partition_key, batch.len());
                let mut deleted = 0;
                for op in batch.operations {
                    if self.delete_entity(op.entity).await? {
                        deleted += 1;
                    }
                }
                Ok(deleted)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn execute_many<T: DomainObject>(&self, kind: OperationKind, rows: &[TableRow<T>]) -> Result<usize, AppError> {
        let batches = self.plan(kind, rows)?;
        self.execute_batches(batches).await
    }

    pub async fn find<T: DomainObject>(&self, partition_key: &str, row_key: &str) -> Result<Option<TableRow<T>>, AppError> {
        let found = self.store.retrieve(&self.table, &encode_key(partition_key), &encode_key(row_key)).await?;
        found.map(|e| TableRow::from_entity(e, &self.codec)).transpose()
    }

    /// Raw entities matching `filter`, following continuation tokens one segment at a time.
    pub fn query_entities(&self, filter: Filter) -> BoxStream<'static, Result<TableEntity, AppError>> {
        let store = Arc::clone(&self.store);
        let table = self.table.clone();
        stream::try_unfold(Cursor::Start, move |cursor| {
            let store = Arc::clone(&store);
            let table = table.clone();
            let filter = filter.clone();
            async move {
                let token = match cursor {
                    Cursor::Done => return Ok::<_, AppError>(None),
                    Cursor::Start => None,
                    Cursor::Next(token) => Some(token),
                };
                let segment = store.query_segment(&table, &filter, token).await?;
                let next = segment.continuation.map_or(Cursor::Done, Cursor::Next);
                let rows = stream::iter(segment.rows.into_iter().map(Ok::<TableEntity, AppError>));
                Ok(Some((rows, next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    pub fn query<T: DomainObject>(&self, filter: Filter) -> RowStream<T> {
        let codec = self.codec;
        self.query_entities(filter)
            .map(move |res| res.and_then(|e| TableRow::from_entity(e, &codec)))
            .boxed()
    }

    pub fn by_partition_key<T: DomainObject>(&self, partition_key: &str) -> RowStream<T> {
        self.query(Filter::partition_eq(encode_key(partition_key)))
    }

    /// Both bounds inclusive.
    pub fn by_partition_key_with_row_key_range<T: DomainObject>(&self, partition_key: &str, min: &str, max: &str) -> RowStream<T> {
        self.query(Filter::row_key_range(encode_key(partition_key), encode_key(min), encode_key(max)))
    }

    pub fn by_property_equals<T: DomainObject>(&self, partition_key: &str, property: &str, value: impl Into<EdmValue>) -> RowStream<T> {
        self.query(Filter::property_eq(encode_key(partition_key), property, value))
    }
}
