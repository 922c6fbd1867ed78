//! The per-table engine: owns the index definitions of one domain type, keeps the
//! persisted registry in step with them, fans every write out into one duplicate
//! row per matching index and backfills indexes that appear after data exists.

use crate::entity::{TableRow, INDEXED_PROPERTY};
use crate::index::{type_partition, IndexDefinition, ALL_ENTITIES_INDEX, TYPE_INDEX};
use crate::key_encoder::clean_table_name;
use crate::registry::{IndexRegistry, RegistryStore};
use crate::rows::RowService;
use crate::settings::FatbitSettings;
use crate::store::{OperationKind, TableBatch, TableStore};
use crate::{debug, error, info, warn, AppError, DomainObject};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type ObjectStream<T> = BoxStream<'static, Result<T, AppError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    LoadingRegistry,
    Ready,
    /// Terminal: the registry could not be loaded.
    Unavailable,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct TableContextConfig {
    pub table_name: String,
    /// Serialized field whose value is the default row key of every index.
    pub identity_field: String,
    pub settings: FatbitSettings,
}

impl TableContextConfig {
    pub fn new(table_name: impl Into<String>, identity_field: impl Into<String>) -> Self {
        Self { table_name: table_name.into(), identity_field: identity_field.into(), settings: FatbitSettings::default() }
    }

    pub fn with_settings(mut self, settings: FatbitSettings) -> Self {
        self.settings = settings;
        self
    }
}

struct EngineState<T> {
    phase: ContextState,
    failure: Option<String>,
    indexes: Vec<Arc<IndexDefinition<T>>>,
    registered: BTreeSet<String>,
    needs_reindex: bool,
}

impl<T: DomainObject> EngineState<T> {
    fn find(&self, name: &str) -> Option<Arc<IndexDefinition<T>>> {
        self.indexes.iter().find(|i| i.name() == name).cloned()
    }

    /// Adopts registry names nothing at runtime knows about as placeholders.
    fn reconcile(&mut self, registry: &IndexRegistry) {
        for name in registry.names() {
            self.registered.insert(name.to_string());
            match self.find(name) {
                None => {
                    info!("Index {} is only known to the registry, keeping it as a placeholder", name);
                    self.indexes.push(Arc::new(IndexDefinition::placeholder(name)));
                }
                Some(idx) if !idx.is_placeholder() && registry.fingerprint(name).is_some_and(|fp| fp != idx.fingerprint()) => {
                    warn!("Index {} changed its rules since it was registered, existing rows are not rewritten", name);
                }
                Some(_) => {}
            }
        }
    }

    fn unregistered(&self) -> Vec<(String, String)> {
        self.indexes
            .iter()
            .filter(|i| !i.is_placeholder() && !self.registered.contains(i.name()))
            .map(|i| (i.name().to_string(), i.fingerprint()))
            .collect()
    }
}

/// Rows produced for one write, grouped per index definition.
struct FanOut<T> {
    groups: Vec<(Arc<IndexDefinition<T>>, Vec<TableRow<T>>)>,
}

impl<T: DomainObject> FanOut<T> {
    fn new(indexes: &[Arc<IndexDefinition<T>>]) -> Self {
        Self { groups: indexes.iter().map(|i| (Arc::clone(i), Vec::new())).collect() }
    }

    fn push(&mut self, obj: &T, identity: &str) {
        for (idx, rows) in self.groups.iter_mut() {
            if idx.matches(obj) {
                rows.push(idx.to_row(obj, identity));
            }
        }
    }

    fn row_count(&self) -> usize {
        self.groups.iter().map(|(_, rows)| rows.len()).sum()
    }

    /// Plans every group before anything is written, so encoding failures abort the whole write.
    fn plan(&self, rows: &RowService, kind: OperationKind) -> Result<Vec<TableBatch>, AppError> {
        let mut batches = Vec::new();
        for (idx, group) in &self.groups {
            if !group.is_empty() {
                debug!("Index {} gets {} {} rows", idx.name(), group.len(), kind);
                batches.extend(rows.plan(kind, group)?);
            }
        }
        Ok(batches)
    }
}

pub struct TableContext<T> {
    rows: RowService,
    registry: RegistryStore,
    identity_field: String,
    backfill_chunk: usize,
    state: Mutex<EngineState<T>>,
}

impl<T: DomainObject> TableContext<T> {
    /// Validates the configuration; nothing touches the store until [`TableContext::initialize`].
    pub fn new(store: Arc<dyn TableStore>, config: TableContextConfig, indexes: Vec<IndexDefinition<T>>) -> Result<Self, AppError> {
        let identity_field = config.identity_field.trim().to_string();
        if identity_field.is_empty() {
            return Err(AppError::Configuration("identity field must not be blank".to_string()));
        }
        if config.table_name.trim().is_empty() {
            return Err(AppError::Configuration("table name must not be blank".to_string()));
        }
        config.settings.validate()?;

        let mut all = vec![Arc::new(IndexDefinition::all_entities()), Arc::new(IndexDefinition::by_type())];
        for idx in indexes {
            if all.iter().any(|i| i.name() == idx.name()) {
                return Err(AppError::Configuration(format!("index {} is defined twice", idx.name())));
            }
            all.push(Arc::new(idx));
        }

        let table = clean_table_name(&config.table_name);
        let rows = RowService::new(store, &table, &config.settings)?;
        let registry = RegistryStore::new(rows.clone(), &config.settings.registry);
        Ok(Self {
            rows,
            registry,
            identity_field,
            backfill_chunk: config.settings.batch.max_rows * 10,
            state: Mutex::new(EngineState {
                phase: ContextState::Uninitialized,
                failure: None,
                indexes: all,
                registered: BTreeSet::new(),
                needs_reindex: false,
            }),
        })
    }

    pub async fn open(store: Arc<dyn TableStore>, config: TableContextConfig, indexes: Vec<IndexDefinition<T>>) -> Result<Self, AppError> {
        let ctx = Self::new(store, config, indexes)?;
        ctx.initialize().await?;
        Ok(ctx)
    }

    pub fn table_name(&self) -> &str {
        self.rows.table_name()
    }

    pub async fn state(&self) -> ContextState {
        self.state.lock().await.phase
    }

    pub async fn initialize(&self) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        self.ensure_ready(&mut state).await
    }

    async fn ensure_ready(&self, state: &mut EngineState<T>) -> Result<(), AppError> {
        match state.phase {
            ContextState::Ready => return Ok(()),
            ContextState::Unavailable => {
                let reason = state.failure.clone().unwrap_or_default();
                return Err(AppError::Unavailable(format!("table context {} is unavailable: {}", self.table_name(), reason)));
            }
            ContextState::Uninitialized | ContextState::LoadingRegistry => {}
        }
        state.phase = ContextState::LoadingRegistry;
        match self.load_registry(state).await {
            Ok(()) => {
                state.phase = ContextState::Ready;
                info!("Table context {} ready with indexes {:?}", self.table_name(), state.indexes.iter().map(|i| i.name()).collect::<Vec<_>>());
                Ok(())
            }
            Err(e) => {
                error!("Loading index registry of {} failed: {}", self.table_name(), e);
                state.phase = ContextState::Unavailable;
                state.failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn load_registry(&self, state: &mut EngineState<T>) -> Result<(), AppError> {
        self.rows.create_table_if_absent().await?;
        match self.registry.load().await? {
            Some(found) => state.reconcile(&found.registry),
            None => {
                let builtins: Vec<(String, String)> =
                    state.indexes.iter().filter(|i| i.is_builtin()).map(|i| (i.name().to_string(), i.fingerprint())).collect();
                let created = self.registry.upsert(&builtins).await?;
                state.reconcile(&created);
            }
        }
        let fresh = state.unregistered();
        if !fresh.is_empty() {
            info!("Indexes {:?} of {} are not registered yet, they get backfilled on the next write", fresh.iter().map(|(n, _)| n).collect::<Vec<_>>(), self.table_name());
        }
        Ok(())
    }

    /// Adds an index at runtime; the next write registers and backfills it.
    pub async fn register_index(&self, index: IndexDefinition<T>) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        match state.indexes.iter().position(|i| i.name() == index.name()) {
            Some(pos) if state.indexes[pos].is_placeholder() => {
                // already registered, so the next write will not see it as new; rows written
                // while only the placeholder was known have to be backfilled all the same
                state.indexes[pos] = Arc::new(index);
                state.needs_reindex = true;
            }
            Some(_) => return Err(AppError::Configuration(format!("index {} is already defined", index.name()))),
            None => state.indexes.push(Arc::new(index)),
        }
        Ok(())
    }

    pub async fn index_names(&self) -> Vec<String> {
        self.state.lock().await.indexes.iter().map(|i| i.name().to_string()).collect()
    }

    /// Value of the identity field, looking through one level of externally tagged enums.
    pub fn identity_of(&self, obj: &T) -> Result<String, AppError> {
        let value = serde_json::to_value(obj)?;
        let field = match &value {
            Value::Object(map) => match map.get(&self.identity_field) {
                Some(v) => Some(v),
                None if map.len() == 1 => map.values().next().and_then(|inner| inner.get(&self.identity_field)),
                None => None,
            },
            _ => None,
        };
        let identity = match field {
            Some(Value::String(s)) => s.clone(),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
            _ => return Err(AppError::BadRequest(format!("{} has no scalar field '{}'", obj.type_tag(), self.identity_field))),
        };
        if identity.is_empty() {
            return Err(AppError::BadRequest(format!("{} has an empty '{}'", obj.type_tag(), self.identity_field)));
        }
        Ok(identity)
    }

    /// Registers unknown index names and runs a pending backfill; returns the indexes to write through.
    async fn prepare_write(&self) -> Result<Vec<Arc<IndexDefinition<T>>>, AppError> {
        let mut state = self.state.lock().await;
        self.ensure_ready(&mut state).await?;

        let unregistered = state.unregistered();
        if !unregistered.is_empty() {
            let registry = self.registry.upsert(&unregistered).await?;
            state.reconcile(&registry);
            state.needs_reindex = true;
        }
        if state.needs_reindex {
            self.backfill(&state.indexes).await?;
            state.needs_reindex = false;
        }
        Ok(state.indexes.clone())
    }

    /// Rewrites every row of the all-entities partition through the other indexes.
    async fn backfill(&self, indexes: &[Arc<IndexDefinition<T>>]) -> Result<(), AppError> {
        let targets: Vec<Arc<IndexDefinition<T>>> =
            indexes.iter().filter(|i| i.name() != ALL_ENTITIES_INDEX && !i.is_placeholder()).cloned().collect();
        info!("Backfilling {} indexes of {}", targets.len(), self.table_name());

        let mut source = self.rows.by_partition_key::<T>(ALL_ENTITIES_INDEX);
        let mut chunk: Vec<TableRow<T>> = Vec::with_capacity(self.backfill_chunk);
        let mut read = 0;
        let mut written = 0;
        loop {
            let next = source.try_next().await?;
            let done = next.is_none();
            if let Some(row) = next {
                read += 1;
                chunk.push(row);
            }
            if chunk.len() >= self.backfill_chunk || (done && !chunk.is_empty()) {
                let mut fan_out = FanOut::new(&targets);
                for row in chunk.drain(..) {
                    fan_out.push(&row.domain_object, &row.row_key);
                }
                let batches = fan_out.plan(&self.rows, OperationKind::InsertOrReplace)?;
                written += self.rows.execute_batches(batches).await?;
            }
            if done {
                break;
            }
        }
        info!("Backfill of {} done: {} objects read, {} index rows written", self.table_name(), read, written);
        Ok(())
    }

    /// Fans `objects` out into every matching index and applies `kind` to all produced rows.
    /// Returns the number of rows the store accepted.
    ///
    /// Time-based indexes are append-only: their row keys are minted per write, so a
    /// `Delete` or `Replace` of an object they capture is rejected with `BadRequest`.
    pub async fn write(&self, kind: OperationKind, objects: &[T]) -> Result<usize, AppError> {
        let indexes = self.prepare_write().await?;
        if matches!(kind, OperationKind::Delete | OperationKind::Replace) {
            let appended = indexes.iter().find(|i| i.is_time_based() && objects.iter().any(|o| i.matches(o)));
            if let Some(idx) = appended {
                return Err(AppError::BadRequest(format!("{} cannot address rows of time-based index {}", kind, idx.name())));
            }
        }
        let mut fan_out = FanOut::new(&indexes);
        for obj in objects {
            let identity = self.identity_of(obj)?;
            fan_out.push(obj, &identity);
        }
        if fan_out.row_count() == 0 {
            return Ok(0);
        }
        let batches = fan_out.plan(&self.rows, kind)?;
        self.rows.execute_batches(batches).await
    }

    pub async fn insert(&self, obj: &T) -> Result<usize, AppError> {
        self.write(OperationKind::Insert, std::slice::from_ref(obj)).await
    }

    pub async fn insert_or_merge(&self, obj: &T) -> Result<usize, AppError> {
        self.write(OperationKind::InsertOrMerge, std::slice::from_ref(obj)).await
    }

    pub async fn insert_or_replace(&self, obj: &T) -> Result<usize, AppError> {
        self.write(OperationKind::InsertOrReplace, std::slice::from_ref(obj)).await
    }

    pub async fn replace(&self, obj: &T) -> Result<usize, AppError> {
        self.write(OperationKind::Replace, std::slice::from_ref(obj)).await
    }

    /// Deleting an object that is already gone is not an error.
    /// Objects captured by a time-based index cannot be deleted, see [`TableContext::write`].
    pub async fn delete(&self, obj: &T) -> Result<usize, AppError> {
        self.write(OperationKind::Delete, std::slice::from_ref(obj)).await
    }

    pub async fn insert_many(&self, objects: &[T]) -> Result<usize, AppError> {
        self.write(OperationKind::Insert, objects).await
    }

    pub async fn insert_or_merge_many(&self, objects: &[T]) -> Result<usize, AppError> {
        self.write(OperationKind::InsertOrMerge, objects).await
    }

    pub async fn insert_or_replace_many(&self, objects: &[T]) -> Result<usize, AppError> {
        self.write(OperationKind::InsertOrReplace, objects).await
    }

    pub async fn replace_many(&self, objects: &[T]) -> Result<usize, AppError> {
        self.write(OperationKind::Replace, objects).await
    }

    pub async fn delete_many(&self, objects: &[T]) -> Result<usize, AppError> {
        self.write(OperationKind::Delete, objects).await
    }

    async fn index(&self, name: &str) -> Result<Arc<IndexDefinition<T>>, AppError> {
        let mut state = self.state.lock().await;
        self.ensure_ready(&mut state).await?;
        state.find(name).ok_or_else(|| AppError::UnknownIndex(name.to_string()))
    }

    async fn fixed_partition(&self, name: &str) -> Result<String, AppError> {
        self.index(name)
            .await?
            .read_partition()
            .ok_or_else(|| AppError::BadRequest(format!("index {} partitions per object, read it with get_by_partition", name)))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<T>, AppError> {
        self.index(ALL_ENTITIES_INDEX).await?;
        let row: Option<TableRow<T>> = self.rows.find(ALL_ENTITIES_INDEX, id).await?;
        Ok(row.map(|r| r.domain_object))
    }

    pub async fn get_all_by_index(&self, name: &str) -> Result<ObjectStream<T>, AppError> {
        let partition = self.fixed_partition(name).await?;
        Ok(objects(self.rows.by_partition_key(&partition)))
    }

    /// Row keys within `min..=max` of the index partition.
    pub async fn get_by_index_range(&self, name: &str, min: &str, max: &str) -> Result<ObjectStream<T>, AppError> {
        let partition = self.fixed_partition(name).await?;
        Ok(objects(self.rows.by_partition_key_with_row_key_range(&partition, min, max)))
    }

    pub async fn get_by_indexed_value_equals(&self, name: &str, value: &Value) -> Result<ObjectStream<T>, AppError> {
        let partition = self.fixed_partition(name).await?;
        let encoded = self.rows.codec().encode_indexed_value(value)?;
        Ok(objects(self.rows.by_property_equals(&partition, INDEXED_PROPERTY, encoded)))
    }

    pub async fn get_all_by_type(&self, type_tag: &str) -> Result<ObjectStream<T>, AppError> {
        self.index(TYPE_INDEX).await?;
        Ok(objects(self.rows.by_partition_key(&type_partition(type_tag))))
    }

    /// Reads one partition of an index whose partition key is derived per object.
    pub async fn get_by_partition(&self, name: &str, partition_key: &str) -> Result<ObjectStream<T>, AppError> {
        self.index(name).await?;
        Ok(objects(self.rows.by_partition_key(partition_key)))
    }
}

fn objects<T: DomainObject>(rows: crate::rows::RowStream<T>) -> ObjectStream<T> {
    rows.map_ok(|r| r.domain_object).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexOptions;
    use crate::store::RedbTableStore;
    use crate::test_utils::Customer;

    fn store() -> Arc<RedbTableStore> {
        Arc::new(RedbTableStore::in_memory(4).unwrap())
    }

    fn config() -> TableContextConfig {
        TableContextConfig::new("customers", "id")
    }

    fn fl_index() -> IndexDefinition<Customer> {
        IndexDefinition::new("floridians", IndexOptions::when(|c: &Customer| c.state == "FL")).unwrap()
    }

    #[test]
    fn blank_identity_field_is_a_configuration_error() {
        let res = TableContext::<Customer>::new(store(), TableContextConfig::new("customers", " "), vec![]);
        assert!(matches!(res, Err(AppError::Configuration(_))));
    }

    #[test]
    fn duplicate_index_names_are_rejected() {
        let res = TableContext::new(store(), config(), vec![fl_index(), fl_index()]);
        assert!(matches!(res, Err(AppError::Configuration(_))));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut settings = FatbitSettings::default();
        settings.batch.max_rows = 0;
        let res = TableContext::<Customer>::new(store(), config().with_settings(settings), vec![]);
        assert!(matches!(res, Err(AppError::Configuration(_))));
    }

    #[tokio::test]
    async fn identity_is_read_from_the_serialized_object() {
        let ctx = TableContext::<Customer>::new(store(), config(), vec![]).unwrap();
        assert_eq!(ctx.identity_of(&Customer::sample("c7", "FL")).unwrap(), "c7");
        assert!(matches!(ctx.identity_of(&Customer::default()), Err(AppError::BadRequest(_))));

        let by_age = TableContext::<Customer>::new(store(), TableContextConfig::new("customers", "age"), vec![]).unwrap();
        assert_eq!(by_age.identity_of(&Customer::sample("c7", "FL")).unwrap(), "40");
    }

    #[tokio::test]
    async fn lifecycle_reaches_ready() {
        let ctx = TableContext::<Customer>::new(store(), config(), vec![fl_index()]).unwrap();
        assert_eq!(ctx.state().await, ContextState::Uninitialized);
        ctx.initialize().await.unwrap();
        assert_eq!(ctx.state().await, ContextState::Ready);
        assert_eq!(ctx.index_names().await, vec![ALL_ENTITIES_INDEX, TYPE_INDEX, "floridians"]);
    }

    #[tokio::test]
    async fn write_and_read_back() {
        let ctx = TableContext::open(store(), config(), vec![fl_index()]).await.unwrap();
        let written = ctx.insert_many(&[Customer::sample("c1", "FL"), Customer::sample("c2", "GA")]).await.unwrap();
        // two objects into all + type, one into floridians
        assert_eq!(written, 5);

        assert_eq!(ctx.get_by_id("c2").await.unwrap(), Some(Customer::sample("c2", "GA")));
        assert_eq!(ctx.get_by_id("nope").await.unwrap(), None);

        let fl: Vec<Customer> = ctx.get_all_by_index("floridians").await.unwrap().try_collect().await.unwrap();
        assert_eq!(fl, vec![Customer::sample("c1", "FL")]);
        let typed: Vec<Customer> = ctx.get_all_by_type("Customer").await.unwrap().try_collect().await.unwrap();
        assert_eq!(typed.len(), 2);
        assert!(matches!(ctx.get_all_by_index("missing").await, Err(AppError::UnknownIndex(_))));
    }

    #[tokio::test]
    async fn unreachable_store_makes_the_context_unavailable() {
        // a registry row that no longer decodes
        let store = store();
        let settings = FatbitSettings::default();
        let rows = RowService::new(store.clone(), "customers", &settings).unwrap();
        rows.create_table_if_absent().await.unwrap();
        let garbage = crate::entity::TableEntity::new(settings.registry.partition_key.clone(), "customers").with_property("E01", "{not json");
        store.execute_single("customers", crate::store::TableOperation::new(OperationKind::Insert, garbage)).await.unwrap();

        let ctx = TableContext::<Customer>::new(store, config(), vec![]).unwrap();
        assert!(ctx.initialize().await.is_err());
        assert_eq!(ctx.state().await, ContextState::Unavailable);
        assert!(matches!(ctx.insert(&Customer::sample("c1", "FL")).await, Err(AppError::Unavailable(_))));
    }
}
