//! Index definitions: named rules deciding which objects get a duplicate row in
//! which partition, under which row key, carrying which indexed value.

use crate::entity::TableRow;
use crate::{AppError, DomainObject};
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Partition holding one row per stored object; the source of every backfill.
pub const ALL_ENTITIES_INDEX: &str = "__all_entities";
/// Objects partitioned by their type tag, `__type:<tag>`.
pub const TYPE_INDEX: &str = "__type";

const RESERVED_PREFIX: &str = "__";

pub type KeyFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;
pub type PredicateFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
pub type IndexedValueFn<T> = Arc<dyn Fn(&T) -> Option<Value> + Send + Sync>;

#[derive(Clone)]
pub enum PartitionKeyRule<T> {
    /// The partition is the index name itself.
    IndexName,
    Constant(String),
    /// Computed per object; reads must name the partition explicitly.
    Derived(KeyFn<T>),
}

#[derive(Clone)]
pub enum Predicate<T> {
    Always,
    Never,
    When(PredicateFn<T>),
}

#[derive(Clone)]
pub enum RowKeyRule<T> {
    /// Value of the context's identity field.
    Identity,
    /// Newest first: descending nanosecond ticks followed by the identity.
    TimeBased,
    Derived(KeyFn<T>),
}

/// Every option an index can set. Unset predicates default to [`Predicate::Never`].
#[derive(Clone)]
pub struct IndexOptions<T> {
    pub partition_key: PartitionKeyRule<T>,
    pub predicate: Predicate<T>,
    pub row_key: RowKeyRule<T>,
    pub indexed_value: Option<IndexedValueFn<T>>,
}

impl<T> Default for IndexOptions<T> {
    fn default() -> Self {
        Self { partition_key: PartitionKeyRule::IndexName, predicate: Predicate::Never, row_key: RowKeyRule::Identity, indexed_value: None }
    }
}

impl<T> IndexOptions<T> {
    pub fn when(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self { predicate: Predicate::When(Arc::new(predicate)), ..Default::default() }
    }

    pub fn always() -> Self {
        Self { predicate: Predicate::Always, ..Default::default() }
    }

    pub fn partition_by(mut self, rule: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.partition_key = PartitionKeyRule::Derived(Arc::new(rule));
        self
    }

    pub fn row_key_by(mut self, rule: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.row_key = RowKeyRule::Derived(Arc::new(rule));
        self
    }

    pub fn indexed_by(mut self, rule: impl Fn(&T) -> Option<Value> + Send + Sync + 'static) -> Self {
        self.indexed_value = Some(Arc::new(rule));
        self
    }
}

#[derive(Clone)]
pub struct IndexDefinition<T> {
    name: String,
    options: IndexOptions<T>,
    placeholder: bool,
}

impl<T> fmt::Debug for IndexDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition")
            .field("name", &self.name)
            .field("rules", &fingerprint_of(&self.options))
            .field("placeholder", &self.placeholder)
            .finish()
    }
}

impl<T: DomainObject> IndexDefinition<T> {
    pub fn new(name: impl Into<String>, options: IndexOptions<T>) -> Result<Self, AppError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AppError::Configuration("index name must not be blank".to_string()));
        }
        if name.starts_with(RESERVED_PREFIX) {
            return Err(AppError::Configuration(format!("index name '{}' uses the reserved prefix '{}'", name, RESERVED_PREFIX)));
        }
        Ok(Self { name, options, placeholder: false })
    }

    pub(crate) fn all_entities() -> Self {
        Self { name: ALL_ENTITIES_INDEX.to_string(), options: IndexOptions::always(), placeholder: false }
    }

    pub(crate) fn by_type() -> Self {
        let options = IndexOptions::always().partition_by(|o: &T| type_partition(&o.type_tag()));
        Self { name: TYPE_INDEX.to_string(), options, placeholder: false }
    }

    /// Stands in for a name found in the registry that nothing configured at runtime;
    /// never matches, but its partition stays readable.
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self { name: name.into(), options: IndexOptions::default(), placeholder: true }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    /// Rows of a time-based index are keyed by write time and never addressed again.
    pub fn is_time_based(&self) -> bool {
        matches!(self.options.row_key, RowKeyRule::TimeBased)
    }

    pub fn is_builtin(&self) -> bool {
        self.name == ALL_ENTITIES_INDEX || self.name == TYPE_INDEX
    }

    pub fn matches(&self, obj: &T) -> bool {
        match &self.options.predicate {
            Predicate::Always => true,
            Predicate::Never => false,
            Predicate::When(f) => f(obj),
        }
    }

    pub fn partition_key(&self, obj: &T) -> String {
        match &self.options.partition_key {
            PartitionKeyRule::IndexName => self.name.clone(),
            PartitionKeyRule::Constant(c) => c.clone(),
            PartitionKeyRule::Derived(f) => f(obj),
        }
    }

    /// The single partition all of this index's rows live in, if it does not vary per object.
    pub fn read_partition(&self) -> Option<String> {
        match &self.options.partition_key {
            PartitionKeyRule::IndexName => Some(self.name.clone()),
            PartitionKeyRule::Constant(c) => Some(c.clone()),
            PartitionKeyRule::Derived(_) => None,
        }
    }

    pub fn row_key(&self, obj: &T, identity: &str) -> String {
        match &self.options.row_key {
            RowKeyRule::Identity => identity.to_string(),
            RowKeyRule::TimeBased => {
                let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
                format!("{:019}_{}", i64::MAX - nanos, identity)
            }
            RowKeyRule::Derived(f) => f(obj),
        }
    }

    pub fn indexed_value(&self, obj: &T) -> Option<Value> {
        self.options.indexed_value.as_ref().and_then(|f| f(obj))
    }

    pub fn to_row(&self, obj: &T, identity: &str) -> TableRow<T> {
        TableRow::new(self.partition_key(obj), self.row_key(obj, identity), obj.clone()).with_indexed_value(self.indexed_value(obj))
    }

    /// Describes the rule shapes, persisted in the registry next to the name.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.options)
    }
}

fn fingerprint_of<T>(options: &IndexOptions<T>) -> String {
    let partition = match &options.partition_key {
        PartitionKeyRule::IndexName => "name".to_string(),
        PartitionKeyRule::Constant(c) => format!("const:{c}"),
        PartitionKeyRule::Derived(_) => "derived".to_string(),
    };
    let predicate = match &options.predicate {
        Predicate::Always => "always",
        Predicate::Never => "never",
        Predicate::When(_) => "when",
    };
    let row = match &options.row_key {
        RowKeyRule::Identity => "identity",
        RowKeyRule::TimeBased => "time",
        RowKeyRule::Derived(_) => "derived",
    };
    let indexed = if options.indexed_value.is_some() { "derived" } else { "none" };
    format!("partition={partition};predicate={predicate};row={row};indexed={indexed}")
}

pub fn type_partition(type_tag: &str) -> String {
    format!("{TYPE_INDEX}:{type_tag}")
}
