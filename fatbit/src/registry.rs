//! The persisted list of index names known for a table.
//!
//! Lives in the table itself, in a sentinel partition with the table name as row key.
//! Updates are optimistic: `Insert` when absent, `Replace` against the last seen ETag
//! otherwise, re-reading and retrying whenever another writer got there first.

use crate::entity::TableRow;
use crate::retry::retry_when;
use crate::rows::RowService;
use crate::settings::RegistrySettings;
use crate::{info, AppError, DomainObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub fingerprint: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexRegistry {
    #[serde(default)]
    pub indexes: BTreeMap<String, RegistryEntry>,
}

impl DomainObject for IndexRegistry {}

impl IndexRegistry {
    pub fn contains(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    /// Returns false when the name was already known.
    pub fn register(&mut self, name: &str, fingerprint: &str) -> bool {
        if self.contains(name) {
            return false;
        }
        self.indexes.insert(name.to_string(), RegistryEntry { fingerprint: fingerprint.to_string(), registered_at: Utc::now() });
        true
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.indexes.keys().map(String::as_str)
    }

    pub fn fingerprint(&self, name: &str) -> Option<&str> {
        self.indexes.get(name).map(|e| e.fingerprint.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Versioned {
    pub registry: IndexRegistry,
    pub etag: Option<String>,
}

pub(crate) struct RegistryStore {
    rows: RowService,
    partition_key: String,
    attempts: usize,
    delay: Duration,
}

impl RegistryStore {
    pub(crate) fn new(rows: RowService, settings: &RegistrySettings) -> Self {
        Self {
            rows,
            partition_key: settings.partition_key.clone(),
            attempts: settings.conflict_retries.max(1),
            delay: settings.retry_delay(),
        }
    }

    fn row_key(&self) -> &str {
        self.rows.table_name()
    }

    pub(crate) async fn load(&self) -> Result<Option<Versioned>, AppError> {
        let found: Option<TableRow<IndexRegistry>> = self.rows.find(&self.partition_key, self.row_key()).await?;
        Ok(found.map(|row| Versioned { registry: row.domain_object, etag: row.etag }))
    }

    /// Makes sure every `(name, fingerprint)` is persisted and returns the registry as stored.
    pub(crate) async fn upsert(&self, entries: &[(String, String)]) -> Result<IndexRegistry, AppError> {
        let this = self;
        retry_when(self.attempts, self.delay, AppError::is_conflict, move || async move {
            let current = this.load().await?;
            let (mut registry, etag) = match current {
                Some(v) => (v.registry, v.etag),
                None => (IndexRegistry::default(), None),
            };
            let mut added = Vec::new();
            for (name, fingerprint) in entries {
                if registry.register(name, fingerprint) {
                    added.push(name.as_str());
                }
            }
            let mut row = TableRow::new(this.partition_key.clone(), this.row_key(), registry.clone());
            match etag {
                None => {
                    this.rows.insert(&row).await?;
                    info!("Created index registry for {} with {:?}", this.row_key(), added);
                }
                Some(_) if added.is_empty() => {}
                Some(etag) => {
                    row.etag = Some(etag);
                    this.rows.replace(&row).await?;
                    info!("Registered indexes {:?} for {}", added, this.row_key());
                }
            }
            Ok(registry)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::FatbitSettings;
    use crate::store::RedbTableStore;
    use std::sync::Arc;

    async fn registry_store(store: Arc<RedbTableStore>) -> RegistryStore {
        let settings = FatbitSettings::default();
        let rows = RowService::new(store, "customers", &settings).unwrap();
        rows.create_table_if_absent().await.unwrap();
        RegistryStore::new(rows, &settings.registry)
    }

    fn entries(names: &[&str]) -> Vec<(String, String)> {
        names.iter().map(|n| (n.to_string(), format!("fp-{n}"))).collect()
    }

    #[test]
    fn register_is_idempotent() {
        let mut reg = IndexRegistry::default();
        assert!(reg.register("a", "x"));
        assert!(!reg.register("a", "y"));
        assert_eq!(reg.fingerprint("a"), Some("x"));
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn absent_registry_is_created_then_extended() {
        let store = registry_store(Arc::new(RedbTableStore::in_memory(10).unwrap())).await;
        assert!(store.load().await.unwrap().is_none());

        store.upsert(&entries(&["a", "b"])).await.unwrap();
        let first = store.load().await.unwrap().unwrap();
        assert!(first.etag.is_some());

        let reg = store.upsert(&entries(&["b", "c"])).await.unwrap();
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        let second = store.load().await.unwrap().unwrap();
        assert_ne!(first.etag, second.etag);
        assert_eq!(second.registry, reg);
    }

    #[tokio::test]
    async fn nothing_new_leaves_the_row_untouched() {
        let store = registry_store(Arc::new(RedbTableStore::in_memory(10).unwrap())).await;
        store.upsert(&entries(&["a"])).await.unwrap();
        let before = store.load().await.unwrap().unwrap();
        store.upsert(&entries(&["a"])).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().etag, before.etag);
    }

    #[tokio::test]
    async fn racing_writers_both_land() {
        let shared = Arc::new(RedbTableStore::in_memory(10).unwrap());
        let left = registry_store(Arc::clone(&shared)).await;
        let right = registry_store(shared).await;
        let left_entries = entries(&["left"]);
        let right_entries = entries(&["right"]);
        let (a, b) = tokio::join!(left.upsert(&left_entries), right.upsert(&right_entries));
        a.unwrap();
        b.unwrap();
        let reg = left.load().await.unwrap().unwrap().registry;
        assert!(reg.contains("left") && reg.contains("right"));
    }
}
