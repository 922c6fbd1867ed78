#![allow(dead_code)]

use fatbit::{AppError, DomainObject, FatbitSettings, IndexDefinition, IndexOptions, ObjectStream, RedbTableStore, TableContext, TableContextConfig};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub state: String,
    pub age: u32,
    #[serde(default)]
    pub notes: String,
}

impl DomainObject for Customer {}

impl Customer {
    pub fn sample(id: &str, state: &str, age: u32) -> Customer {
        Customer { id: id.to_string(), name: format!("name-{id}"), state: state.to_string(), age, notes: String::new() }
    }

    pub fn sample_many(n: usize) -> Vec<Customer> {
        let states = ["FL", "GA", "TX", "FL", "NY"];
        (0..n).map(|i| Customer::sample(&format!("c{i:04}"), states[i % states.len()], 20 + (i % 50) as u32)).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
}

/// Closed set of account kinds sharing one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Account {
    Member(Profile),
    Admin(Profile),
}

impl Default for Account {
    fn default() -> Self {
        Account::Member(Profile::default())
    }
}

impl DomainObject for Account {
    fn type_tag(&self) -> Cow<'static, str> {
        match self {
            Account::Member(_) => Cow::Borrowed("Member"),
            Account::Admin(_) => Cow::Borrowed("Admin"),
        }
    }
}

pub fn store(page_size: usize) -> Arc<RedbTableStore> {
    Arc::new(RedbTableStore::in_memory(page_size).expect("in-memory store"))
}

pub fn config() -> TableContextConfig {
    TableContextConfig::new("customers", "id")
}

pub fn floridians() -> IndexDefinition<Customer> {
    IndexDefinition::new("floridians", IndexOptions::when(|c: &Customer| c.state == "FL")).expect("index")
}

pub async fn context(store: &Arc<RedbTableStore>, indexes: Vec<IndexDefinition<Customer>>) -> TableContext<Customer> {
    TableContext::open(store.clone(), config(), indexes).await.expect("context")
}

pub async fn context_with(store: &Arc<RedbTableStore>, settings: FatbitSettings, indexes: Vec<IndexDefinition<Customer>>) -> TableContext<Customer> {
    TableContext::open(store.clone(), config().with_settings(settings), indexes).await.expect("context")
}

pub async fn collect<T>(stream: Result<ObjectStream<T>, AppError>) -> Vec<T> {
    stream.expect("query").try_collect().await.expect("rows")
}
