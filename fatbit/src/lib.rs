//! fatbit persists arbitrary serde types into a wide-column table store without adopting the
//! store's row type. Each object is written as a "fat entity" (its JSON spread over a few
//! fixed-size string columns) and fanned out into one duplicate row per matching index
//! definition, so every index partition can be read back directly.
//!
//! The store itself is reached through the [`store::TableStore`] trait; [`store::RedbTableStore`]
//! is an embedded implementation with the same batching, concurrency and paging contract.
//!

pub mod batch;
pub mod context;
pub mod edm;
pub mod entity;
pub mod error;
pub mod fat_entity;
pub mod filter;
pub mod index;
pub mod key_encoder;
pub mod logger;
pub mod registry;
pub mod retry;
pub mod rows;
pub mod settings;
pub mod store;

pub use async_trait::async_trait;
pub use batch::BatchPlanner;
pub use context::{ContextState, ObjectStream, TableContext, TableContextConfig};
pub use edm::EdmValue;
pub use entity::{TableEntity, TableRow};
pub use error::{AppError, StoreError};
pub use fat_entity::FatEntityCodec;
pub use filter::{CompareOp, Filter};
pub use futures;
pub use futures::stream::{StreamExt, TryStreamExt};
pub use index::{IndexDefinition, IndexOptions, PartitionKeyRule, Predicate, RowKeyRule, ALL_ENTITIES_INDEX, TYPE_INDEX};
pub use key_encoder::{clean_table_name, decode_key, encode_key};
pub use registry::IndexRegistry;
pub use rows::{RowService, RowStream};
pub use serde;
pub use serde_json;
pub use settings::FatbitSettings;
pub use store::{ContinuationToken, OperationKind, QuerySegment, RedbTableStore, TableBatch, TableOperation, TableStore};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;

/// Anything that round-trips through serde can be stored.
///
/// `type_tag` ends up in the `DomainObjectType` column and drives the built-in type index.
/// A closed enum of domain subtypes should return its variant name here.
pub trait DomainObject: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {
    fn type_tag(&self) -> Cow<'static, str> {
        Cow::Borrowed(short_type_name::<Self>())
    }
}

pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use crate::DomainObject;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Customer {
        pub id: String,
        pub name: String,
        pub state: String,
        pub age: u32,
        #[serde(default)]
        pub notes: String,
    }

    impl DomainObject for Customer {}

    impl Customer {
        pub(crate) fn sample(id: &str, state: &str) -> Customer {
            Customer { id: id.to_string(), name: format!("name-{id}"), state: state.to_string(), age: 40, notes: String::new() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Customer;

    #[test]
    fn type_tag_defaults_to_short_type_name() {
        assert_eq!(Customer::default().type_tag(), "Customer");
        assert_eq!(short_type_name::<Vec<Customer>>(), "Vec");
        assert_eq!(short_type_name::<u32>(), "u32");
    }
}
