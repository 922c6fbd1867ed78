use crate::edm::EdmValue;
use crate::fat_entity::FatEntityCodec;
use crate::key_encoder::{decode_key, encode_key};
use crate::{AppError, DomainObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PARTITION_KEY: &str = "PartitionKey";
pub const ROW_KEY: &str = "RowKey";
pub const TIMESTAMP: &str = "Timestamp";
pub const ETAG: &str = "ETag";
pub const INDEXED_PROPERTY: &str = "IndexedProperty";
pub const DOMAIN_OBJECT_TYPE: &str = "DomainObjectType";

pub const WILDCARD_ETAG: &str = "*";

pub fn is_reserved_column(name: &str) -> bool {
    matches!(name, PARTITION_KEY | ROW_KEY | TIMESTAMP | ETAG | INDEXED_PROPERTY | DOMAIN_OBJECT_TYPE)
}

/// A row exactly as the store sees it: escaped keys plus named scalar columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub properties: BTreeMap<String, EdmValue>,
}

impl TableEntity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            timestamp: None,
            etag: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<EdmValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Resolves reserved key columns as well as named properties.
    pub fn property(&self, name: &str) -> Option<EdmValue> {
        match name {
            PARTITION_KEY => Some(EdmValue::String(self.partition_key.clone())),
            ROW_KEY => Some(EdmValue::String(self.row_key.clone())),
            TIMESTAMP => self.timestamp.map(EdmValue::DateTime),
            _ => self.properties.get(name).cloned(),
        }
    }

    /// Size of the serialized form submitted to the store.
    pub fn encoded_size(&self) -> Result<usize, AppError> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

/// The fat-entity wrapper around one domain object.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow<T> {
    pub partition_key: String,
    pub row_key: String,
    pub domain_object: T,
    pub indexed_value: Option<serde_json::Value>,
    pub type_tag: String,
    pub etag: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl<T: DomainObject> TableRow<T> {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>, domain_object: T) -> Self {
        let type_tag = domain_object.type_tag().into_owned();
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            domain_object,
            indexed_value: None,
            type_tag,
            etag: None,
            timestamp: None,
        }
    }

    pub fn with_indexed_value(mut self, value: Option<serde_json::Value>) -> Self {
        self.indexed_value = value;
        self
    }

    pub fn to_entity(&self, codec: &FatEntityCodec) -> Result<TableEntity, AppError> {
        let mut entity = TableEntity::new(encode_key(&self.partition_key), encode_key(&self.row_key));
        for (column, slice) in codec.encode(&self.domain_object)? {
            entity.properties.insert(column, EdmValue::String(slice));
        }
        if let Some(value) = &self.indexed_value {
            entity.properties.insert(INDEXED_PROPERTY.to_string(), EdmValue::String(codec.encode_indexed_value(value)?));
        }
        entity.properties.insert(DOMAIN_OBJECT_TYPE.to_string(), EdmValue::String(self.type_tag.clone()));
        entity.etag = self.etag.clone();
        Ok(entity)
    }

    pub fn from_entity(entity: TableEntity, codec: &FatEntityCodec) -> Result<Self, AppError> {
        let domain_object: T = codec.decode(&entity.properties)?;
        let indexed_value = match entity.properties.get(INDEXED_PROPERTY) {
            Some(EdmValue::String(s)) => codec.decode_indexed_value(s),
            _ => None,
        };
        let type_tag = match entity.properties.get(DOMAIN_OBJECT_TYPE) {
            Some(EdmValue::String(s)) => s.clone(),
            _ => domain_object.type_tag().into_owned(),
        };
        Ok(Self {
            partition_key: decode_key(&entity.partition_key)?,
            row_key: decode_key(&entity.row_key)?,
            domain_object,
            indexed_value,
            type_tag,
            etag: entity.etag,
            timestamp: entity.timestamp,
        })
    }
}
