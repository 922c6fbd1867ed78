//! Typed scalar column values understood by the table store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EdmValue {
    String(String),
    Binary(#[serde_as(as = "Base64")] Vec<u8>),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Double(f64),
    Guid(Uuid),
    Int32(i32),
    Int64(i64),
}

impl EdmValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EdmValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Values of different variants are incomparable.
    pub fn compare(&self, other: &EdmValue) -> Option<Ordering> {
        match (self, other) {
            (EdmValue::String(a), EdmValue::String(b)) => Some(a.cmp(b)),
            (EdmValue::Binary(a), EdmValue::Binary(b)) => Some(a.cmp(b)),
            (EdmValue::Boolean(a), EdmValue::Boolean(b)) => Some(a.cmp(b)),
            (EdmValue::DateTime(a), EdmValue::DateTime(b)) => Some(a.cmp(b)),
            (EdmValue::Double(a), EdmValue::Double(b)) => a.partial_cmp(b),
            (EdmValue::Guid(a), EdmValue::Guid(b)) => Some(a.cmp(b)),
            (EdmValue::Int32(a), EdmValue::Int32(b)) => Some(a.cmp(b)),
            (EdmValue::Int64(a), EdmValue::Int64(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Literal form used inside textual filter expressions.
impl fmt::Display for EdmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdmValue::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            EdmValue::Binary(bytes) => {
                write!(f, "X'")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "'")
            }
            EdmValue::Boolean(b) => write!(f, "{}", b),
            EdmValue::DateTime(ts) => write!(f, "datetime'{}'", ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            EdmValue::Double(d) => write!(f, "{:?}", d),
            EdmValue::Guid(g) => write!(f, "guid'{}'", g),
            EdmValue::Int32(i) => write!(f, "{}", i),
            EdmValue::Int64(i) => write!(f, "{}L", i),
        }
    }
}

macro_rules! impl_from_for_edm {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for EdmValue {
                fn from(v: $t) -> Self {
                    EdmValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_for_edm!(
    String => String,
    &str => String,
    Vec<u8> => Binary,
    &[u8] => Binary,
    bool => Boolean,
    DateTime<Utc> => DateTime,
    f64 => Double,
    Uuid => Guid,
    i32 => Int32,
    i64 => Int64,
);
