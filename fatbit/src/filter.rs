use crate::edm::EdmValue;
use crate::entity::{TableEntity, PARTITION_KEY, ROW_KEY};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn matches(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
        }
    }
}

/// Query predicate: conditions on `PartitionKey`, `RowKey` and named columns joined by AND.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Compare { property: String, op: CompareOp, value: EdmValue },
    And(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn compare(property: impl Into<String>, op: CompareOp, value: impl Into<EdmValue>) -> Filter {
        Filter::Compare { property: property.into(), op, value: value.into() }
    }

    pub fn partition_eq(partition_key: impl Into<String>) -> Filter {
        Filter::compare(PARTITION_KEY, CompareOp::Eq, partition_key.into())
    }

    /// Inclusive on both ends.
    pub fn row_key_range(partition_key: impl Into<String>, min: impl Into<String>, max: impl Into<String>) -> Filter {
        Filter::partition_eq(partition_key)
            .and(Filter::compare(ROW_KEY, CompareOp::Ge, min.into()))
            .and(Filter::compare(ROW_KEY, CompareOp::Le, max.into()))
    }

    pub fn property_eq(partition_key: impl Into<String>, property: impl Into<String>, value: impl Into<EdmValue>) -> Filter {
        Filter::partition_eq(partition_key).and(Filter::compare(property, CompareOp::Eq, value))
    }

    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (a, b) => Filter::And(Box::new(a), Box::new(b)),
        }
    }

    pub fn matches(&self, entity: &TableEntity) -> bool {
        match self {
            Filter::All => true,
            Filter::Compare { property, op, value } => entity
                .property(property)
                .and_then(|actual| actual.compare(value))
                .is_some_and(|ord| op.matches(ord)),
            Filter::And(a, b) => a.matches(entity) && b.matches(entity),
        }
    }

    /// The partition pinned by an equality condition, if any, so a scan can be narrowed.
    pub fn partition_key(&self) -> Option<&str> {
        match self {
            Filter::Compare { property, op: CompareOp::Eq, value } if property == PARTITION_KEY => value.as_str(),
            Filter::And(a, b) => a.partition_key().or_else(|| b.partition_key()),
            _ => None,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => Ok(()),
            Filter::Compare { property, op, value } => write!(f, "{} {} {}", property, op.keyword(), value),
            Filter::And(a, b) => write!(f, "{} and {}", a, b),
        }
    }
}
