//! Typed query descriptors.
//!
//! A descriptor is sent to the remote as-is and can also be evaluated locally,
//! which is what keeps a list view built from a query correct as change events
//! arrive.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Record, SortKey};

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// Comparison operator of a field filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Matches when the field equals any element of an array value.
    In,
}

/// A single `field op value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FieldFilter {
    /// Evaluate against a record. A missing field reads as null.
    ///
    /// Ordering operators only match values of the same kind, so `"10" > 2`
    /// is false rather than an error.
    pub fn matches(&self, record: &Record) -> bool {
        let actual = SortKey::of(record.get(&self.field));
        let compare = |expected: &Value| -> Option<Ordering> {
            let expected = SortKey::of(Some(expected));
            (std::mem::discriminant(&actual) == std::mem::discriminant(&expected))
                .then(|| actual.cmp(&expected))
        };

        match self.op {
            FilterOp::Eq => compare(&self.value) == Some(Ordering::Equal),
            FilterOp::Neq => compare(&self.value) != Some(Ordering::Equal),
            FilterOp::Gt => compare(&self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(&self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare(&self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(compare(&self.value), Some(Ordering::Less | Ordering::Equal)),
            FilterOp::In => match &self.value {
                Value::Array(options) => options
                    .iter()
                    .any(|option| compare(option) == Some(Ordering::Equal)),
                _ => false,
            },
        }
    }
}

/// Requested ordering of a list query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub order: Order,
}

/// Caller-defined list query: conjunction of filters, optional ordering and
/// limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FieldFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    /// Applied by the remote only; local views are never truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl QueryDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter.
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Shorthand for an equality filter.
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            order,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record satisfies every filter.
    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }
}
