//! Record snapshots and their identifiers.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::SyncError;

/// Name of the field every record must carry.
pub const ID_FIELD: &str = "id";

/// Identifier of a record within its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl RecordId {
    /// Read an identifier out of a JSON value.
    ///
    /// Only integers and strings are identifiers; floats, booleans, null and
    /// composite values are not.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordId::Int),
            Value::String(s) => Some(RecordId::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RecordId::Int(i) => Value::from(*i),
            RecordId::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(i) => write!(f, "{}", i),
            RecordId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        RecordId::Int(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId::Text(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        RecordId::Text(id)
    }
}

/// A snapshot of one entity.
///
/// The identifier is extracted once at construction; `fields` still holds the
/// full object, `id` included, exactly as it was received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Record {
    id: RecordId,
    fields: Map<String, Value>,
}

impl Record {
    /// Build a record from a JSON object with an `id` field.
    pub fn from_fields(fields: Map<String, Value>) -> Result<Self, SyncError> {
        let id = fields
            .get(ID_FIELD)
            .ok_or_else(|| SyncError::InvalidRecord("missing id field".to_string()))
            .and_then(|v| {
                RecordId::from_value(v).ok_or_else(|| {
                    SyncError::InvalidRecord(format!("unsupported id value: {}", v))
                })
            })?;
        Ok(Self { id, fields })
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Get a field by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl TryFrom<Value> for Record {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Self::from_fields(fields),
            other => Err(SyncError::InvalidRecord(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

/// Orderable key extracted from a record for view sorting.
///
/// Keys of different kinds order as `Null < Bool < Number < Text`, where
/// `Int` and `Number` are both numbers and compare by exact value. Floats
/// use IEEE total ordering so every key is comparable.
#[derive(Debug, Clone)]
pub enum SortKey {
    Null,
    Bool(bool),
    /// An integer, kept exact beyond 2^53.
    Int(i64),
    Number(f64),
    Text(String),
}

impl SortKey {
    /// Key for a JSON value. Arrays and objects sort as `Null`.
    pub fn of(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Bool(b)) => SortKey::Bool(*b),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(i) => SortKey::Int(i),
                None => n.as_f64().map(SortKey::Number).unwrap_or(SortKey::Null),
            },
            Some(Value::String(s)) => SortKey::Text(s.clone()),
            _ => SortKey::Null,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortKey::Null => 0,
            SortKey::Bool(_) => 1,
            SortKey::Int(_) | SortKey::Number(_) => 2,
            SortKey::Text(_) => 3,
        }
    }
}

impl From<&RecordId> for SortKey {
    fn from(id: &RecordId) -> Self {
        match id {
            RecordId::Int(i) => SortKey::Int(*i),
            RecordId::Text(s) => SortKey::Text(s.clone()),
        }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortKey::Bool(a), SortKey::Bool(b)) => a.cmp(b),
            (SortKey::Int(a), SortKey::Int(b)) => a.cmp(b),
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Int(a), SortKey::Number(b)) => cmp_int_float(*a, *b),
            (SortKey::Number(a), SortKey::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Exact comparison of an integer with a float.
fn cmp_int_float(int: i64, float: f64) -> Ordering {
    if float.is_nan() {
        // Positive NaN sorts above every number, negative NaN below
        return if float.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    match (int as f64).total_cmp(&float) {
        Ordering::Equal => {
            // `int as f64` rounded onto `float`, which is therefore integral.
            // Only 2^63 itself lies outside the i64 range.
            if float >= 9_223_372_036_854_775_808.0 {
                Ordering::Less
            } else {
                int.cmp(&(float as i64))
            }
        }
        unequal => unequal,
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}
