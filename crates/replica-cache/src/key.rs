//! Cache entry keys.

use std::fmt;

use crate::RecordId;

/// Key of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// A single record.
    Record { collection: String, id: RecordId },
    /// A named filtered/sorted list view.
    List { collection: String, name: String },
    /// An id-set projection, keyed by the normalized id set.
    ByIds { collection: String, ids: String },
}

impl CacheKey {
    pub fn record(collection: impl Into<String>, id: RecordId) -> Self {
        CacheKey::Record {
            collection: collection.into(),
            id,
        }
    }

    pub fn list(collection: impl Into<String>, name: impl Into<String>) -> Self {
        CacheKey::List {
            collection: collection.into(),
            name: name.into(),
        }
    }

    /// Key for an id-set projection. Input order and duplicates do not matter.
    pub fn by_ids(collection: impl Into<String>, ids: &[RecordId]) -> Self {
        CacheKey::ByIds {
            collection: collection.into(),
            ids: normalize_ids(ids),
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            CacheKey::Record { collection, .. }
            | CacheKey::List { collection, .. }
            | CacheKey::ByIds { collection, .. } => collection,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Record { collection, id } => write!(f, "{}:{}", collection, id),
            CacheKey::List { collection, name } => write!(f, "{}:list:{}", collection, name),
            CacheKey::ByIds { collection, ids } => write!(f, "{}:byIds:{}", collection, ids),
        }
    }
}

/// Sorted, de-duplicated, comma-joined string forms of `ids`.
///
/// Sorting is lexicographic on the string form, so `[10, 2]` normalizes to
/// `"10,2"`. An integer id and a text id with the same spelling collapse.
pub fn normalize_ids(ids: &[RecordId]) -> String {
    let mut parts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    parts.sort();
    parts.dedup();
    parts.join(",")
}
