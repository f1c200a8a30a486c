//! The system of record the cache reads through to and writes to.

use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{QueryDescriptor, Record, RecordId, RemoteError};

/// A collection qualified by its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath {
    pub namespace: String,
    pub name: String,
}

impl CollectionPath {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Remote data source consulted on cache misses and for every write.
///
/// Implementations own their transport, timeout and retry policy. The cache
/// never retries a failed call.
#[async_trait]
pub trait RemoteDataSource: Send + Sync {
    /// Fetch one record. `Ok(None)` when no row matches.
    async fn fetch_one(
        &self,
        collection: &CollectionPath,
        id: &RecordId,
    ) -> Result<Option<Record>, RemoteError>;

    /// Fetch the records that exist among `ids`, in any order.
    async fn fetch_many(
        &self,
        collection: &CollectionPath,
        ids: &[RecordId],
    ) -> Result<Vec<Record>, RemoteError>;

    /// Run a query and return its rows in result order.
    async fn fetch_by_query(
        &self,
        collection: &CollectionPath,
        query: &QueryDescriptor,
    ) -> Result<Vec<Record>, RemoteError>;

    /// Create a record from a partial set of fields and return it as stored.
    async fn insert(
        &self,
        collection: &CollectionPath,
        fields: Map<String, Value>,
    ) -> Result<Record, RemoteError>;

    /// Patch a record and return it as stored.
    async fn update(
        &self,
        collection: &CollectionPath,
        id: &RecordId,
        fields: Map<String, Value>,
    ) -> Result<Record, RemoteError>;

    async fn delete(&self, collection: &CollectionPath, id: &RecordId) -> Result<(), RemoteError>;
}
