//! Cache-first record retrieval.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::{
    ChangeEventRouter, CollectionPath, QueryDescriptor, Record, RecordId, RemoteDataSource,
    RemoteError, SyncError,
};

/// Reads through the cache to a [`RemoteDataSource`].
///
/// Fetched records are written through the router, never directly into the
/// store, so active views see them too. A failed remote call writes nothing.
pub struct QueryExecutor {
    router: Arc<ChangeEventRouter>,
    remote: Arc<dyn RemoteDataSource>,
    namespace: String,
}

impl QueryExecutor {
    pub fn new(
        router: Arc<ChangeEventRouter>,
        remote: Arc<dyn RemoteDataSource>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            router,
            remote,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn path(&self, collection: &str) -> CollectionPath {
        CollectionPath::new(self.namespace.clone(), collection)
    }

    /// One record, from cache if present, otherwise from the remote.
    ///
    /// `Ok(None)` when the remote has no such row.
    pub async fn fetch_by_id(
        &self,
        collection: &str,
        id: &RecordId,
    ) -> Result<Option<Record>, SyncError> {
        if let Some(record) = self.router.store().get(collection, id) {
            debug!(collection = %collection, id = %id, "cache hit");
            return Ok(Some(record));
        }

        debug!(collection = %collection, id = %id, "cache miss, fetching");
        let fetched = match self.remote.fetch_one(&self.path(collection), id).await {
            Ok(fetched) => fetched,
            Err(RemoteError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(record) = &fetched {
            self.router.absorb(collection, [record.clone()]);
        }
        Ok(fetched)
    }

    /// Records for `ids` in input order, fetching only the uncached ones in a
    /// single batch. Ids the remote does not know are left out.
    pub async fn fetch_by_ids(
        &self,
        collection: &str,
        ids: &[RecordId],
    ) -> Result<Vec<Record>, SyncError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut found = self.router.store().get_many(collection, ids);
        let mut missing: Vec<RecordId> = Vec::new();
        for id in ids {
            if !found.contains_key(id) && !missing.contains(id) {
                missing.push(id.clone());
            }
        }

        if missing.is_empty() {
            debug!(collection = %collection, count = ids.len(), "batch fully cached");
        } else {
            debug!(
                collection = %collection,
                cached = found.len(),
                missing = missing.len(),
                "batch partially cached, fetching missing"
            );
            let fetched = self
                .remote
                .fetch_many(&self.path(collection), &missing)
                .await?;
            // Only rows that were actually requested count
            let fetched: HashMap<RecordId, Record> = fetched
                .into_iter()
                .filter(|r| missing.contains(r.id()))
                .map(|r| (r.id().clone(), r))
                .collect();
            // Absorb in request order so view ties come out the same every run
            self.router.absorb(
                collection,
                missing.iter().filter_map(|id| fetched.get(id).cloned()),
            );
            found.extend(fetched);
        }

        Ok(ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }

    /// Run a query against the remote and cache every returned row.
    ///
    /// Always hits the remote; returns rows in the remote's order.
    pub async fn fetch_list(
        &self,
        collection: &str,
        query: &QueryDescriptor,
    ) -> Result<Vec<Record>, SyncError> {
        let rows = self
            .remote
            .fetch_by_query(&self.path(collection), query)
            .await?;
        debug!(collection = %collection, rows = rows.len(), "list fetched");
        self.router.absorb(collection, rows.iter().cloned());
        Ok(rows)
    }
}
