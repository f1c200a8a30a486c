//! Single mutation path into the cache.
//!
//! Every store write, whether it comes from a change event or from a fetch,
//! passes through [`ChangeEventRouter`], which holds one gate while it updates
//! the [`RecordStore`] and every dependent view. Readers therefore never see a
//! view that disagrees with the records it was built from.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, trace};

use crate::{
    ChangeEvent, Record, RecordId, RecordStore, SyncError, ViewDefinition, ViewHandle,
    ViewRegistry,
};

/// Applies change events and fetched records to the store and its views.
pub struct ChangeEventRouter {
    store: Arc<RecordStore>,
    views: Arc<ViewRegistry>,
    /// Serializes mutations. `true` once closed.
    gate: Mutex<bool>,
}

impl ChangeEventRouter {
    pub fn new(store: Arc<RecordStore>, views: Arc<ViewRegistry>) -> Self {
        Self {
            store,
            views,
            gate: Mutex::new(false),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn views(&self) -> &Arc<ViewRegistry> {
        &self.views
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // The guarded flag stays valid even if a holder panicked
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one change event to the store, then to every affected view.
    ///
    /// Returns false if the router is closed and the event was dropped.
    pub fn apply(&self, event: ChangeEvent) -> bool {
        let closed = self.lock();
        if *closed {
            trace!(collection = %event.collection(), "router closed, event dropped");
            return false;
        }

        match event {
            ChangeEvent::Insert { collection, record }
            | ChangeEvent::Update {
                collection, record, ..
            } => self.upsert(&collection, record),
            ChangeEvent::Delete { collection, id, .. } => self.delete(&collection, &id),
        }
        true
    }

    /// Store fetched records through the same path as change events.
    ///
    /// Returns the number of records written; zero once closed.
    pub fn absorb(&self, collection: &str, records: impl IntoIterator<Item = Record>) -> usize {
        let closed = self.lock();
        if *closed {
            trace!(collection = %collection, "router closed, fetched records dropped");
            return 0;
        }

        let mut written = 0;
        for record in records {
            self.upsert(collection, record);
            written += 1;
        }
        debug!(collection = %collection, written, "fetched records absorbed");
        written
    }

    fn upsert(&self, collection: &str, record: Record) {
        self.store.put(collection, record.clone());
        self.views.on_upsert(collection, &record, &self.store);
    }

    fn delete(&self, collection: &str, id: &RecordId) {
        if self.store.remove(collection, id).is_none() {
            trace!(collection = %collection, id = %id, "delete of uncached record");
        }
        self.views.on_remove(collection, id, &self.store);
    }

    /// Register (or join) a list view, materialized from the current cache.
    ///
    /// Fails with [`SyncError::Destroyed`] once closed.
    pub fn register_list(
        &self,
        collection: &str,
        name: &str,
        definition: ViewDefinition,
    ) -> Result<ViewHandle, SyncError> {
        let closed = self.lock();
        if *closed {
            return Err(SyncError::Destroyed);
        }
        Ok(self
            .views
            .acquire_list(collection, name, definition, &self.store))
    }

    /// Register (or join) an id-set view, materialized from the current cache.
    ///
    /// Fails with [`SyncError::Destroyed`] once closed, and with
    /// [`SyncError::ViewConflict`] if the key already tracks other ids.
    pub fn register_ids(
        &self,
        collection: &str,
        ids: &[RecordId],
    ) -> Result<ViewHandle, SyncError> {
        let closed = self.lock();
        if *closed {
            return Err(SyncError::Destroyed);
        }
        self.views.acquire_ids(collection, ids, &self.store)
    }

    /// Stop accepting mutations and drop all cached state.
    ///
    /// Returns false if already closed.
    pub fn close(&self) -> bool {
        let mut closed = self.lock();
        if *closed {
            return false;
        }
        *closed = true;
        self.views.clear();
        self.store.clear();
        info!("router closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.lock()
    }
}
