//! Repository facade.
//!
//! Owns the store, the view registry, the router and the executor for one
//! remote, and keeps them in sync with an optional change-event source.
//! Writes go to the remote only; the cache learns about them from the change
//! event that follows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::source::UnsubscribeHandle;
use crate::{
    CacheUpdate, ChangeEvent, ChangeEventRouter, ChangeEventSource, QueryDescriptor,
    QueryExecutor, Record, RecordId, RecordStore, RemoteDataSource, SyncError, ViewDefinition,
    ViewHandle, ViewRegistry,
};

/// Default collection namespace.
pub const DEFAULT_NAMESPACE: &str = "public";

/// Synchronization state of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No change-event source, or the source went away.
    Offline,
    /// Applying change events as they arrive.
    Live,
    /// Stopped after a change event could not be interpreted.
    Halted,
}

/// Reactive, cache-first access to one remote data source.
pub struct Repository {
    router: Arc<ChangeEventRouter>,
    executor: QueryExecutor,
    remote: Arc<dyn RemoteDataSource>,
    state_rx: watch::Receiver<SyncState>,
    state_tx: Arc<watch::Sender<SyncState>>,
    shutdown_tx: watch::Sender<bool>,
    unsubscribe: Option<UnsubscribeHandle>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Repository {
    pub fn builder(remote: Arc<dyn RemoteDataSource>) -> RepositoryBuilder {
        RepositoryBuilder::new(remote)
    }

    fn ensure_live(&self) -> Result<(), SyncError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(SyncError::Destroyed)
        } else {
            Ok(())
        }
    }

    pub fn namespace(&self) -> &str {
        self.executor.namespace()
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        self.router.store()
    }

    pub fn views(&self) -> &Arc<ViewRegistry> {
        self.router.views()
    }

    pub fn sync_state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every sync state transition.
    pub fn watch_sync_state(&self) -> watch::Receiver<SyncState> {
        self.state_rx.clone()
    }

    /// Subscribe to every store mutation.
    pub fn subscribe_updates(&self) -> Result<broadcast::Receiver<CacheUpdate>, SyncError> {
        self.ensure_live()?;
        Ok(self.router.store().subscribe())
    }

    /// One record, cache first.
    pub async fn fetch_by_id(
        &self,
        collection: &str,
        id: &RecordId,
    ) -> Result<Option<Record>, SyncError> {
        self.ensure_live()?;
        self.executor.fetch_by_id(collection, id).await
    }

    /// Records for `ids` in input order, fetching only uncached ids.
    pub async fn fetch_by_ids(
        &self,
        collection: &str,
        ids: &[RecordId],
    ) -> Result<Vec<Record>, SyncError> {
        self.ensure_live()?;
        self.executor.fetch_by_ids(collection, ids).await
    }

    /// Rows of a remote query; every row is cached.
    pub async fn fetch_list(
        &self,
        collection: &str,
        query: &QueryDescriptor,
    ) -> Result<Vec<Record>, SyncError> {
        self.ensure_live()?;
        self.executor.fetch_list(collection, query).await
    }

    /// The cached record, never touching the remote.
    pub fn get_from_cache_only(
        &self,
        collection: &str,
        id: &RecordId,
    ) -> Result<Option<Record>, SyncError> {
        self.ensure_live()?;
        Ok(self.router.store().get(collection, id))
    }

    /// Create a record remotely. The cache is left untouched.
    pub async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<Record, SyncError> {
        self.ensure_live()?;
        let record = self
            .remote
            .insert(&self.executor.path(collection), fields)
            .await?;
        debug!(collection = %collection, id = %record.id(), "record created");
        Ok(record)
    }

    /// Patch a record remotely. The cache is left untouched.
    pub async fn update(
        &self,
        collection: &str,
        id: &RecordId,
        fields: Map<String, Value>,
    ) -> Result<Record, SyncError> {
        self.ensure_live()?;
        let record = self
            .remote
            .update(&self.executor.path(collection), id, fields)
            .await?;
        debug!(collection = %collection, id = %id, "record updated");
        Ok(record)
    }

    /// Delete a record remotely. The cache is left untouched.
    pub async fn delete(&self, collection: &str, id: &RecordId) -> Result<(), SyncError> {
        self.ensure_live()?;
        self.remote
            .delete(&self.executor.path(collection), id)
            .await?;
        debug!(collection = %collection, id = %id, "record deleted");
        Ok(())
    }

    /// Run `query` remotely, then observe its rows as a list view named
    /// `view_name`.
    ///
    /// The view is evaluated locally from then on: it holds every cached row
    /// of the collection that matches the query's filters, in the query's
    /// order. The query's limit only applies to the remote fetch.
    pub async fn watch_list(
        &self,
        view_name: &str,
        collection: &str,
        query: &QueryDescriptor,
    ) -> Result<ViewHandle, SyncError> {
        self.ensure_live()?;
        self.executor.fetch_list(collection, query).await?;
        self.router
            .register_list(collection, view_name, ViewDefinition::from(query))
    }

    /// Fetch the uncached ids, then observe the id set.
    ///
    /// Fails with [`SyncError::ViewConflict`] if an active id-set view with
    /// the same key tracks ids of another type, such as `1` against `"1"`.
    pub async fn watch_ids(
        &self,
        collection: &str,
        ids: &[RecordId],
    ) -> Result<ViewHandle, SyncError> {
        self.ensure_live()?;
        self.executor.fetch_by_ids(collection, ids).await?;
        self.router.register_ids(collection, ids)
    }

    /// Observe a list view over whatever is already cached.
    pub fn watch_view(
        &self,
        collection: &str,
        view_name: &str,
        definition: ViewDefinition,
    ) -> Result<ViewHandle, SyncError> {
        self.ensure_live()?;
        self.router.register_list(collection, view_name, definition)
    }

    /// Release the event subscription and drop all cached state.
    ///
    /// Idempotent. Afterwards every operation fails with
    /// [`SyncError::Destroyed`] and late fetch results are discarded.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        if let Some(unsubscribe) = &self.unsubscribe {
            unsubscribe.unsubscribe();
        }
        let task = self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        self.router.close();
        self.state_tx.send_replace(SyncState::Offline);
        info!(namespace = %self.namespace(), "repository destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Apply events from `events` until shutdown, source close or a bad event.
async fn run_event_loop(
    router: Arc<ChangeEventRouter>,
    mut events: mpsc::UnboundedReceiver<Result<ChangeEvent, SyncError>>,
    state_tx: Arc<watch::Sender<SyncState>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("change event loop started");
    loop {
        tokio::select! {
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("change event loop shutting down");
                    break;
                }
            }
            item = events.recv() => match item {
                Some(Ok(event)) => {
                    debug!(
                        collection = %event.collection(),
                        id = %event.record_id(),
                        "applying change event"
                    );
                    if !router.apply(event) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "change event rejected, halting synchronization");
                    state_tx.send_replace(SyncState::Halted);
                    return;
                }
                None => {
                    warn!("change event source closed");
                    state_tx.send_replace(SyncState::Offline);
                    return;
                }
            }
        }
    }
    info!("change event loop stopped");
}

/// Builder for a [`Repository`].
pub struct RepositoryBuilder {
    remote: Arc<dyn RemoteDataSource>,
    namespace: Option<String>,
    event_source: Option<Arc<dyn ChangeEventSource>>,
    update_capacity: Option<usize>,
}

impl RepositoryBuilder {
    pub fn new(remote: Arc<dyn RemoteDataSource>) -> Self {
        Self {
            remote,
            namespace: None,
            event_source: None,
            update_capacity: None,
        }
    }

    /// Collection namespace passed to every remote call.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Keep the cache in sync with `source`.
    pub fn event_source(mut self, source: Arc<dyn ChangeEventSource>) -> Self {
        self.event_source = Some(source);
        self
    }

    /// Buffer size of the store update channel.
    pub fn update_capacity(mut self, capacity: usize) -> Self {
        self.update_capacity = Some(capacity);
        self
    }

    /// Build the repository, subscribing to the event source if one was given.
    ///
    /// With an event source this spawns the event loop, so it must run inside
    /// a tokio runtime; outside one it fails with [`SyncError::Subscribe`].
    pub fn build(self) -> Result<Repository, SyncError> {
        let namespace = self
            .namespace
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let store = match self.update_capacity {
            Some(capacity) => RecordStore::with_capacity(capacity),
            None => RecordStore::new(),
        };
        let router = Arc::new(ChangeEventRouter::new(store, ViewRegistry::new()));
        let executor = QueryExecutor::new(
            Arc::clone(&router),
            Arc::clone(&self.remote),
            namespace.clone(),
        );

        let (state_tx, state_rx) = watch::channel(SyncState::Offline);
        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (unsubscribe, event_task) = match self.event_source {
            Some(source) => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|e| SyncError::Subscribe(format!("no tokio runtime: {}", e)))?;
                let (events, unsubscribe) = source.subscribe()?.into_parts();
                state_tx.send_replace(SyncState::Live);
                let task = runtime.spawn(run_event_loop(
                    Arc::clone(&router),
                    events,
                    Arc::clone(&state_tx),
                    shutdown_rx,
                ));
                (Some(unsubscribe), Some(task))
            }
            None => {
                info!(namespace = %namespace, "no change event source, running offline");
                (None, None)
            }
        };

        Ok(Repository {
            router,
            executor,
            remote: self.remote,
            state_rx,
            state_tx,
            shutdown_tx,
            unsubscribe,
            event_task: Mutex::new(event_task),
            destroyed: AtomicBool::new(false),
        })
    }
}
