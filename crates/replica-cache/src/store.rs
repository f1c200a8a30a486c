//! In-memory record store.
//!
//! Holds at most one snapshot per `(collection, id)`, the latest one written,
//! and broadcasts every mutation to subscribers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{Record, RecordId};

/// Broadcast channel capacity for store updates.
/// Subscribers that fall further behind than this see `RecvError::Lagged`.
pub const UPDATE_CHANNEL_CAPACITY: usize = 4096;

/// Mutation notification for store subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// A record was inserted or replaced.
    Upserted { collection: String, record: Record },
    /// A record was removed.
    Removed { collection: String, id: RecordId },
    /// Every record was dropped.
    Cleared,
}

/// Keyed store of record snapshots.
///
/// Thread-safe; each `put`/`remove` is atomic with respect to readers.
/// Records of a collection are kept ordered by id so listings are stable.
///
/// Read-only outside this crate. Writes go through
/// [`ChangeEventRouter`](crate::ChangeEventRouter) so that views follow them:
///
/// ```compile_fail
/// use replica_cache::{Record, RecordStore};
///
/// let store = RecordStore::new();
/// let record = Record::try_from(serde_json::json!({"id": 1})).unwrap();
/// store.put("tasks", record);
/// ```
pub struct RecordStore {
    /// Records by collection, then by id.
    collections: DashMap<String, BTreeMap<RecordId, Record>>,
    /// Broadcast channel for store updates.
    updates_tx: broadcast::Sender<CacheUpdate>,
}

impl RecordStore {
    /// Create a new empty store.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(UPDATE_CHANNEL_CAPACITY)
    }

    /// Create a store whose update channel buffers `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            collections: DashMap::new(),
            updates_tx,
        })
    }

    /// Subscribe to store updates.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    fn broadcast(&self, update: CacheUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for store update");
        }
    }

    /// Get a record by collection and id.
    pub fn get(&self, collection: &str, id: &RecordId) -> Option<Record> {
        self.collections
            .get(collection)
            .and_then(|records| records.get(id).cloned())
    }

    /// Whether a record is present.
    pub fn contains(&self, collection: &str, id: &RecordId) -> bool {
        self.collections
            .get(collection)
            .is_some_and(|records| records.contains_key(id))
    }

    /// Get the records present for `ids`. Missing ids are simply absent.
    pub fn get_many(&self, collection: &str, ids: &[RecordId]) -> HashMap<RecordId, Record> {
        let Some(records) = self.collections.get(collection) else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|id| records.get(id).map(|r| (id.clone(), r.clone())))
            .collect()
    }

    /// List all records of a collection, ordered by id.
    pub fn list(&self, collection: &str) -> Vec<Record> {
        self.collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Insert or fully replace a record.
    ///
    /// Returns true if a previous snapshot was replaced.
    pub(crate) fn put(&self, collection: &str, record: Record) -> bool {
        let id = record.id().clone();
        let replaced = self
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), record.clone())
            .is_some();

        trace!(collection = %collection, id = %id, replaced, "store: record upserted");
        self.broadcast(CacheUpdate::Upserted {
            collection: collection.to_string(),
            record,
        });
        replaced
    }

    /// Remove a record, returning the snapshot that was held.
    pub(crate) fn remove(&self, collection: &str, id: &RecordId) -> Option<Record> {
        let removed = self
            .collections
            .get_mut(collection)
            .and_then(|mut records| records.remove(id));

        if removed.is_some() {
            trace!(collection = %collection, id = %id, "store: record removed");
            self.broadcast(CacheUpdate::Removed {
                collection: collection.to_string(),
                id: id.clone(),
            });
        }
        removed
    }

    /// Number of records held across all collections.
    pub fn len(&self) -> usize {
        self.collections.iter().map(|r| r.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records held for one collection.
    pub fn collection_len(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    /// Drop every record.
    pub(crate) fn clear(&self) {
        self.collections.clear();
        self.broadcast(CacheUpdate::Cleared);
        debug!("store cleared");
    }
}
