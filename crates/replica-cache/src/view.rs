//! Named views over cached records and the registry that tracks them.
//!
//! A list view is a filtered, sorted projection of one collection. An id-set
//! view is the projection of a fixed set of ids onto whatever is cached. Both
//! are materialized once at registration and then maintained incrementally by
//! the [`ChangeEventRouter`](crate::ChangeEventRouter).

use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::query::{Order, QueryDescriptor};
use crate::record::ID_FIELD;
use crate::{CacheKey, Record, RecordId, RecordStore, SortKey, SyncError};

/// Record predicate of a list view.
pub type Predicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Sort-key extractor of a list view.
pub type KeyFn = Arc<dyn Fn(&Record) -> SortKey + Send + Sync>;

/// Materialized result shared with readers.
pub type ViewResult = Arc<Vec<Record>>;

/// Definition of a list view: optional filter, sort key and direction.
#[derive(Clone)]
pub struct ViewDefinition {
    filter: Option<Predicate>,
    sort_key: KeyFn,
    order: Order,
}

impl ViewDefinition {
    /// Accept-all view ordered by `sort_key`.
    pub fn new(sort_key: impl Fn(&Record) -> SortKey + Send + Sync + 'static, order: Order) -> Self {
        Self {
            filter: None,
            sort_key: Arc::new(sort_key),
            order,
        }
    }

    /// Accept-all view ordered by a record field.
    pub fn by_field(field: impl Into<String>, order: Order) -> Self {
        let field = field.into();
        Self::new(move |record| SortKey::of(record.get(&field)), order)
    }

    /// Restrict the view to records matching `filter`.
    pub fn with_filter(mut self, filter: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn order(&self) -> Order {
        self.order
    }

    /// Whether `record` belongs in the view.
    pub fn accepts(&self, record: &Record) -> bool {
        self.filter.as_ref().is_none_or(|f| f(record))
    }

    /// Stable sort by key and direction. Equal keys keep their current order.
    pub fn sort(&self, records: &mut [Record]) {
        let key = &self.sort_key;
        match self.order {
            Order::Ascending => records.sort_by(|a, b| key(a).cmp(&key(b))),
            Order::Descending => records.sort_by(|a, b| key(b).cmp(&key(a))),
        }
    }

    /// Filter and sort `records` from scratch.
    pub fn materialize(&self, records: impl IntoIterator<Item = Record>) -> Vec<Record> {
        let mut result: Vec<Record> = records.into_iter().filter(|r| self.accepts(r)).collect();
        self.sort(&mut result);
        result
    }
}

impl From<&QueryDescriptor> for ViewDefinition {
    /// Evaluate the descriptor's filters locally; without an explicit
    /// ordering the view sorts by id ascending.
    fn from(query: &QueryDescriptor) -> Self {
        let (field, order) = match &query.order_by {
            Some(order_by) => (order_by.field.clone(), order_by.order),
            None => (ID_FIELD.to_string(), Order::Ascending),
        };
        let mut definition = Self::by_field(field, order);
        if !query.filters.is_empty() {
            let query = query.clone();
            definition = definition.with_filter(move |record| query.matches(record));
        }
        definition
    }
}

impl fmt::Debug for ViewDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewDefinition")
            .field("filtered", &self.filter.is_some())
            .field("order", &self.order)
            .finish()
    }
}

/// What a registered view projects.
#[derive(Debug, Clone)]
enum ViewKind {
    List(ViewDefinition),
    /// Sorted, de-duplicated ids; the projection follows this order.
    IdSet(Vec<RecordId>),
}

/// A registered view and its current materialization.
struct ViewSlot {
    kind: ViewKind,
    result: Vec<Record>,
    readers: usize,
    tx: watch::Sender<ViewResult>,
}

impl ViewSlot {
    fn new(kind: ViewKind, result: Vec<Record>) -> Self {
        let (tx, _) = watch::channel(Arc::new(result.clone()));
        Self {
            kind,
            result,
            readers: 0,
            tx,
        }
    }

    fn publish(&self) {
        self.tx.send_replace(Arc::new(self.result.clone()));
    }

    fn position(&self, id: &RecordId) -> Option<usize> {
        self.result.iter().position(|r| r.id() == id)
    }

    /// Merge an inserted or updated record. Returns true if the result changed.
    fn merge_upsert(&mut self, record: &Record) -> bool {
        let ViewKind::List(definition) = &self.kind else {
            return false;
        };
        let existing = self.position(record.id());

        if !definition.accepts(record) {
            // Moved out of (or never in) the predicate
            return match existing {
                Some(index) => {
                    self.result.remove(index);
                    true
                }
                None => false,
            };
        }

        match existing {
            Some(index) => self.result[index] = record.clone(),
            None => self.result.push(record.clone()),
        }
        definition.sort(&mut self.result);
        true
    }

    /// Splice a deleted record out. Returns true if it was present.
    fn merge_delete(&mut self, id: &RecordId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.result.remove(index);
                true
            }
            None => false,
        }
    }

    /// Rebuild an id-set projection from the store.
    fn rebuild_ids(&mut self, collection: &str, store: &RecordStore) {
        if let ViewKind::IdSet(ids) = &self.kind {
            let mut found = store.get_many(collection, ids);
            self.result = ids.iter().filter_map(|id| found.remove(id)).collect();
        }
    }

    fn tracks(&self, id: &RecordId) -> bool {
        match &self.kind {
            ViewKind::IdSet(ids) => ids.binary_search(id).is_ok(),
            ViewKind::List(_) => false,
        }
    }
}

/// Registry of active views, keyed by cache key.
///
/// Two readers asking for the same key share one slot; the definition of the
/// first registration wins. A slot is dropped when its last handle is.
pub struct ViewRegistry {
    views: DashMap<CacheKey, ViewSlot>,
}

impl ViewRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            views: DashMap::new(),
        })
    }

    /// Register (or join) a list view, materializing it from `store`.
    pub(crate) fn acquire_list(
        self: &Arc<Self>,
        collection: &str,
        name: &str,
        definition: ViewDefinition,
        store: &RecordStore,
    ) -> ViewHandle {
        let key = CacheKey::list(collection, name);
        let joined = self.acquire(
            key,
            || {
                let result = definition.materialize(store.list(collection));
                ViewSlot::new(ViewKind::List(definition), result)
            },
            |_| Ok::<(), Infallible>(()),
        );
        match joined {
            Ok(handle) => handle,
            Err(never) => match never {},
        }
    }

    /// Register (or join) an id-set view, materializing it from `store`.
    ///
    /// Keys compare ids by their string form, so `Int(1)` and `Text("1")`
    /// map to the same key. Joining a view that tracks different ids under
    /// that key fails with [`SyncError::ViewConflict`].
    pub(crate) fn acquire_ids(
        self: &Arc<Self>,
        collection: &str,
        ids: &[RecordId],
        store: &RecordStore,
    ) -> Result<ViewHandle, SyncError> {
        let key = CacheKey::by_ids(collection, ids);
        let mut wanted = ids.to_vec();
        wanted.sort();
        wanted.dedup();

        let conflict_key = key.to_string();
        self.acquire(
            key,
            || {
                let mut slot = ViewSlot::new(ViewKind::IdSet(wanted.clone()), Vec::new());
                slot.rebuild_ids(collection, store);
                slot.publish();
                slot
            },
            |kind| match kind {
                ViewKind::IdSet(tracked) if *tracked == wanted => Ok(()),
                ViewKind::IdSet(tracked) => Err(SyncError::ViewConflict {
                    key: conflict_key,
                    reason: format!("view tracks {:?}, requested {:?}", tracked, wanted),
                }),
                ViewKind::List(_) => Err(SyncError::ViewConflict {
                    key: conflict_key,
                    reason: "key holds a list view".to_string(),
                }),
            },
        )
    }

    /// Join the slot at `key`, creating it with `init` if absent. An existing
    /// slot is joined only if `compatible` accepts it.
    fn acquire<E>(
        self: &Arc<Self>,
        key: CacheKey,
        init: impl FnOnce() -> ViewSlot,
        compatible: impl FnOnce(&ViewKind) -> Result<(), E>,
    ) -> Result<ViewHandle, E> {
        let mut slot = match self.views.entry(key.clone()) {
            Entry::Occupied(entry) => {
                compatible(&entry.get().kind)?;
                entry.into_ref()
            }
            Entry::Vacant(entry) => {
                debug!(key = %key, "view registered");
                entry.insert(init())
            }
        };
        slot.readers += 1;
        trace!(key = %key, readers = slot.readers, "view acquired");
        let rx = slot.tx.subscribe();
        drop(slot);

        Ok(ViewHandle {
            key,
            registry: Arc::downgrade(self),
            rx,
        })
    }

    /// Drop one reader of `key`, discarding the view with its last reader.
    /// Unknown keys are ignored.
    fn release(&self, key: &CacheKey) {
        let last = match self.views.get_mut(key) {
            Some(mut slot) => {
                slot.readers = slot.readers.saturating_sub(1);
                slot.readers == 0
            }
            None => return,
        };
        if last && self.views.remove_if(key, |_, slot| slot.readers == 0).is_some() {
            debug!(key = %key, "view released");
        }
    }

    /// Apply an inserted or updated record to every view of `collection`.
    pub(crate) fn on_upsert(&self, collection: &str, record: &Record, store: &RecordStore) {
        for mut entry in self.views.iter_mut() {
            if entry.key().collection() != collection {
                continue;
            }
            let slot = entry.value_mut();
            let changed = match slot.kind {
                ViewKind::List(_) => slot.merge_upsert(record),
                ViewKind::IdSet(_) if slot.tracks(record.id()) => {
                    slot.rebuild_ids(collection, store);
                    true
                }
                ViewKind::IdSet(_) => false,
            };
            if changed {
                slot.publish();
                trace!(key = %entry.key(), id = %record.id(), "view recomputed");
            }
        }
    }

    /// Apply a removed record to every view of `collection`.
    pub(crate) fn on_remove(&self, collection: &str, id: &RecordId, store: &RecordStore) {
        for mut entry in self.views.iter_mut() {
            if entry.key().collection() != collection {
                continue;
            }
            let slot = entry.value_mut();
            let changed = match slot.kind {
                ViewKind::List(_) => slot.merge_delete(id),
                ViewKind::IdSet(_) if slot.tracks(id) => {
                    slot.rebuild_ids(collection, store);
                    true
                }
                ViewKind::IdSet(_) => false,
            };
            if changed {
                slot.publish();
                trace!(key = %entry.key(), id = %id, "view recomputed");
            }
        }
    }

    /// Current result of a view, if registered.
    pub fn snapshot(&self, key: &CacheKey) -> Option<ViewResult> {
        self.views.get(key).map(|slot| Arc::new(slot.result.clone()))
    }

    /// Number of active readers of a view.
    pub fn readers(&self, key: &CacheKey) -> usize {
        self.views.get(key).map(|slot| slot.readers).unwrap_or(0)
    }

    /// Number of registered views.
    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Discard every view. Open handles see their view close.
    pub(crate) fn clear(&self) {
        self.views.clear();
        debug!("views cleared");
    }
}

/// A reader's hold on a view.
///
/// Dropping the handle releases the reader; the view is discarded when its
/// last handle goes away.
pub struct ViewHandle {
    key: CacheKey,
    registry: Weak<ViewRegistry>,
    rx: watch::Receiver<ViewResult>,
}

impl ViewHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The latest materialized result.
    pub fn current(&self) -> ViewResult {
        self.rx.borrow().clone()
    }

    /// Ids of the latest result, in view order.
    pub fn ids(&self) -> Vec<RecordId> {
        self.rx.borrow().iter().map(|r| r.id().clone()).collect()
    }

    /// Wait for the next recomputation and return its result.
    ///
    /// Fails with [`SyncError::Destroyed`] once the view has been discarded.
    pub async fn changed(&mut self) -> Result<ViewResult, SyncError> {
        self.rx.changed().await.map_err(|_| SyncError::Destroyed)?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

impl fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewHandle").field("key", &self.key).finish()
    }
}

impl Drop for ViewHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn scored(id: i64, score: i64) -> Record {
        Record::try_from(json!({"id": id, "score": score})).unwrap()
    }

    fn ids(result: &[Record]) -> Vec<RecordId> {
        result.iter().map(|r| r.id().clone()).collect()
    }

    #[test]
    fn test_materialize_filters_and_sorts() {
        let definition = ViewDefinition::by_field("score", Order::Descending)
            .with_filter(|r| r.get("score").and_then(|v| v.as_i64()).unwrap_or(0) > 1);
        let result = definition.materialize(vec![scored(1, 5), scored(2, 1), scored(3, 9)]);
        assert_eq!(ids(&result), vec![RecordId::Int(3), RecordId::Int(1)]);
    }

    #[test]
    fn test_sort_is_stable_for_equal_keys() {
        let definition = ViewDefinition::by_field("score", Order::Descending);
        let mut records = vec![scored(3, 1), scored(1, 1), scored(2, 7)];
        definition.sort(&mut records);
        assert_eq!(
            ids(&records),
            vec![RecordId::Int(2), RecordId::Int(3), RecordId::Int(1)]
        );
    }

    #[test]
    fn test_definition_from_query() {
        let query = QueryDescriptor::new()
            .eq("status", "active")
            .order_by("score", Order::Descending);
        let definition = ViewDefinition::from(&query);
        assert_eq!(definition.order(), Order::Descending);
        assert!(definition.accepts(&Record::try_from(json!({"id": 1, "status": "active"})).unwrap()));
        assert!(!definition.accepts(&Record::try_from(json!({"id": 1, "status": "closed"})).unwrap()));

        // Without ordering, views sort by id
        let by_id = ViewDefinition::from(&QueryDescriptor::new());
        let result = by_id.materialize(vec![scored(2, 0), scored(1, 0)]);
        assert_eq!(ids(&result), vec![RecordId::Int(1), RecordId::Int(2)]);
    }

    #[test]
    fn test_shared_key_shares_slot() {
        let store = RecordStore::new();
        store.put("tasks", scored(1, 5));
        let registry = ViewRegistry::new();

        let a = registry.acquire_list("tasks", "top", ViewDefinition::by_field("score", Order::Ascending), &store);
        let b = registry.acquire_list("tasks", "top", ViewDefinition::by_field("score", Order::Descending), &store);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.readers(a.key()), 2);
        assert_eq!(a.ids(), b.ids());

        drop(a);
        assert_eq!(registry.readers(b.key()), 1);
        drop(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_id_set_projection_only_reflects_cache() {
        let store = RecordStore::new();
        store.put("tasks", scored(2, 0));
        let registry = ViewRegistry::new();

        let view = registry
            .acquire_ids("tasks", &[RecordId::Int(3), RecordId::Int(2)], &store)
            .unwrap();
        assert_eq!(view.ids(), vec![RecordId::Int(2)]);

        store.put("tasks", scored(3, 0));
        registry.on_upsert("tasks", &scored(3, 0), &store);
        assert_eq!(view.ids(), vec![RecordId::Int(2), RecordId::Int(3)]);

        // Records outside the id set do not touch the view
        store.put("tasks", scored(4, 0));
        registry.on_upsert("tasks", &scored(4, 0), &store);
        assert_eq!(view.ids(), vec![RecordId::Int(2), RecordId::Int(3)]);
    }

    #[test]
    fn test_id_set_orders_integers_numerically() {
        let store = RecordStore::new();
        store.put("tasks", scored(2, 0));
        store.put("tasks", scored(10, 0));
        let registry = ViewRegistry::new();

        // The key sorts as text ("10,2"); the view sorts by id value
        let view = registry
            .acquire_ids("tasks", &[RecordId::Int(10), RecordId::Int(2)], &store)
            .unwrap();
        assert_eq!(view.key().to_string(), "tasks:byIds:10,2");
        assert_eq!(view.ids(), vec![RecordId::Int(2), RecordId::Int(10)]);
    }

    #[test]
    fn test_id_set_key_collision_is_rejected() {
        let store = RecordStore::new();
        store.put("tasks", scored(1, 0));
        let registry = ViewRegistry::new();

        let by_int = registry.acquire_ids("tasks", &[RecordId::Int(1)], &store).unwrap();
        assert_eq!(by_int.ids(), vec![RecordId::Int(1)]);

        // Same key, different ids: joining would hand out the wrong records
        let by_text = registry.acquire_ids("tasks", &[RecordId::from("1")], &store);
        assert!(matches!(by_text, Err(SyncError::ViewConflict { .. })));
        assert_eq!(registry.readers(by_int.key()), 1);

        // The same ids in another order join the existing slot
        let again = registry
            .acquire_ids("tasks", &[RecordId::Int(1), RecordId::Int(1)], &store)
            .unwrap();
        assert_eq!(registry.readers(again.key()), 2);

        // Once released, the other id type can take the key
        drop(by_int);
        drop(again);
        let by_text = registry.acquire_ids("tasks", &[RecordId::from("1")], &store).unwrap();
        assert!(by_text.ids().is_empty());
    }

    #[test]
    fn test_release_unknown_key_is_noop() {
        let registry = ViewRegistry::new();
        registry.release(&CacheKey::list("tasks", "gone"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handle_outlives_registry() {
        let store = RecordStore::new();
        let registry = ViewRegistry::new();
        let view = registry.acquire_list("tasks", "all", ViewDefinition::by_field("score", Order::Ascending), &store);
        drop(registry);
        // Should not panic
        drop(view);
    }

    #[tokio::test]
    async fn test_changed_fails_after_clear() {
        let store = RecordStore::new();
        let registry = ViewRegistry::new();
        let mut view = registry.acquire_list("tasks", "all", ViewDefinition::by_field("score", Order::Ascending), &store);

        registry.clear();
        assert!(matches!(view.changed().await, Err(SyncError::Destroyed)));
    }
}
