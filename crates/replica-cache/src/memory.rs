//! In-memory adapters.
//!
//! [`ChannelSource`] is a change-event source fed by hand through a
//! [`ChannelPublisher`]. [`MemoryRemote`] is a system of record held in
//! memory; it counts calls, can fail on demand and can publish the change
//! events its own writes cause, which is how a real backend behaves.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::record::ID_FIELD;
use crate::{
    ChangeEvent, ChangeEventSource, CollectionPath, QueryDescriptor, Record, RecordId,
    RemoteDataSource, RemoteError, Subscription, SyncError, ViewDefinition,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type EventSender = mpsc::UnboundedSender<Result<ChangeEvent, SyncError>>;

#[derive(Default)]
struct ChannelInner {
    subscribers: Mutex<HashMap<u64, EventSender>>,
    next_subscriber: AtomicU64,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

/// Change-event source backed by in-process channels.
#[derive(Clone, Default)]
pub struct ChannelSource {
    inner: Arc<ChannelInner>,
}

impl ChannelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for pushing events to every current subscriber.
    pub fn publisher(&self) -> ChannelPublisher {
        ChannelPublisher {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of successful `subscribe` calls.
    pub fn subscribe_count(&self) -> usize {
        self.inner.subscribes.load(Ordering::SeqCst)
    }

    /// Number of times an unsubscribe hook ran.
    pub fn unsubscribe_count(&self) -> usize {
        self.inner.unsubscribes.load(Ordering::SeqCst)
    }

    /// Number of subscriptions still attached.
    pub fn active_subscribers(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }
}

impl ChangeEventSource for ChannelSource {
    fn subscribe(&self) -> Result<Subscription, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subscribers).insert(id, tx);
        self.inner.subscribes.fetch_add(1, Ordering::SeqCst);
        debug!(subscriber = id, "channel source subscribed");

        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(rx, move || {
            lock(&inner.subscribers).remove(&id);
            inner.unsubscribes.fetch_add(1, Ordering::SeqCst);
            debug!(subscriber = id, "channel source unsubscribed");
        }))
    }
}

/// Sending side of a [`ChannelSource`].
#[derive(Clone)]
pub struct ChannelPublisher {
    inner: Arc<ChannelInner>,
}

impl ChannelPublisher {
    /// Deliver an event to every subscriber. Returns how many received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.send_each(|| Ok(event.clone()))
    }

    /// Deliver a malformed-event error to every subscriber.
    pub fn publish_malformed(&self, reason: &str) -> usize {
        self.send_each(|| Err(SyncError::MalformedEvent(reason.to_string())))
    }

    fn send_each(&self, item: impl Fn() -> Result<ChangeEvent, SyncError>) -> usize {
        let subscribers = lock(&self.inner.subscribers);
        subscribers.values().filter(|tx| tx.send(item()).is_ok()).count()
    }

    /// Close every subscriber's channel, as a source going away would.
    pub fn close(&self) {
        lock(&self.inner.subscribers).clear();
    }
}

/// Number of calls made to each [`MemoryRemote`] operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch_one: usize,
    pub fetch_many: usize,
    pub fetch_by_query: usize,
    pub insert: usize,
    pub update: usize,
    pub delete: usize,
}

#[derive(Default)]
struct RemoteInner {
    tables: Mutex<HashMap<CollectionPath, BTreeMap<RecordId, Record>>>,
    calls: Mutex<CallCounts>,
    /// Ids requested by each `fetch_many` call, in call order.
    batches: Mutex<Vec<Vec<RecordId>>>,
    fail_next: Mutex<Option<RemoteError>>,
    next_id: AtomicI64,
}

/// In-memory system of record.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<RemoteInner>,
    publisher: Option<ChannelPublisher>,
    latency: Option<Duration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the change event of every successful write to `publisher`.
    pub fn with_publisher(mut self, publisher: ChannelPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store records directly, without counting calls or publishing events.
    pub fn seed(&self, collection: &CollectionPath, records: impl IntoIterator<Item = Record>) {
        let mut tables = lock(&self.inner.tables);
        let table = tables.entry(collection.clone()).or_default();
        for record in records {
            table.insert(record.id().clone(), record);
        }
    }

    /// Fail the next call with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        *lock(&self.inner.fail_next) = Some(error);
    }

    pub fn calls(&self) -> CallCounts {
        *lock(&self.inner.calls)
    }

    /// Ids requested by each batched fetch so far.
    pub fn batches(&self) -> Vec<Vec<RecordId>> {
        lock(&self.inner.batches).clone()
    }

    /// The stored record, bypassing call accounting.
    pub fn stored(&self, collection: &CollectionPath, id: &RecordId) -> Option<Record> {
        lock(&self.inner.tables)
            .get(collection)
            .and_then(|table| table.get(id).cloned())
    }

    async fn enter(&self, count: impl FnOnce(&mut CallCounts)) -> Result<(), RemoteError> {
        count(&mut lock(&self.inner.calls));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match lock(&self.inner.fail_next).take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn emit(&self, event: ChangeEvent) {
        if let Some(publisher) = &self.publisher {
            let delivered = publisher.publish(event);
            trace!(delivered, "memory remote published change event");
        }
    }

    fn assign_id(&self, table: &BTreeMap<RecordId, Record>) -> RecordId {
        loop {
            let candidate = RecordId::Int(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            if !table.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

fn invalid(e: SyncError) -> RemoteError {
    RemoteError::Query {
        code: "invalid_record".to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl RemoteDataSource for MemoryRemote {
    async fn fetch_one(
        &self,
        collection: &CollectionPath,
        id: &RecordId,
    ) -> Result<Option<Record>, RemoteError> {
        self.enter(|c| c.fetch_one += 1).await?;
        Ok(self.stored(collection, id))
    }

    async fn fetch_many(
        &self,
        collection: &CollectionPath,
        ids: &[RecordId],
    ) -> Result<Vec<Record>, RemoteError> {
        lock(&self.inner.batches).push(ids.to_vec());
        self.enter(|c| c.fetch_many += 1).await?;
        let tables = lock(&self.inner.tables);
        let Some(table) = tables.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| table.get(id).cloned()).collect())
    }

    async fn fetch_by_query(
        &self,
        collection: &CollectionPath,
        query: &QueryDescriptor,
    ) -> Result<Vec<Record>, RemoteError> {
        self.enter(|c| c.fetch_by_query += 1).await?;
        let rows = lock(&self.inner.tables)
            .get(collection)
            .map(|table| table.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        let mut rows = ViewDefinition::from(query).materialize(rows);
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(
        &self,
        collection: &CollectionPath,
        mut fields: Map<String, Value>,
    ) -> Result<Record, RemoteError> {
        self.enter(|c| c.insert += 1).await?;
        let record = {
            let mut tables = lock(&self.inner.tables);
            let table = tables.entry(collection.clone()).or_default();
            let id = match fields.get(ID_FIELD).and_then(RecordId::from_value) {
                Some(id) => id,
                None => {
                    let id = self.assign_id(table);
                    fields.insert(ID_FIELD.to_string(), id.to_value());
                    id
                }
            };
            if table.contains_key(&id) {
                return Err(RemoteError::Query {
                    code: "duplicate_key".to_string(),
                    message: format!("{} already has a row with id {}", collection, id),
                });
            }
            let record = Record::from_fields(fields).map_err(invalid)?;
            table.insert(id, record.clone());
            record
        };
        self.emit(ChangeEvent::insert(collection.name.clone(), record.clone()));
        Ok(record)
    }

    async fn update(
        &self,
        collection: &CollectionPath,
        id: &RecordId,
        fields: Map<String, Value>,
    ) -> Result<Record, RemoteError> {
        self.enter(|c| c.update += 1).await?;
        let (record, old) = {
            let mut tables = lock(&self.inner.tables);
            let Some(existing) = tables.get_mut(collection).and_then(|t| t.get_mut(id)) else {
                return Err(RemoteError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            };
            let mut merged = existing.fields().clone();
            for (field, value) in fields {
                if field != ID_FIELD {
                    merged.insert(field, value);
                }
            }
            let record = Record::from_fields(merged).map_err(invalid)?;
            let old = std::mem::replace(existing, record.clone());
            (record, old)
        };
        self.emit(ChangeEvent::Update {
            collection: collection.name.clone(),
            record: record.clone(),
            old_record: Some(old.into_value()),
        });
        Ok(record)
    }

    async fn delete(&self, collection: &CollectionPath, id: &RecordId) -> Result<(), RemoteError> {
        self.enter(|c| c.delete += 1).await?;
        let removed = lock(&self.inner.tables)
            .get_mut(collection)
            .and_then(|table| table.remove(id));
        let Some(removed) = removed else {
            return Err(RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        self.emit(ChangeEvent::Delete {
            collection: collection.name.clone(),
            id: id.clone(),
            old_record: Some(removed.into_value()),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FilterOp, Order};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tasks() -> CollectionPath {
        CollectionPath::new("public", "tasks")
    }

    fn record(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_channel_source_fans_out() {
        let source = ChannelSource::new();
        let publisher = source.publisher();
        let mut a = source.subscribe().unwrap();
        let mut b = source.subscribe().unwrap();

        assert_eq!(publisher.publish(ChangeEvent::delete("tasks", 1)), 2);
        assert!(a.recv().await.unwrap().is_ok());
        assert!(b.recv().await.unwrap().is_ok());

        a.unsubscribe();
        assert_eq!(source.unsubscribe_count(), 1);
        assert_eq!(source.active_subscribers(), 1);
        assert_eq!(publisher.publish(ChangeEvent::delete("tasks", 2)), 1);

        publisher.close();
        assert!(b.recv().await.unwrap().is_ok());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_publishes() {
        let source = ChannelSource::new();
        let mut events = source.subscribe().unwrap();
        let remote = MemoryRemote::new().with_publisher(source.publisher());

        let created = remote.insert(&tasks(), fields(json!({"title": "a"}))).await.unwrap();
        assert_eq!(created.id(), &RecordId::Int(1));

        match events.recv().await.unwrap().unwrap() {
            ChangeEvent::Insert { collection, record } => {
                assert_eq!(collection, "tasks");
                assert_eq!(record, created);
            }
            other => panic!("expected Insert, got {:?}", other),
        }

        let duplicate = remote.insert(&tasks(), fields(json!({"id": 1}))).await;
        assert!(matches!(duplicate, Err(RemoteError::Query { .. })));
    }

    #[tokio::test]
    async fn test_update_patches_fields() {
        let remote = MemoryRemote::new();
        remote.seed(&tasks(), [record(json!({"id": 1, "title": "a", "done": false}))]);

        let updated = remote
            .update(&tasks(), &RecordId::Int(1), fields(json!({"done": true})))
            .await
            .unwrap();
        assert_eq!(updated.get("title"), Some(&json!("a")));
        assert_eq!(updated.get("done"), Some(&json!(true)));

        let missing = remote
            .update(&tasks(), &RecordId::Int(2), fields(json!({"done": true})))
            .await;
        assert!(matches!(missing, Err(RemoteError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_query_filters_sorts_and_limits() {
        let remote = MemoryRemote::new();
        remote.seed(
            &tasks(),
            [
                record(json!({"id": 1, "score": 3, "status": "open"})),
                record(json!({"id": 2, "score": 9, "status": "open"})),
                record(json!({"id": 3, "score": 5, "status": "done"})),
                record(json!({"id": 4, "score": 7, "status": "open"})),
            ],
        );

        let query = QueryDescriptor::new()
            .eq("status", "open")
            .filter("score", FilterOp::Gt, 1)
            .order_by("score", Order::Descending)
            .limit(2);
        let rows = remote.fetch_by_query(&tasks(), &query).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id().clone()).collect();
        assert_eq!(ids, vec![RecordId::Int(2), RecordId::Int(4)]);
        assert_eq!(remote.calls().fetch_by_query, 1);
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let remote = MemoryRemote::new();
        remote.fail_next(RemoteError::Transport("down".to_string()));

        assert!(remote.fetch_one(&tasks(), &RecordId::Int(1)).await.is_err());
        assert_eq!(remote.fetch_one(&tasks(), &RecordId::Int(1)).await.unwrap(), None);
        assert_eq!(remote.calls().fetch_one, 2);
    }

    #[tokio::test]
    async fn test_namespaces_are_separate() {
        let remote = MemoryRemote::new();
        remote.seed(&tasks(), [record(json!({"id": 1}))]);

        let other = CollectionPath::new("archive", "tasks");
        assert_eq!(remote.fetch_one(&other, &RecordId::Int(1)).await.unwrap(), None);
        assert!(remote.delete(&other, &RecordId::Int(1)).await.is_err());
    }
}
