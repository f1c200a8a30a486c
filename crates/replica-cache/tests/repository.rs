//! End-to-end tests for the repository facade.
//!
//! Each test wires a [`Repository`] to an in-memory remote and a channel
//! source and checks behavior from the caller's side.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tokio::time::timeout;

use replica_cache::memory::{ChannelPublisher, ChannelSource, MemoryRemote};
use replica_cache::{
    CacheKey, CacheUpdate, ChangeEvent, CollectionPath, Order, QueryDescriptor, Record, RecordId,
    RemoteError, Repository, SyncError, SyncState, ViewDefinition,
};

const WAIT: Duration = Duration::from_secs(2);

fn record(value: Value) -> Record {
    Record::try_from(value).unwrap()
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn tasks() -> CollectionPath {
    CollectionPath::new("public", "tasks")
}

struct Fixture {
    repo: Repository,
    remote: MemoryRemote,
    source: ChannelSource,
    publisher: ChannelPublisher,
    updates: broadcast::Receiver<CacheUpdate>,
}

impl Fixture {
    fn new() -> Self {
        let source = ChannelSource::new();
        let publisher = source.publisher();
        let remote = MemoryRemote::new().with_publisher(publisher.clone());
        let repo = Repository::builder(Arc::new(remote.clone()))
            .event_source(Arc::new(source.clone()))
            .build()
            .unwrap();
        let updates = repo.subscribe_updates().unwrap();
        Self {
            repo,
            remote,
            source,
            publisher,
            updates,
        }
    }

    /// Publish an event and wait until the store has applied it.
    async fn deliver(&mut self, event: ChangeEvent) {
        assert_eq!(self.publisher.publish(event), 1);
        self.settle().await;
    }

    /// Wait for the next store mutation.
    async fn settle(&mut self) -> CacheUpdate {
        timeout(WAIT, self.updates.recv())
            .await
            .expect("store update timed out")
            .expect("update channel open")
    }
}

#[tokio::test]
async fn test_scores_descending_end_to_end() {
    let mut fx = Fixture::new();
    let view = fx
        .repo
        .watch_view("tasks", "by_score", ViewDefinition::by_field("score", Order::Descending))
        .unwrap();

    fx.deliver(ChangeEvent::insert("tasks", record(json!({"id": 1, "score": 5}))))
        .await;
    fx.deliver(ChangeEvent::insert("tasks", record(json!({"id": 2, "score": 10}))))
        .await;
    assert_eq!(view.ids(), vec![RecordId::Int(2), RecordId::Int(1)]);

    fx.deliver(ChangeEvent::update("tasks", record(json!({"id": 1, "score": 20}))))
        .await;
    assert_eq!(view.ids(), vec![RecordId::Int(1), RecordId::Int(2)]);
}

#[tokio::test]
async fn test_view_reemits_on_recompute() {
    let fx = Fixture::new();
    let mut view = fx
        .repo
        .watch_view("tasks", "all", ViewDefinition::by_field("id", Order::Ascending))
        .unwrap();

    fx.publisher
        .publish(ChangeEvent::insert("tasks", record(json!({"id": 3}))));
    let result = timeout(WAIT, view.changed()).await.unwrap().unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].id(), &RecordId::Int(3));
}

#[tokio::test]
async fn test_delete_event_removes_from_view_and_store() {
    let mut fx = Fixture::new();
    fx.remote.seed(&tasks(), [record(json!({"id": 5, "status": "open"}))]);

    let view = fx
        .repo
        .watch_list("open", "tasks", &QueryDescriptor::new().eq("status", "open"))
        .await
        .unwrap();
    assert_eq!(view.ids(), vec![RecordId::Int(5)]);
    // Drain the write from the fetch
    fx.settle().await;

    fx.deliver(ChangeEvent::delete("tasks", 5)).await;
    assert!(view.ids().is_empty());
    assert_eq!(fx.repo.get_from_cache_only("tasks", &RecordId::Int(5)).unwrap(), None);
}

#[tokio::test]
async fn test_update_out_of_filter_leaves_view() {
    let mut fx = Fixture::new();
    fx.remote
        .seed(&tasks(), [record(json!({"id": 9, "status": "active"}))]);

    let view = fx
        .repo
        .watch_list("active", "tasks", &QueryDescriptor::new().eq("status", "active"))
        .await
        .unwrap();
    fx.settle().await;
    assert_eq!(view.ids(), vec![RecordId::Int(9)]);

    fx.deliver(ChangeEvent::update(
        "tasks",
        record(json!({"id": 9, "status": "closed"})),
    ))
    .await;
    assert!(view.ids().is_empty());
    let cached = fx.repo.get_from_cache_only("tasks", &RecordId::Int(9)).unwrap();
    assert_eq!(cached.unwrap().get("status"), Some(&json!("closed")));
}

#[tokio::test]
async fn test_batch_key_ignores_input_order() {
    let fx = Fixture::new();
    fx.remote.seed(
        &tasks(),
        [record(json!({"id": 1})), record(json!({"id": 2}))],
    );

    let a = fx
        .repo
        .watch_ids("tasks", &[RecordId::Int(2), RecordId::Int(1)])
        .await
        .unwrap();
    let b = fx
        .repo
        .watch_ids("tasks", &[RecordId::Int(1), RecordId::Int(2)])
        .await
        .unwrap();

    assert_eq!(a.key(), b.key());
    assert_eq!(
        a.key(),
        &CacheKey::by_ids("tasks", &[RecordId::Int(1), RecordId::Int(2)])
    );
    assert_eq!(a.current(), b.current());
    assert_eq!(fx.repo.views().len(), 1);
    // Second call was fully cached
    assert_eq!(fx.remote.calls().fetch_many, 1);
}

#[tokio::test]
async fn test_partial_hit_compaction() {
    let mut fx = Fixture::new();
    fx.deliver(ChangeEvent::insert("tasks", record(json!({"id": 1}))))
        .await;
    fx.remote.seed(&tasks(), [record(json!({"id": 2}))]);

    let result = fx
        .repo
        .fetch_by_ids("tasks", &[RecordId::Int(1), RecordId::Int(2), RecordId::Int(3)])
        .await
        .unwrap();

    let ids: Vec<_> = result.iter().map(|r| r.id().clone()).collect();
    assert_eq!(ids, vec![RecordId::Int(1), RecordId::Int(2)]);
    assert_eq!(fx.remote.batches(), vec![vec![RecordId::Int(2), RecordId::Int(3)]]);
    assert!(fx.repo.get_from_cache_only("tasks", &RecordId::Int(1)).unwrap().is_some());
    assert!(fx.repo.get_from_cache_only("tasks", &RecordId::Int(2)).unwrap().is_some());
}

#[tokio::test]
async fn test_id_set_view_waits_for_cache() {
    let mut fx = Fixture::new();
    let view = fx
        .repo
        .watch_ids("tasks", &[RecordId::Int(7)])
        .await
        .unwrap();
    assert!(view.ids().is_empty());

    // Populated by an event, not by a fetch
    fx.deliver(ChangeEvent::insert("tasks", record(json!({"id": 7}))))
        .await;
    assert_eq!(view.ids(), vec![RecordId::Int(7)]);
}

#[tokio::test]
async fn test_writes_reach_cache_only_through_events() {
    let mut fx = Fixture::new();
    let view = fx
        .repo
        .watch_view("tasks", "all", ViewDefinition::by_field("id", Order::Ascending))
        .unwrap();

    let created = fx
        .repo
        .create("tasks", fields(json!({"title": "write docs"})))
        .await
        .unwrap();
    // The remote published the insert; wait for it to land
    fx.settle().await;
    assert_eq!(view.ids(), vec![created.id().clone()]);

    fx.repo
        .update("tasks", created.id(), fields(json!({"title": "write more docs"})))
        .await
        .unwrap();
    fx.settle().await;
    let cached = fx.repo.get_from_cache_only("tasks", created.id()).unwrap().unwrap();
    assert_eq!(cached.get("title"), Some(&json!("write more docs")));

    fx.repo.delete("tasks", created.id()).await.unwrap();
    fx.settle().await;
    assert!(view.ids().is_empty());
}

#[tokio::test]
async fn test_writes_without_events_leave_cache_untouched() {
    let remote = MemoryRemote::new();
    let repo = Repository::builder(Arc::new(remote.clone())).build().unwrap();
    assert_eq!(repo.sync_state(), SyncState::Offline);

    let created = repo
        .create("tasks", fields(json!({"id": 1, "title": "a"})))
        .await
        .unwrap();
    assert_eq!(created.id(), &RecordId::Int(1));
    assert_eq!(repo.get_from_cache_only("tasks", &RecordId::Int(1)).unwrap(), None);
    assert!(remote.stored(&tasks(), &RecordId::Int(1)).is_some());
}

#[tokio::test]
async fn test_remote_write_errors_surface() {
    let fx = Fixture::new();
    let result = fx
        .repo
        .update("tasks", &RecordId::Int(404), fields(json!({"title": "x"})))
        .await;
    assert!(matches!(
        result,
        Err(SyncError::Remote(RemoteError::NotFound { .. }))
    ));
}

#[tokio::test]
async fn test_cache_only_read_never_fetches() {
    let fx = Fixture::new();
    fx.remote.seed(&tasks(), [record(json!({"id": 1}))]);

    assert_eq!(fx.repo.get_from_cache_only("tasks", &RecordId::Int(1)).unwrap(), None);
    assert_eq!(fx.remote.calls().fetch_one, 0);
}

#[tokio::test]
async fn test_malformed_event_halts_sync() {
    let mut fx = Fixture::new();
    let mut state = fx.repo.watch_sync_state();
    assert_eq!(fx.repo.sync_state(), SyncState::Live);

    fx.publisher.publish_malformed("unrecognized operation \"TRUNCATE\"");
    timeout(WAIT, state.wait_for(|s| *s == SyncState::Halted))
        .await
        .unwrap()
        .unwrap();

    // Later events are no longer applied
    fx.publisher
        .publish(ChangeEvent::insert("tasks", record(json!({"id": 1}))));
    assert!(timeout(Duration::from_millis(100), fx.updates.recv()).await.is_err());
    assert_eq!(fx.repo.get_from_cache_only("tasks", &RecordId::Int(1)).unwrap(), None);
}

#[tokio::test]
async fn test_source_close_goes_offline() {
    let fx = Fixture::new();
    let mut state = fx.repo.watch_sync_state();

    fx.publisher.close();
    timeout(WAIT, state.wait_for(|s| *s == SyncState::Offline))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_destroy_unsubscribes_once_and_clears() {
    let mut fx = Fixture::new();
    fx.deliver(ChangeEvent::insert("tasks", record(json!({"id": 1}))))
        .await;
    let view = fx
        .repo
        .watch_view("tasks", "all", ViewDefinition::by_field("id", Order::Ascending))
        .unwrap();
    assert_eq!(view.ids(), vec![RecordId::Int(1)]);

    fx.repo.destroy();
    fx.repo.destroy();

    assert_eq!(fx.source.unsubscribe_count(), 1);
    assert!(fx.repo.store().is_empty());
    assert!(fx.repo.views().is_empty());
    assert!(matches!(
        fx.repo.fetch_by_id("tasks", &RecordId::Int(1)).await,
        Err(SyncError::Destroyed)
    ));
    // Dropping a handle into a destroyed repository must not panic
    drop(view);
}

#[tokio::test]
async fn test_destroy_during_fetch_drops_late_write() {
    let remote = MemoryRemote::new().with_latency(Duration::from_millis(50));
    remote.seed(&tasks(), [record(json!({"id": 1}))]);
    let repo = Arc::new(Repository::builder(Arc::new(remote)).build().unwrap());

    let fetch = {
        let repo = Arc::clone(&repo);
        tokio::spawn(async move { repo.fetch_by_id("tasks", &RecordId::Int(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    repo.destroy();

    // The fetch completes without panicking; nothing is cached
    let result = fetch.await.unwrap();
    assert!(result.is_ok());
    assert!(repo.store().is_empty());
}

#[tokio::test]
async fn test_events_after_view_dropped_are_harmless() {
    let mut fx = Fixture::new();
    let view = fx
        .repo
        .watch_view("tasks", "all", ViewDefinition::by_field("id", Order::Ascending))
        .unwrap();
    let key = view.key().clone();
    drop(view);
    assert_eq!(fx.repo.views().readers(&key), 0);

    fx.deliver(ChangeEvent::insert("tasks", record(json!({"id": 1}))))
        .await;
    assert!(fx.repo.views().is_empty());
}

#[tokio::test]
async fn test_store_writes_always_reach_views() {
    let fx = Fixture::new();
    let view = fx
        .repo
        .watch_view("tasks", "all", ViewDefinition::by_field("id", Order::Ascending))
        .unwrap();
    fx.remote.seed(&tasks(), [record(json!({"id": 1})), record(json!({"id": 2}))]);

    // Reads are the only writes a caller can cause; the store itself is
    // read-only from here
    fx.repo.fetch_by_id("tasks", &RecordId::Int(2)).await.unwrap();
    fx.repo
        .fetch_by_ids("tasks", &[RecordId::Int(1)])
        .await
        .unwrap();

    let cached: Vec<Record> = fx.repo.store().list("tasks");
    assert_eq!(cached.len(), 2);
    assert_eq!(view.current().to_vec(), cached, "view drifted from store");
}

#[tokio::test]
async fn test_id_set_views_keep_id_types_apart() {
    let fx = Fixture::new();
    fx.remote.seed(&tasks(), [record(json!({"id": 1}))]);

    let by_int = fx.repo.watch_ids("tasks", &[RecordId::Int(1)]).await.unwrap();
    assert_eq!(by_int.ids(), vec![RecordId::Int(1)]);

    // "1" shares the key but names another row; it must not see the int row
    let by_text = fx.repo.watch_ids("tasks", &[RecordId::from("1")]).await;
    assert!(matches!(by_text, Err(SyncError::ViewConflict { .. })));
}
