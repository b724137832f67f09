//! Error handling tests: failing snapshots, feeds and reconciliations.

use live_cursor::{
    ChangeFeed, Document, DocumentId, DocumentKey, DocumentStore, EngineConfig, LiveError,
    LiveQuery, MemoryStore, OperationType, Pipeline, QueryOptions, RawChange, SortDirection,
    StreamChunk, SubscriptionRegistry,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(300);

fn test_registry() -> (Arc<MemoryStore>, SubscriptionRegistry) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Arc::new(MemoryStore::new());
    let registry = SubscriptionRegistry::new(
        Arc::clone(&store),
        EngineConfig {
            coalesce_window: Duration::from_millis(40),
            max_coalesce_delay: Duration::from_millis(200),
            subscriber_buffer: 0,
        },
    );
    (store, registry)
}

fn settle(query: &LiveQuery) -> Vec<StreamChunk> {
    let mut out = Vec::new();
    while let Ok(chunk) = query.recv_timeout(QUIET) {
        out.push(chunk);
    }
    out
}

fn kinds(chunks: &[StreamChunk]) -> Vec<&'static str> {
    chunks.iter().map(StreamChunk::kind).collect()
}

fn is_closed(query: &LiveQuery) -> bool {
    matches!(
        query.recv_timeout(Duration::from_millis(50)),
        Err(crossbeam_channel::RecvTimeoutError::Disconnected)
    )
}

// --- Query validation ---

#[test]
fn test_invalid_filter_operator() {
    let (store, registry) = test_registry();
    let options = QueryOptions::new().filter(json!({"age": {"$regex": "^4"}}));

    let result = registry.find("people", &options);
    match result {
        Err(LiveError::InvalidFilter(msg)) => assert!(msg.contains("$regex")),
        Err(other) => panic!("Expected InvalidFilter, got {:?}", other),
        Ok(_) => panic!("Expected InvalidFilter, got a stream"),
    }
    assert_eq!(registry.emitter_count(), 0);
    assert_eq!(store.feeds_opened(), 0);
}

#[test]
fn test_filter_must_be_an_object() {
    let (_store, registry) = test_registry();
    let options = QueryOptions::new().filter(json!(["status", "active"]));
    assert!(matches!(
        registry.find("people", &options),
        Err(LiveError::InvalidFilter(_))
    ));
}

#[test]
fn test_find_after_shutdown() {
    let (_store, registry) = test_registry();
    registry.shutdown();
    assert!(matches!(
        registry.find("people", &QueryOptions::new()),
        Err(LiveError::ShutDown)
    ));
}

// --- Initial snapshot ---

#[test]
fn test_initial_snapshot_failure_is_retried_by_next_subscriber() {
    let (store, registry) = test_registry();
    store
        .insert("people", Document::new("p1", json!({"name": "ada"})))
        .unwrap();
    store.fail_aggregations("people", Some("disk on fire"));

    let options = QueryOptions::new();
    let first = registry.find("people", &options).unwrap();
    let chunks = settle(&first);
    assert_eq!(kinds(&chunks), vec!["error"]);
    match &chunks[0] {
        StreamChunk::Error { message } => assert!(message.contains("disk on fire")),
        _ => unreachable!(),
    }
    assert!(is_closed(&first));
    assert!(registry.does_emitter_exist("people", &options));

    store.fail_aggregations("people", None);
    let second = registry.find("people", &options).unwrap();
    assert_eq!(kinds(&settle(&second)), vec!["initial", "end_of_initial"]);
    assert_eq!(registry.emitter_count(), 1);
    assert_eq!(store.feeds_opened(), 1);
}

// --- Change feed ---

#[test]
fn test_feed_failure_ends_every_view_on_the_collection() {
    let (store, registry) = test_registry();
    let a = QueryOptions::new();
    let b = QueryOptions::new().limit(5);
    let qa = registry.find("people", &a).unwrap();
    let qb = registry.find("people", &b).unwrap();
    settle(&qa);
    settle(&qb);

    store.fail_feeds("people", "cursor killed");
    for query in [&qa, &qb] {
        let chunks = settle(query);
        assert_eq!(kinds(&chunks), vec!["error"]);
        assert!(is_closed(query));
    }

    // The next find replaces both the dead emitter and the dead feed.
    store
        .insert("people", Document::new("p1", json!({})))
        .unwrap();
    let again = registry.find("people", &a).unwrap();
    assert_eq!(kinds(&settle(&again)), vec!["initial", "end_of_initial"]);
    assert_eq!(store.feeds_opened(), 2);

    store
        .insert("people", Document::new("p2", json!({})))
        .unwrap();
    assert_eq!(kinds(&settle(&again)), vec!["insert"]);
}

#[test]
fn test_drop_collection_ends_stream_without_error() {
    let (store, registry) = test_registry();
    store
        .insert("people", Document::new("p1", json!({})))
        .unwrap();
    let query = registry.find("people", &QueryOptions::new()).unwrap();
    settle(&query);

    store.drop_collection("people");
    assert!(settle(&query).is_empty());
    assert!(is_closed(&query));
}

#[test]
fn test_malformed_changes_are_ignored() {
    let (store, registry) = test_registry();
    store
        .insert("people", Document::new("p1", json!({"n": 1})))
        .unwrap();
    let options = QueryOptions::new().filter(json!({"n": 1}));
    let query = registry.find("people", &options).unwrap();
    settle(&query);

    // An update whose document was deleted before the lookup.
    store.emit_change(
        "people",
        RawChange {
            id: 9000,
            operation_type: OperationType::Update,
            document_key: Some(DocumentKey { id: "p1".into() }),
            update_description: None,
            full_document: None,
        },
    );
    // A delete with no key at all.
    store.emit_change(
        "people",
        RawChange {
            id: 9001,
            operation_type: OperationType::Delete,
            document_key: None,
            update_description: None,
            full_document: None,
        },
    );

    assert!(settle(&query).is_empty());
    assert_eq!(
        registry.membership("people", &options).unwrap(),
        Some(vec![DocumentId::from("p1")])
    );
}

// --- Reconciliation and backfill ---

#[test]
fn test_reconciliation_failure_is_terminal() {
    let (store, registry) = test_registry();
    let options = QueryOptions::new().sort("rank", SortDirection::Asc);
    let query = registry.find("people", &options).unwrap();
    settle(&query);

    store.fail_aggregations("people", Some("timeout"));
    store
        .insert("people", Document::new("p1", json!({"rank": 1})))
        .unwrap();

    let chunks = settle(&query);
    assert_eq!(kinds(&chunks).last(), Some(&"error"));
    assert!(is_closed(&query));
}

#[test]
fn test_backfill_failure_keeps_the_stream() {
    let (store, registry) = test_registry();
    for id in ["a", "b"] {
        store.insert("people", Document::new(id, json!({}))).unwrap();
    }
    let options = QueryOptions::new().limit(1);
    let query = registry.find("people", &options).unwrap();
    assert_eq!(kinds(&settle(&query)), vec!["initial", "end_of_initial"]);

    store.fail_aggregations("people", Some("flaky"));
    store.delete("people", &"a".into()).unwrap();
    assert_eq!(kinds(&settle(&query)), vec!["delete", "error"]);

    store.fail_aggregations("people", None);
    store.insert("people", Document::new("c", json!({}))).unwrap();
    let chunks = settle(&query);
    assert_eq!(kinds(&chunks), vec!["insert"]);
    assert_eq!(chunks[0].document_id(), Some(&DocumentId::from("c")));
}

// --- Slow subscribers ---

#[test]
fn test_slow_subscriber_gets_error_then_is_dropped() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Arc::new(MemoryStore::new());
    let registry = SubscriptionRegistry::new(
        Arc::clone(&store),
        EngineConfig {
            subscriber_buffer: 4,
            ..Default::default()
        },
    );
    let options = QueryOptions::new();
    let slow = registry.find("people", &options).unwrap();

    for i in 0..20 {
        store
            .insert("people", Document::new(format!("p{}", i), json!({})))
            .unwrap();
    }
    std::thread::sleep(Duration::from_millis(200));

    // The snapshot, four live chunks, then the reason the stream ended.
    let received: Vec<StreamChunk> = slow.iter().collect();
    assert_eq!(
        kinds(&received),
        vec!["end_of_initial", "insert", "insert", "insert", "insert", "error"]
    );

    // The emitter keeps tracking the view without it.
    assert!(registry.does_emitter_exist("people", &options));
    let members = registry.membership("people", &options).unwrap().unwrap();
    assert_eq!(members.len(), 20);
}

#[test]
fn test_large_snapshot_is_never_cut_short() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Arc::new(MemoryStore::new());
    let registry = SubscriptionRegistry::new(Arc::clone(&store), EngineConfig::default());
    for i in 0..1_500 {
        store
            .insert("people", Document::new(format!("p{:04}", i), json!({"n": i})))
            .unwrap();
    }
    let options = QueryOptions::new();

    // Nobody reads until both snapshots are fully queued.
    let first = registry.find("people", &options).unwrap();
    let second = registry.find("people", &options).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    store
        .insert("people", Document::new("late", json!({})))
        .unwrap();

    for query in [&first, &second] {
        let chunks = settle(query);
        assert_eq!(chunks.len(), 1_502);
        assert_eq!(chunks[1_500], StreamChunk::EndOfInitial);
        assert_eq!(chunks[1_501].document_id(), Some(&DocumentId::from("late")));
    }
}

// --- Worker panics ---

/// Store whose next aggregation panics once armed.
struct PanickingStore {
    inner: MemoryStore,
    armed: AtomicBool,
}

impl DocumentStore for PanickingStore {
    fn aggregate(
        &self,
        collection: &str,
        pipeline: &Pipeline,
    ) -> live_cursor::Result<Vec<Document>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("aggregation blew up");
        }
        self.inner.aggregate(collection, pipeline)
    }

    fn watch(&self, collection: &str) -> live_cursor::Result<ChangeFeed> {
        self.inner.watch(collection)
    }
}

#[test]
fn test_panicked_emitter_is_replaced() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Arc::new(PanickingStore {
        inner: MemoryStore::new(),
        armed: AtomicBool::new(false),
    });
    for id in ["a", "b"] {
        store
            .inner
            .insert("people", Document::new(id, json!({})))
            .unwrap();
    }
    let registry = SubscriptionRegistry::new(
        Arc::clone(&store),
        EngineConfig {
            coalesce_window: Duration::from_millis(40),
            max_coalesce_delay: Duration::from_millis(200),
            subscriber_buffer: 0,
        },
    );
    let options = QueryOptions::new().limit(1);
    let query = registry.find("people", &options).unwrap();
    assert_eq!(kinds(&settle(&query)), vec!["initial", "end_of_initial"]);

    // The delete triggers a backfill query, which panics inside the worker.
    store.armed.store(true, Ordering::SeqCst);
    store.inner.delete("people", &"a".into()).unwrap();

    let chunks = settle(&query);
    assert_eq!(kinds(&chunks), vec!["delete", "error"]);
    assert!(is_closed(&query));

    let rebuilt = registry.find("people", &options).unwrap();
    let chunks = settle(&rebuilt);
    assert_eq!(kinds(&chunks), vec!["initial", "end_of_initial"]);
    assert_eq!(chunks[0].document_id(), Some(&DocumentId::from("b")));
    assert_eq!(registry.emitter_count(), 1);
}
