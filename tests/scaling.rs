//! Scaling tests for live views over larger collections.
//!
//! Measures the cost of the operations that grow with load:
//! - Initial snapshots over many documents
//! - Fan-out of one feed to many emitters
//! - Sort reconciliation of large batches
//! - Registry churn

use live_cursor::{
    Document, DocumentId, DocumentStore, EngineConfig, LiveQuery, MemoryStore, Pipeline,
    QueryOptions, SortDirection, StreamChunk, SubscriptionRegistry,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DOC_COUNT: usize = 5_000;

fn test_registry(store: &Arc<MemoryStore>) -> SubscriptionRegistry {
    SubscriptionRegistry::new(
        Arc::clone(store),
        EngineConfig {
            coalesce_window: Duration::from_millis(40),
            max_coalesce_delay: Duration::from_millis(400),
            subscriber_buffer: 0,
        },
    )
}

fn populate(store: &MemoryStore, collection: &str, count: usize) {
    let kinds = ["message", "tool_call", "tool_result", "state_update", "system"];
    for i in 0..count {
        store
            .insert(
                collection,
                Document::new(
                    format!("doc-{:06}", i),
                    json!({
                        "kind": kinds[i % kinds.len()],
                        "index": i,
                        "score": (i * 7919) % 1000,
                    }),
                ),
            )
            .unwrap();
    }
}

fn settle(query: &LiveQuery, quiet: Duration) -> Vec<StreamChunk> {
    let mut out = Vec::new();
    while let Ok(chunk) = query.recv_timeout(quiet) {
        out.push(chunk);
    }
    out
}

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report(&self) {
        println!("  {} took {:.2}ms", self.name, self.elapsed_ms());
    }

    fn report_with_count(&self, count: usize) {
        let ms = self.elapsed_ms();
        let per_item = if count > 0 { ms / count as f64 } else { 0.0 };
        println!(
            "  {} took {:.2}ms ({} items, {:.4}ms/item)",
            self.name, ms, count, per_item
        );
    }
}

// =============================================================================
// Test: initial snapshot of a large sorted window
// =============================================================================

#[test]
fn test_scaling_initial_snapshot() {
    println!("\n=== Initial snapshot, {} documents ===", DOC_COUNT);

    let store = Arc::new(MemoryStore::new());
    let timer = Timer::new("Populate");
    populate(&store, "records", DOC_COUNT);
    timer.report_with_count(DOC_COUNT);

    let registry = test_registry(&store);
    let options = QueryOptions::new()
        .filter(json!({"kind": {"$in": ["message", "system"]}}))
        .sort("score", SortDirection::Desc)
        .limit(500);

    let timer = Timer::new("Find + initial snapshot");
    let query = registry.find("records", &options).unwrap();
    let chunks = settle(&query, Duration::from_millis(200));
    timer.report_with_count(chunks.len());

    assert_eq!(chunks.len(), 501);
    assert_eq!(chunks.last(), Some(&StreamChunk::EndOfInitial));
    let members = registry.membership("records", &options).unwrap().unwrap();
    assert_eq!(members.len(), 500);

    println!("  ✓ Initial snapshot test passed");
}

// =============================================================================
// Test: one feed fanned out to many emitters
// =============================================================================

#[test]
fn test_scaling_many_emitters_one_feed() {
    println!("\n=== 100 emitters on one collection ===");

    let store = Arc::new(MemoryStore::new());
    let registry = test_registry(&store);
    let emitter_count = 100;

    let timer = Timer::new("Create emitters");
    let queries: Vec<LiveQuery> = (0..emitter_count)
        .map(|i| {
            let options = QueryOptions::new().filter(json!({"bucket": i % 10, "seq": {"$gte": i}}));
            registry.find("events", &options).unwrap()
        })
        .collect();
    timer.report_with_count(emitter_count);
    assert_eq!(registry.emitter_count(), emitter_count);
    assert_eq!(registry.feed_count(), 1);
    assert_eq!(store.feeds_opened(), 1);

    for query in &queries {
        settle(query, Duration::from_millis(20));
    }

    let writes = 1_000;
    let timer = Timer::new("Write while fanning out");
    for i in 0..writes {
        store
            .insert(
                "events",
                Document::new(format!("e{}", i), json!({"bucket": i % 10, "seq": i})),
            )
            .unwrap();
    }
    timer.report_with_count(writes);

    let timer = Timer::new("Drain all emitters");
    let mut delivered = 0;
    for (i, query) in queries.iter().enumerate() {
        let chunks = settle(query, Duration::from_millis(100));
        // Bucket i % 10 gets one write in ten, from sequence number i onward.
        let expected = (i..writes).filter(|s| s % 10 == i % 10).count();
        assert_eq!(chunks.len(), expected, "emitter {}", i);
        delivered += chunks.len();
    }
    timer.report_with_count(delivered);

    println!("  ✓ Fan-out test passed");
}

// =============================================================================
// Test: one reconciliation for a large burst
// =============================================================================

#[test]
fn test_scaling_sorted_burst() {
    println!("\n=== Sorted burst of 2000 inserts ===");

    let store = Arc::new(MemoryStore::new());
    populate(&store, "records", 1_000);
    let registry = test_registry(&store);
    let options = QueryOptions::new()
        .sort("score", SortDirection::Asc)
        .limit(100);
    let query = registry.find("records", &options).unwrap();
    settle(&query, Duration::from_millis(200));

    let timer = Timer::new("Burst insert");
    for i in 0..2_000 {
        store
            .insert(
                "records",
                Document::new(format!("burst-{}", i), json!({"score": (i * 31) % 1000})),
            )
            .unwrap();
    }
    timer.report_with_count(2_000);

    let timer = Timer::new("Reconcile");
    let chunks = settle(&query, Duration::from_millis(600));
    timer.report();

    let orders = chunks.iter().filter(|c| c.kind() == "order").count();
    assert!(orders >= 1);

    let members = registry.membership("records", &options).unwrap().unwrap();
    assert_eq!(members.len(), 100);
    let expected: Vec<DocumentId> = {
        let pipeline = Pipeline::from_options(&options).unwrap();
        store
            .aggregate("records", &pipeline)
            .unwrap()
            .into_iter()
            .map(|d| d.id().clone())
            .collect()
    };
    assert_eq!(members, expected);

    println!("  ✓ Sorted burst test passed");
}

// =============================================================================
// Test: registry churn
// =============================================================================

#[test]
fn test_scaling_registry_churn() {
    println!("\n=== Registry churn ===");

    let store = Arc::new(MemoryStore::new());
    populate(&store, "records", 100);
    let registry = test_registry(&store);

    let timer = Timer::new("Find/remove 500 times");
    for i in 0..500 {
        let options = QueryOptions::new().limit(i % 7 + 1);
        let query = registry.find("records", &options).unwrap();
        drop(query);
        assert!(registry.remove_emitter("records", &options).unwrap());
    }
    timer.report_with_count(500);

    assert_eq!(registry.emitter_count(), 0);
    assert_eq!(registry.feed_count(), 0);
    assert_eq!(store.open_feeds(), 0);
    assert_eq!(store.feeds_opened(), 500);

    println!("  ✓ Churn test passed");
}
