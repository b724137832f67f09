//! # Live Cursor
//!
//! Live, per-query views over a document collection and its change feed.
//!
//! ## Core Concepts
//!
//! - **Emitters**: One per distinct query; classify changes against
//!   filter/sort/skip/limit and emit result chunks
//! - **Feeds**: One change feed per collection, fanned out to its emitters
//! - **Registry**: Reference-counts emitters and owns their lifetimes
//! - **Reconciliation**: Coalesced re-ranking of sorted views
//!
//! ## Example
//!
//! ```ignore
//! use live_cursor::{MemoryStore, QueryOptions, SubscriptionRegistry, Document};
//!
//! let store = Arc::new(MemoryStore::new());
//! let registry = SubscriptionRegistry::with_defaults(Arc::clone(&store));
//!
//! let options = QueryOptions::new().filter(json!({"status": "active"})).limit(2);
//! let query = registry.find("tasks", &options)?;
//!
//! store.insert("tasks", Document::new("t1", json!({"status": "active"})))?;
//! let chunk = query.recv()?;
//! ```

pub mod error;
pub mod query;
pub mod reconcile;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use error::{LiveError, Result};
pub use query::{EmitterKey, Filter, QueryOptions, SortDirection, SortSpec};
pub use reconcile::{apply_moves, reconcile, Reconciliation};
pub use store::{ChangeFeed, DocumentStore, FeedEvent, MemoryStore, Pipeline};
pub use subscriptions::{
    ChangeFeedHandle, EmitterState, EngineConfig, LazyConnect, LiveQuery, SubscriptionRegistry,
};
pub use types::*;
