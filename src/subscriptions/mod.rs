//! Live query subscriptions.
//!
//! This module turns a collection's change feed into per-query live views:
//! - One emitter per distinct (collection, options), shared by subscribers
//! - One change feed per collection, shared by emitters
//! - Initial snapshot on first subscribe, replayed to late subscribers
//! - Coalesced re-ranking for sorted or windowed views
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(MemoryStore::new());
//! let registry = SubscriptionRegistry::with_defaults(Arc::clone(&store));
//!
//! let options = QueryOptions::new()
//!     .filter(json!({"status": "active"}))
//!     .sort("created_at", SortDirection::Desc)
//!     .limit(20);
//! let query = registry.find("tasks", &options)?;
//!
//! for chunk in query.iter() {
//!     match chunk {
//!         StreamChunk::Initial { document } => println!("initial {}", document.id()),
//!         StreamChunk::EndOfInitial => println!("now live"),
//!         StreamChunk::Order { sequence, .. } => println!("order {:?}", sequence),
//!         StreamChunk::Error { message } => break,
//!         other => println!("{:?}", other),
//!     }
//! }
//!
//! registry.remove_emitter("tasks", &options)?;
//! ```

mod coalesce;
mod emitter;
mod feed;
mod multicast;
mod registry;
mod types;

pub use coalesce::Coalescer;
pub use emitter::{Command, Emitter};
pub use feed::ChangeFeedHandle;
pub use multicast::{Attach, LazyConnect};
pub use registry::SubscriptionRegistry;
pub use types::{EmitterState, EngineConfig, LiveQuery};
