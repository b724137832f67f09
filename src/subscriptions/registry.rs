//! Subscription registry: reference-counted emitters over shared feeds.

use super::emitter::Emitter;
use super::feed::ChangeFeedHandle;
use super::types::{EngineConfig, LiveQuery};
use crate::error::{LiveError, Result};
use crate::query::{EmitterKey, QueryOptions};
use crate::store::DocumentStore;
use crate::types::DocumentId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long `membership` waits for an emitter to answer.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An emitter and the number of subscribers holding it.
struct EmitterRegistration {
    emitter: Emitter,
    subscriber_count: usize,
}

#[derive(Default)]
struct RegistryState {
    emitters: HashMap<EmitterKey, EmitterRegistration>,
    feeds: HashMap<String, ChangeFeedHandle>,
    shut_down: bool,
}

/// Entry point of the engine.
///
/// Equivalent queries share one emitter; all emitters on a collection share
/// one change feed. Feeds are opened before their first emitter and closed
/// after their last.
pub struct SubscriptionRegistry {
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
    state: Mutex<RegistryState>,
    next_emitter_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create a registry over `store`.
    pub fn new<S: DocumentStore>(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(RegistryState::default()),
            next_emitter_id: AtomicU64::new(1),
        }
    }

    /// Create a registry with the default configuration.
    pub fn with_defaults<S: DocumentStore>(store: Arc<S>) -> Self {
        Self::new(store, EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to a live view of `collection` under `options`.
    ///
    /// The stream starts with `Initial` chunks and `EndOfInitial`, then
    /// carries live changes. Every call must be balanced by a
    /// [`remove_emitter`](Self::remove_emitter) with equivalent options.
    pub fn find(&self, collection: &str, options: &QueryOptions) -> Result<LiveQuery> {
        options.validate()?;
        let key = EmitterKey::new(collection, options)?;

        let mut state = self.state.lock();
        if state.shut_down {
            return Err(LiveError::ShutDown);
        }

        // An emitter that died (dropped collection, failed feed) is replaced.
        let stale = state
            .emitters
            .get(&key)
            .is_some_and(|reg| !reg.emitter.is_alive());
        if stale {
            if let Some(reg) = state.emitters.remove(&key) {
                debug!(key = ?key, "replacing torn down emitter");
                Self::discard(&mut state, reg);
            }
        }

        if let Some(reg) = state.emitters.get_mut(&key) {
            let receiver = reg.emitter.subscribe()?;
            reg.subscriber_count += 1;
            debug!(key = ?key, subscribers = reg.subscriber_count, "emitter reused");
            return Ok(LiveQuery::new(key, receiver));
        }

        let feed_dead = state
            .feeds
            .get(collection)
            .is_some_and(|feed| !feed.is_alive());
        if feed_dead {
            if let Some(mut feed) = state.feeds.remove(collection) {
                feed.close();
            }
        }
        if !state.feeds.contains_key(collection) {
            let feed = ChangeFeedHandle::open(self.store.as_ref(), collection)?;
            state.feeds.insert(collection.to_string(), feed);
        }

        let id = self.next_emitter_id.fetch_add(1, Ordering::SeqCst);
        let emitter = match Emitter::spawn(
            id,
            key.clone(),
            options.normalized(),
            Arc::clone(&self.store),
            &self.config,
        ) {
            Ok(emitter) => emitter,
            Err(e) => {
                Self::release_feed_if_unused(&mut state, collection);
                return Err(e);
            }
        };

        // Attach before the first subscribe so no write can fall between the
        // initial snapshot and the live tail.
        if let Some(feed) = state.feeds.get(collection) {
            feed.attach(id, emitter.inbox());
        }
        let receiver = match emitter.subscribe() {
            Ok(receiver) => receiver,
            Err(e) => {
                if let Some(feed) = state.feeds.get(collection) {
                    feed.detach(id);
                }
                drop(emitter);
                Self::release_feed_if_unused(&mut state, collection);
                return Err(e);
            }
        };

        state.emitters.insert(
            key.clone(),
            EmitterRegistration {
                emitter,
                subscriber_count: 1,
            },
        );
        info!(key = ?key, emitters = state.emitters.len(), "emitter created");
        Ok(LiveQuery::new(key, receiver))
    }

    /// Release one subscription. The emitter is torn down with its last
    /// subscriber, and the collection's feed with its last emitter.
    ///
    /// Returns false if no emitter matched.
    pub fn remove_emitter(&self, collection: &str, options: &QueryOptions) -> Result<bool> {
        let key = EmitterKey::new(collection, options)?;
        let mut state = self.state.lock();

        let Some(reg) = state.emitters.get_mut(&key) else {
            return Ok(false);
        };
        reg.subscriber_count = reg.subscriber_count.saturating_sub(1);
        debug!(key = ?key, subscribers = reg.subscriber_count, "subscriber released");

        if reg.subscriber_count == 0 {
            if let Some(reg) = state.emitters.remove(&key) {
                Self::discard(&mut state, reg);
            }
        }
        Ok(true)
    }

    /// Whether an emitter exists for these options.
    pub fn does_emitter_exist(&self, collection: &str, options: &QueryOptions) -> bool {
        match EmitterKey::new(collection, options) {
            Ok(key) => self.state.lock().emitters.contains_key(&key),
            Err(_) => false,
        }
    }

    /// Subscriber count of the matching emitter (0 if none).
    pub fn subscriber_count(&self, collection: &str, options: &QueryOptions) -> usize {
        let Ok(key) = EmitterKey::new(collection, options) else {
            return 0;
        };
        self.state
            .lock()
            .emitters
            .get(&key)
            .map_or(0, |reg| reg.subscriber_count)
    }

    /// Number of live emitters.
    pub fn emitter_count(&self) -> usize {
        self.state.lock().emitters.len()
    }

    /// Number of open change-feed handles.
    pub fn feed_count(&self) -> usize {
        self.state.lock().feeds.len()
    }

    /// Current membership of the matching emitter, in view order.
    pub fn membership(
        &self,
        collection: &str,
        options: &QueryOptions,
    ) -> Result<Option<Vec<DocumentId>>> {
        let key = EmitterKey::new(collection, options)?;
        // Grab the inbox and release the lock before waiting on the worker.
        let inbox = {
            let state = self.state.lock();
            match state.emitters.get(&key) {
                Some(reg) => reg.emitter.inbox(),
                None => return Ok(None),
            }
        };
        let (tx, rx) = crossbeam_channel::bounded(1);
        if inbox.send(super::emitter::Command::Inspect(tx)).is_err() {
            return Ok(None);
        }
        Ok(rx.recv_timeout(INSPECT_TIMEOUT).ok())
    }

    /// Tear down every emitter and close every feed. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;

        let emitters: Vec<EmitterRegistration> =
            state.emitters.drain().map(|(_, reg)| reg).collect();
        let count = emitters.len();
        for reg in emitters {
            Self::discard(&mut state, reg);
        }
        for (_, mut feed) in state.feeds.drain() {
            feed.close();
        }
        info!(emitters = count, "subscription registry shut down");
    }

    /// Destroy an emitter, then its feed if nothing else uses it.
    fn discard(state: &mut RegistryState, mut reg: EmitterRegistration) {
        let collection = reg.emitter.key().collection().to_string();
        if let Some(feed) = state.feeds.get(&collection) {
            feed.detach(reg.emitter.id());
        }
        reg.emitter.shutdown();
        Self::release_feed_if_unused(state, &collection);
    }

    fn release_feed_if_unused(state: &mut RegistryState, collection: &str) {
        let in_use = state
            .emitters
            .keys()
            .any(|key| key.collection() == collection);
        if in_use {
            return;
        }
        if let Some(mut feed) = state.feeds.remove(collection) {
            feed.close();
            debug!(collection, "change feed released");
        }
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
